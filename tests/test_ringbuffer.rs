// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Ring buffer invariants: FIFO integrity across mixed sizes and the
// physical wrap, chunk accounting, allocation limits, reference-count
// lifecycles and blocking behaviour.

mod common;

use common::unique_name;
use ringbus::{Error, RbFlags, RingBuffer};

fn shared() -> RbFlags {
    RbFlags::SHARED_PROCESS
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn fifo_order_mixed_sizes() {
    let name = unique_name("rb_fifo");
    let mut rb = RingBuffer::create(&name, 8192, shared()).expect("create");

    let sizes = [1usize, 5, 8, 300, 17, 64, 1024, 3, 500];
    for (i, &len) in sizes.iter().enumerate() {
        rb.chunk_write(&pattern(len, i as u8)).expect("write");
    }
    assert_eq!(rb.chunks_used() as usize, sizes.len());

    let mut buf = vec![0u8; 4096];
    for (i, &len) in sizes.iter().enumerate() {
        let n = rb.chunk_read(&mut buf, 0).expect("read");
        assert_eq!(n, len);
        assert_eq!(&buf[..n], &pattern(len, i as u8)[..]);
    }
    assert_eq!(rb.chunks_used(), 0);
}

#[test]
fn count_matches_writes_minus_reads() {
    let name = unique_name("rb_count");
    let mut rb = RingBuffer::create(&name, 8192, shared()).expect("create");

    let mut buf = [0u8; 128];
    for _ in 0..6 {
        rb.chunk_write(b"payload").expect("write");
    }
    for _ in 0..2 {
        rb.chunk_read(&mut buf, 0).expect("read");
    }
    assert_eq!(rb.chunks_used(), 4);
    assert!(rb.space_used() >= 4 * 8);
}

#[test]
fn alloc_fails_only_without_contiguous_space() {
    let name = unique_name("rb_alloc");
    // 4096 data bytes = 1024 words.
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");

    // Four 1000-byte chunks occupy 4 * (1 + 250) words; 20 words stay.
    for i in 0..4 {
        rb.chunk_write(&pattern(1000, i)).expect("write");
    }
    assert!(matches!(rb.chunk_alloc(1000), Err(Error::NoSpace)));

    // But a chunk that fits the remaining words is fine.
    let slot = rb.chunk_alloc(40).expect("small alloc");
    assert_eq!(slot.len(), 40);
    rb.chunk_commit(40).expect("commit");

    // A chunk bigger than the whole ring can never fit.
    let mut rb2 =
        RingBuffer::create(&unique_name("rb_alloc_big"), 4096, shared()).expect("create");
    assert!(matches!(rb2.chunk_alloc(8192), Err(Error::NoSpace)));
}

#[test]
fn zero_length_chunks_rejected() {
    let name = unique_name("rb_zero");
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");
    assert!(matches!(rb.chunk_alloc(0), Err(Error::Invalid)));
    assert!(matches!(rb.chunk_write(&[]), Err(Error::Invalid)));
}

#[test]
fn wrap_marker_restarts_at_offset_zero() {
    let name = unique_name("rb_wrap");
    // 4096 data bytes = 1024 words; a 300-byte chunk is 76 words.
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");

    for i in 0..13 {
        rb.chunk_write(&pattern(300, i)).expect("write");
    }
    // 988 words used; 36 free words sit at the tail.
    let mut buf = vec![0u8; 512];
    for i in 0..5 {
        let n = rb.chunk_read(&mut buf, 0).expect("read");
        assert_eq!(&buf[..n], &pattern(300, i)[..]);
    }

    // 200 bytes need 51 words: more than the tail, so the producer
    // writes the wrap marker and restarts at offset 0.
    rb.chunk_write(&pattern(200, 0xAA)).expect("wrapped write");
    assert_eq!(rb.write_offset(), (1 + 50) * 4);

    // The reader crosses the marker and sees every payload intact.
    for i in 5..13 {
        let n = rb.chunk_read(&mut buf, 0).expect("read");
        assert_eq!(n, 300);
        assert_eq!(&buf[..n], &pattern(300, i)[..]);
    }
    let n = rb.chunk_read(&mut buf, 0).expect("read wrapped");
    assert_eq!(n, 200);
    assert_eq!(&buf[..n], &pattern(200, 0xAA)[..]);
    assert_eq!(rb.chunks_used(), 0);
}

#[test]
fn peek_does_not_advance_reclaim_does() {
    let name = unique_name("rb_peek");
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");
    rb.chunk_write(b"first").expect("write");
    rb.chunk_write(b"second").expect("write");

    let before = rb.read_offset();
    {
        let chunk = rb.chunk_peek(0).expect("peek");
        assert_eq!(chunk, b"first");
    }
    assert_eq!(rb.read_offset(), before);
    assert_eq!(rb.chunks_used(), 2);

    rb.chunk_reclaim().expect("reclaim");
    assert_eq!(rb.chunks_used(), 1);
    let chunk = rb.chunk_peek(0).expect("peek next");
    assert_eq!(chunk, b"second");
    rb.chunk_reclaim().expect("reclaim");
}

#[test]
fn reclaim_without_peek_is_invalid() {
    let name = unique_name("rb_noclaim");
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");
    assert!(matches!(rb.chunk_reclaim(), Err(Error::Invalid)));
}

#[test]
fn uncommitted_chunks_stay_invisible() {
    let name = unique_name("rb_commit");
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");

    let slot = rb.chunk_alloc(64).expect("alloc");
    slot.fill(0x42);
    assert_eq!(rb.chunks_used(), 0);
    let mut buf = [0u8; 128];
    assert!(rb.chunk_read(&mut buf, 0).is_err());

    rb.chunk_commit(64).expect("commit");
    let n = rb.chunk_read(&mut buf, 100).expect("read");
    assert_eq!(n, 64);
    assert!(buf[..64].iter().all(|&b| b == 0x42));
}

#[test]
fn small_read_buffer_leaves_chunk_in_place() {
    let name = unique_name("rb_small");
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");
    rb.chunk_write(&pattern(256, 7)).expect("write");

    let mut tiny = [0u8; 16];
    assert!(matches!(rb.chunk_read(&mut tiny, 0), Err(Error::NoBufs)));
    assert_eq!(rb.chunks_used(), 1);

    let mut big = [0u8; 512];
    let n = rb.chunk_read(&mut big, 100).expect("retry");
    assert_eq!(n, 256);
    assert_eq!(&big[..n], &pattern(256, 7)[..]);
}

#[test]
fn timed_wait_expires_with_both_sides_attached() {
    let name = unique_name("rb_timeout");
    let mut creator = RingBuffer::create(&name, 4096, shared()).expect("create");
    let _opener = RingBuffer::open(&name, shared()).expect("open");

    let t0 = std::time::Instant::now();
    assert!(matches!(creator.chunk_peek(100), Err(Error::TimedOut)));
    assert!(t0.elapsed() >= std::time::Duration::from_millis(80));
}

#[test]
fn lone_reader_sees_shutdown_not_timeout() {
    let name = unique_name("rb_shutdown");
    let mut rb = RingBuffer::create(&name, 4096, shared()).expect("create");
    assert!(matches!(rb.chunk_peek(10), Err(Error::ShutDown)));
}

#[test]
fn refcount_lifecycle_unlinks_backing_files() {
    let name = unique_name("rb_refs");
    let rb = RingBuffer::create(&name, 4096, shared()).expect("create");
    assert_eq!(rb.refcount(), 1);

    let opener = RingBuffer::open(&name, shared()).expect("open");
    assert_eq!(rb.refcount(), 2);
    assert_eq!(opener.refcount(), 2);

    drop(opener);
    assert_eq!(rb.refcount(), 1);

    let hdr_path = format!("/dev/shm/{name}-header");
    let data_path = format!("/dev/shm/{name}-data");
    assert!(std::path::Path::new(&hdr_path).exists());
    drop(rb);
    assert!(!std::path::Path::new(&hdr_path).exists());
    assert!(!std::path::Path::new(&data_path).exists());
}

#[test]
fn create_twice_fails_with_exists() {
    let name = unique_name("rb_exists");
    let _rb = RingBuffer::create(&name, 4096, shared()).expect("create");
    assert!(matches!(
        RingBuffer::create(&name, 4096, shared()),
        Err(Error::Exists)
    ));
}

#[test]
fn cross_thread_producer_consumer() {
    let name = unique_name("rb_threads");
    let mut reader = RingBuffer::create(&name, 16384, shared()).expect("create");
    let mut writer = RingBuffer::open(&name, shared()).expect("open");

    const MSGS: usize = 500;
    let t = std::thread::spawn(move || {
        for i in 0..MSGS {
            let len = 1 + (i * 37) % 700;
            let data = pattern(len, i as u8);
            loop {
                match writer.chunk_write(&data) {
                    Ok(_) => break,
                    Err(Error::NoSpace) => std::thread::yield_now(),
                    Err(e) => panic!("write failed: {e}"),
                }
            }
        }
    });

    let mut buf = vec![0u8; 1024];
    for i in 0..MSGS {
        let len = 1 + (i * 37) % 700;
        let n = reader.chunk_read(&mut buf, 5000).expect("read");
        assert_eq!(n, len);
        assert_eq!(&buf[..n], &pattern(len, i as u8)[..]);
    }
    t.join().expect("writer thread");
}
