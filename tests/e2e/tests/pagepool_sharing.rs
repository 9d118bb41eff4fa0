//! Page-pool behavior across independent mappings of one segment
//!
//! Two `PagePool` values attached to the same segment file behave like two
//! processes: separate mappings, shared atomics. The racers below hammer
//! pop/push from both sides and assert no page is ever held twice.

use pagepool::{PagePool, PoolId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn racing_mappings_never_hand_out_a_page_twice() {
    const CAPACITY: u32 = 32;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("io-pages.shm");
    let creator = Arc::new(PagePool::create(&path, PoolId(1), CAPACITY, 512).unwrap());
    let attacher = Arc::new(PagePool::attach(&path, PoolId(1)).unwrap());

    let stop = Arc::new(AtomicBool::new(false));
    let owned: Arc<Vec<AtomicBool>> =
        Arc::new((0..CAPACITY).map(|_| AtomicBool::new(false)).collect());

    let mut racers = Vec::new();
    for side in 0..2 {
        for _ in 0..2 {
            let pool = if side == 0 {
                Arc::clone(&creator)
            } else {
                Arc::clone(&attacher)
            };
            let stop = Arc::clone(&stop);
            let owned = Arc::clone(&owned);
            racers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(mut page) = pool.pop() {
                        let flag = &owned[(page.number - 1) as usize];
                        assert!(
                            !flag.swap(true, Ordering::SeqCst),
                            "page {page} held by two racers at once"
                        );
                        // Touch the payload while we exclusively own it.
                        // SAFETY: the popped capability is unique.
                        unsafe {
                            pool.page_bytes_mut(&page)[0] = page.number as u8;
                        }
                        flag.store(false, Ordering::SeqCst);
                        pool.push(&mut page);
                    }
                }
            }));
        }
    }

    thread::sleep(Duration::from_millis(200));
    stop.store(true, Ordering::SeqCst);
    for racer in racers {
        racer.join().unwrap();
    }

    // Quiesced: the full page set drains from either mapping.
    let drained: HashSet<u32> = (0..CAPACITY).map(|_| attacher.pop().unwrap().number).collect();
    assert_eq!(drained.len(), CAPACITY as usize);
    assert_eq!(creator.pop(), None);
}

#[test]
fn payload_written_through_one_mapping_reads_through_another() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache-pages.shm");
    let writer = PagePool::create(&path, PoolId(2), 8, 256).unwrap();
    let reader = PagePool::attach(&path, PoolId(2)).unwrap();

    let mut page = writer.pop().unwrap();
    // SAFETY: unique capability for this page
    unsafe {
        writer.page_bytes_mut(&page)[..11].copy_from_slice(b"hot object!");
    }
    // SAFETY: same capability, other mapping; the writer slice is gone
    let seen = unsafe { reader.page_bytes_mut(&page)[..11].to_vec() };
    assert_eq!(seen, b"hot object!");
    writer.push(&mut page);
}
