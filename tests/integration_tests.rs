//! Integration tests for shadowheap.

use shadowheap::diagnostics::suppress_diagnostics;
use shadowheap::{
    AccessMode, BadAccessKind, BlockLayout, CollectingSink, DiagnosticSink, GuardedHeap,
    HeapConfig, HeapError, HeapId, ShadowMarker, StackCapture,
};
use std::sync::Arc;
use std::thread;

fn heap() -> GuardedHeap {
    suppress_diagnostics(true);
    GuardedHeap::new(HeapConfig::minimal()).unwrap()
}

fn block_size_of(heap: &GuardedHeap, ptr: *mut u8) -> usize {
    let blocks = heap.blocks();
    let header = blocks.user_pointer_to_header(ptr as usize).unwrap();
    blocks.block_info(header).unwrap().block_size
}

fn body_hash(ptr: *const u8, size: usize) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    let mut hasher = DefaultHasher::new();
    // SAFETY: the caller passes a body that is still in the arena.
    hasher.write(unsafe { std::slice::from_raw_parts(ptr, size) });
    hasher.finish()
}

#[test]
fn test_boundary_poisoning() {
    let heap = heap();
    for size in [0usize, 1, 13, 100, 134584] {
        let ptr = heap.allocate(size, 0);
        assert!(!ptr.is_null(), "size {}", size);
        let addr = ptr as usize;
        let shadow = heap.shadow();

        assert!(!shadow.is_accessible(addr - 1), "size {}", size);
        assert!(!shadow.is_accessible(addr + size), "size {}", size);
        assert!(shadow.is_range_accessible(addr, size), "size {}", size);
        assert_eq!(heap.query_size(ptr), Some(size));
    }
}

#[test]
fn test_alignment_is_honored() {
    let heap = heap();
    for alignment in [8usize, 16, 64, 256, 4096] {
        let ptr = heap.allocate(24, alignment);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % alignment, 0, "alignment {}", alignment);
        assert!(!heap.shadow().is_accessible(ptr as usize - 1));
    }
    assert!(heap.allocate(24, 48).is_null());
}

#[test]
fn test_freed_range_poisoning() {
    let heap = heap();
    let size = 100;
    let ptr = heap.allocate(size, 0);
    heap.free(ptr).unwrap();

    let addr = ptr as usize;
    for byte in addr - 1..=addr + size {
        assert!(!heap.shadow().is_accessible(byte));
        assert_eq!(heap.shadow().marker_for(byte), ShadowMarker::FREED);
    }
}

#[test]
fn test_content_preserved_through_quarantine() {
    let heap = heap();
    let size = 256;
    let ptr = heap.allocate(size, 0);
    for i in 0..size {
        // SAFETY: inside the body.
        unsafe { *ptr.add(i) = (i * 7) as u8 };
    }

    let before = body_hash(ptr, size);
    heap.free(ptr).unwrap();
    let after = body_hash(ptr, size);
    assert_eq!(before, after);
}

#[test]
fn test_quarantine_fifo_and_bound() {
    let heap = heap();
    let ptrs: Vec<*mut u8> = (0..10).map(|_| heap.allocate(100, 0)).collect();
    let block_size = block_size_of(&heap, ptrs[0]);

    heap.set_quarantine_max_size(3 * block_size);
    for &ptr in &ptrs {
        heap.free(ptr).unwrap();
    }

    let stats = heap.stats();
    assert_eq!(stats.quarantine_count, 3);
    assert_eq!(stats.quarantine_bytes, 3 * block_size);
    assert_eq!(stats.quarantine_evictions, 7);

    // Oldest blocks left the quarantine and went back to the arena.
    for &ptr in &ptrs[..7] {
        assert_eq!(heap.shadow().marker_for(ptr as usize), ShadowMarker::RESERVED);
    }
    for &ptr in &ptrs[7..] {
        assert_eq!(heap.shadow().marker_for(ptr as usize), ShadowMarker::FREED);
    }

    // Shrinking evicts from the front until the budget holds.
    heap.set_quarantine_max_size(block_size);
    assert_eq!(heap.stats().quarantine_count, 1);
    assert_eq!(heap.shadow().marker_for(ptrs[8] as usize), ShadowMarker::RESERVED);
    assert_eq!(heap.shadow().marker_for(ptrs[9] as usize), ShadowMarker::FREED);
}

#[test]
fn test_zero_quarantine_releases_immediately() {
    suppress_diagnostics(true);
    let heap = GuardedHeap::new(HeapConfig::minimal().with_quarantine_size(0)).unwrap();
    let ptr = heap.allocate(64, 0);
    heap.free(ptr).unwrap();
    assert_eq!(heap.stats().quarantine_count, 0);
    assert_eq!(heap.stats().arena_bytes, 0);
}

#[test]
fn test_zero_size_allocations_are_unique() {
    let heap = heap();
    let a = heap.allocate(0, 0);
    let b = heap.allocate(0, 0);
    assert!(!a.is_null());
    assert!(!b.is_null());
    assert_ne!(a, b);
}

#[test]
fn test_resize_round_trip() {
    let heap = heap();
    let old_size = 100;
    let ptr = heap.allocate(old_size, 0);
    for i in 0..old_size {
        // SAFETY: inside the body.
        unsafe { *ptr.add(i) = i as u8 };
    }

    for new_size in [50usize, 300] {
        let src = heap.allocate(old_size, 0);
        // SAFETY: both bodies hold `old_size` bytes.
        unsafe { std::ptr::copy_nonoverlapping(ptr, src, old_size) };

        let resized = heap.resize(src, new_size);
        assert!(!resized.is_null());
        assert_ne!(resized, src);

        let kept = old_size.min(new_size);
        // SAFETY: inside the new body.
        let content = unsafe { std::slice::from_raw_parts(resized, kept) };
        assert!(content.iter().enumerate().all(|(i, &b)| b == i as u8));

        for byte in src as usize..src as usize + old_size {
            assert!(!heap.shadow().is_accessible(byte));
        }
        assert!(heap.shadow().is_range_accessible(resized as usize, new_size));
        assert!(!heap.shadow().is_accessible(resized as usize + new_size));
        assert_eq!(heap.query_size(resized), Some(new_size));
        assert_eq!(heap.query_size(src), None);
    }
}

#[test]
fn test_resize_null_allocates() {
    let heap = heap();
    let ptr = heap.resize(std::ptr::null_mut(), 40);
    assert!(!ptr.is_null());
    assert_eq!(heap.query_size(ptr), Some(40));
}

#[test]
fn test_double_free_detected() {
    let heap = heap();
    let sink = Arc::new(CollectingSink::new());
    heap.set_heap_error_sink(sink.clone());

    let ptr = heap.allocate(32, 0);
    assert_eq!(heap.free(ptr), Ok(()));
    assert_eq!(heap.free(ptr), Err(HeapError::DoubleFree(ptr as usize)));

    let report = sink.last().unwrap();
    assert_eq!(report.kind, BadAccessKind::DoubleFree);
    assert!(report.free_stack.is_some());
    assert_eq!(heap.stats().errors_reported, 1);
}

#[test]
fn test_free_of_foreign_pointer() {
    let heap = heap();
    let mut local = [0u64; 4];
    let ptr = local.as_mut_ptr() as *mut u8;
    assert_eq!(heap.free(ptr), Err(HeapError::InvalidPointer(ptr as usize)));
    assert_eq!(heap.free(std::ptr::null_mut()), Ok(()));
}

#[test]
fn test_nested_containment() {
    let heap = heap();
    let blocks = heap.blocks();
    let outer_ptr = heap.allocate(2048, 0);
    let outer = blocks
        .block_info(blocks.user_pointer_to_header(outer_ptr as usize).unwrap())
        .unwrap();

    let layout = BlockLayout::compute(64, 8, 0, 0).unwrap();
    let stack = StackCapture::from_frames(vec![0x1000, 0x2000]);
    // SAFETY: both blocks are carved from the outer body.
    let inner1 = unsafe { blocks.initialize_block(outer.body, &layout, true, 0, &stack) };
    let inner2 = unsafe { blocks.initialize_block(outer.body + 1024, &layout, true, 0, &stack) };

    assert_eq!(blocks.find_containing_block(&inner1), Some(outer));
    assert_eq!(blocks.find_containing_block(&inner2), Some(outer));
    assert_eq!(heap.free(inner1.body as *mut u8), Err(HeapError::ForeignBlock(inner1.body)));

    heap.free(outer_ptr).unwrap();
    assert_eq!(blocks.find_containing_freed_block(&inner1), Some(outer));
    assert_eq!(blocks.find_containing_freed_block(&inner2), Some(outer));

    let report = heap.classify_access(inner1.body, AccessMode::Read, 4);
    assert_eq!(report.kind, BadAccessKind::UseAfterFree);
    assert!(report.free_stack.is_some());
}

#[test]
fn test_access_classification_end_to_end() {
    let heap = heap();
    let ptr = heap.allocate(100, 0);
    let addr = ptr as usize;

    let overflow = heap.classify_access(addr + 101, AccessMode::Read, 1);
    assert_eq!(overflow.kind, BadAccessKind::HeapBufferOverflow);
    assert!(overflow.shadow_info.contains("beyond"));

    let underflow = heap.classify_access(addr - 4, AccessMode::Write, 4);
    assert_eq!(underflow.kind, BadAccessKind::HeapBufferUnderflow);

    let free_stack = StackCapture::from_frames(vec![0xdead_0000, 0xbeef_0000, 0xf00d_0000]);
    heap.free_in(HeapId::PROCESS, ptr, Some(free_stack.clone())).unwrap();

    let report = heap.classify_access(addr, AccessMode::Read, 4);
    assert_eq!(report.kind, BadAccessKind::UseAfterFree);
    assert_eq!(report.free_stack.as_deref(), Some(&free_stack));
    assert!(report.alloc_stack.is_some());
    assert_ne!(report.free_tid, 0);
    assert!(report.shadow_memory.contains("=>"));
    assert!(report.to_string().contains("heap-use-after-free"));
}

#[test]
fn test_wild_access_above_arena() {
    let heap = heap();
    let report = heap.classify_access(usize::MAX - 16, AccessMode::Read, 8);
    assert_eq!(report.kind, BadAccessKind::WildAccess);

    let guard = heap.shadow().lower_bound();
    let report = heap.classify_access(guard + 8, AccessMode::Read, 8);
    assert_eq!(report.kind, BadAccessKind::InvalidAddress);
}

#[test]
fn test_report_bad_access_reaches_callback() {
    let heap = heap();
    let sink = Arc::new(CollectingSink::new());
    let seen = sink.clone();
    heap.set_heap_error_callback(move |info| seen.report(info));

    let ptr = heap.allocate(8, 0);
    let report = heap.report_bad_access(ptr as usize + 8, AccessMode::Write, 1);
    assert_eq!(report.kind, BadAccessKind::HeapBufferOverflow);
    assert_eq!(sink.kinds(), vec![BadAccessKind::HeapBufferOverflow]);
}

#[test]
fn test_logical_heaps() {
    let heap = heap();
    let a = heap.create_heap();
    let b = heap.create_heap();
    assert_ne!(a, b);

    let ptr = heap.allocate_in(a, 64, 16, None);
    assert!(!ptr.is_null());
    assert!(matches!(
        heap.free_in(b, ptr, None),
        Err(HeapError::WrongHeap { owner, requested, .. }) if owner == a && requested == b
    ));

    let quarantined = heap.allocate_in(a, 64, 0, None);
    heap.free_in(a, quarantined, None).unwrap();
    let survivor = heap.allocate_in(b, 64, 0, None);

    heap.destroy_heap(a).unwrap();
    assert_eq!(heap.query_size(ptr), None);
    assert_eq!(heap.query_size(survivor), Some(64));
    assert_eq!(heap.stats().quarantine_count, 0);
    assert_eq!(heap.shadow().marker_for(ptr as usize), ShadowMarker::RESERVED);

    assert!(heap.allocate_in(a, 8, 0, None).is_null());
    assert_eq!(heap.destroy_heap(a), Err(HeapError::UnknownHeap(a)));
    assert_eq!(heap.destroy_heap(HeapId::PROCESS), Err(HeapError::ProcessHeap));
}

#[test]
fn test_unguarded_pass_through() {
    suppress_diagnostics(true);
    let heap = GuardedHeap::new(HeapConfig::minimal().with_allocation_guard_rate(0.0)).unwrap();

    let ptr = heap.allocate(40, 0);
    assert!(!ptr.is_null());
    assert_eq!(heap.query_size(ptr), Some(40));
    assert_eq!(heap.stats().unguarded_allocations, 1);

    let grown = heap.resize(ptr, 80);
    assert!(!grown.is_null());
    assert_eq!(heap.query_size(ptr), None);
    heap.free(grown).unwrap();
    assert_eq!(heap.stats().live_blocks, 0);
}

#[test]
fn test_check_heap_finds_corruption() {
    let heap = heap();
    let sink = Arc::new(CollectingSink::new());
    heap.set_heap_error_sink(sink.clone());

    let ptr = heap.allocate(48, 0);
    let other = heap.allocate(48, 0);
    assert!(heap.check_heap().is_empty());

    let header = heap.blocks().user_pointer_to_header(ptr as usize).unwrap();
    // SAFETY: the header of a live block; magic lives in its first bytes.
    unsafe { *(header as *mut u8) ^= 0xFF };

    let ranges = heap.check_heap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].address, header);
    assert_eq!(ranges[0].block_count, 1);

    let report = heap.report_bad_access(other as usize + 48, AccessMode::Read, 1);
    assert!(report.heap_is_corrupt);
    assert_eq!(report.corrupt_ranges, ranges);
}

#[test]
fn test_write_after_free_reported_on_eviction() {
    let heap = heap();
    let sink = Arc::new(CollectingSink::new());
    heap.set_heap_error_sink(sink.clone());

    let ptr = heap.allocate(64, 0);
    heap.free(ptr).unwrap();
    // SAFETY: the body stays in the arena while quarantined.
    unsafe { *ptr.add(10) = 0xAB };

    assert_eq!(heap.trim_quarantine(), 0);
    heap.set_quarantine_max_size(0);
    assert_eq!(sink.kinds(), vec![BadAccessKind::CorruptBlock]);
}

#[test]
fn test_concurrent_allocate_free() {
    let heap = heap();
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let heap = heap.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let size = 8 + (i + t) % 120;
                    let ptr = heap.allocate(size, 0);
                    assert!(!ptr.is_null());
                    // SAFETY: inside the body.
                    unsafe { ptr.write_bytes(0x5A, size) };
                    heap.free(ptr).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = heap.stats();
    assert_eq!(stats.allocation_count, 800);
    assert_eq!(stats.free_count, 800);
    assert_eq!(stats.live_blocks, 0);
    assert!(heap.check_heap().is_empty());
}

#[test]
fn test_default_config_quarantines_large_blocks() {
    suppress_diagnostics(true);
    let heap = GuardedHeap::new(HeapConfig::default()).unwrap();
    let size = 2 * 1024 * 1024;
    let ptr = heap.allocate(size, 0);
    assert!(!ptr.is_null());
    heap.free(ptr).unwrap();

    let stats = heap.stats();
    assert_eq!(stats.quarantine_count, 1);
    assert_eq!(heap.shadow().marker_for(ptr as usize), ShadowMarker::FREED);
    assert_eq!(
        heap.classify_access(ptr as usize + size / 2, AccessMode::Read, 1).kind,
        BadAccessKind::UseAfterFree
    );
}

#[test]
fn test_damaged_block_keeps_access_kind() {
    let heap = heap();

    let freed = heap.allocate(100, 0);
    heap.free(freed).unwrap();
    // SAFETY: the body stays in the arena while quarantined.
    unsafe { *freed = 0x41 };
    let report = heap.classify_access(freed as usize, AccessMode::Read, 1);
    assert_eq!(report.kind, BadAccessKind::UseAfterFree);
    assert!(report.heap_is_corrupt);

    let live = heap.allocate(13, 0);
    // SAFETY: trailer padding of a live block, still arena memory.
    unsafe { *live.add(13) = 0x41 };
    let report = heap.classify_access(live as usize + 13, AccessMode::Write, 1);
    assert_eq!(report.kind, BadAccessKind::HeapBufferOverflow);
    assert_eq!(report.block.map(|b| b.body), Some(live as usize));
}

#[test]
fn test_adjacent_blocks_attribution() {
    let heap = heap();
    let first = heap.allocate(40, 0);
    let second = heap.allocate(40, 0);

    let blocks = heap.blocks();
    let first_header = blocks.user_pointer_to_header(first as usize).unwrap();
    let second_header = blocks.user_pointer_to_header(second as usize).unwrap();
    let first_info = blocks.block_info(first_header).unwrap();
    assert_eq!(first_header + first_info.block_size, second_header);

    let trailer = heap.classify_access(second_header - 1, AccessMode::Read, 1);
    assert_eq!(trailer.kind, BadAccessKind::HeapBufferOverflow);
    assert_eq!(trailer.block.map(|b| b.body), Some(first as usize));

    let header = heap.classify_access(second_header, AccessMode::Read, 1);
    assert_eq!(header.kind, BadAccessKind::HeapBufferUnderflow);
    assert_eq!(header.block.map(|b| b.body), Some(second as usize));
}

#[test]
fn test_concurrent_double_free_reports_losers() {
    let heap = heap();
    let sink = Arc::new(CollectingSink::new());
    heap.set_heap_error_sink(sink.clone());

    for _ in 0..20 {
        let addr = heap.allocate(64, 0) as usize;
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    heap.free(addr as *mut u8)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for result in results.iter().filter(|r| r.is_err()) {
            assert_eq!(*result, Err(HeapError::DoubleFree(addr)));
        }
    }

    let kinds = sink.kinds();
    assert_eq!(kinds.len(), 60);
    assert!(kinds.iter().all(|&k| k == BadAccessKind::DoubleFree));
    assert_eq!(heap.stats().free_count, 20);
}

#[test]
fn test_resize_racing_free_frees_once() {
    let heap = heap();
    for _ in 0..20 {
        let addr = heap.allocate(32, 0) as usize;
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let resizer = {
            let heap = heap.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                heap.resize(addr as *mut u8, 64) as usize
            })
        };
        barrier.wait();
        let _ = heap.free(addr as *mut u8);
        let moved = resizer.join().unwrap();

        assert_eq!(heap.query_size(addr as *const u8), None);
        if moved != 0 {
            assert_eq!(heap.query_size(moved as *const u8), Some(64));
            heap.free(moved as *mut u8).unwrap();
        }
        assert_eq!(heap.stats().live_blocks, 0);
    }
}
