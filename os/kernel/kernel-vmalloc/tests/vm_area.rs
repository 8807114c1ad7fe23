mod common;

use common::{P, PoolPages, RecordingEngine, config, vm};
use kernel_vmalloc::{
    AreaOwner, MapError, Misuse, PageSupplier, PhysicalFrame, Protection, VmFlags, VmallocContext,
    VmallocError,
};
use std::sync::atomic::Ordering;
use std::thread;

const LARGE: u64 = 2 << 20;

#[test]
fn vmalloc_maps_pages_behind_a_guard() {
    let vm = vm(1);
    let addr = vm.vmalloc(0, 3 * P - 100, Protection::kernel()).unwrap();

    let area = vm.find_vm_area(addr + P).unwrap();
    assert_eq!(area.addr(), addr);
    assert_eq!(area.size, 3 * P);
    assert_eq!(area.range.size(), 4 * P, "one guard page");
    assert!(area.flags.contains(VmFlags::ALLOC));
    assert!(!area.flags.contains(VmFlags::UNINITIALIZED));
    assert_eq!(area.nr_pages(), 3);

    assert_eq!(vm.engine().mapped_pages(), 3);
    assert!(vm.engine().translate(addr + 2 * P).is_some());
    assert!(vm.engine().translate(addr + 3 * P).is_none(), "guard stays unmapped");
    assert_eq!(vm.vmalloc_nr_pages(), 3);
    assert_eq!(vm.page_supplier().outstanding(), 3);
    assert!(matches!(
        vm.busy_areas()[0].owner,
        AreaOwner::VmArea(id) if id == area.id
    ));

    vm.vfree(addr).unwrap();
    assert_eq!(vm.engine().mapped_pages(), 0);
    assert_eq!(vm.page_supplier().outstanding(), 0);
    assert_eq!(vm.vmalloc_nr_pages(), 0);
    assert!(vm.find_vm_area(addr).is_none());
    assert_eq!(vm.purgatory_areas()[0].range, area.range);
    vm.check_invariants().unwrap();
}

#[test]
fn vfree_rejects_bad_addresses() {
    let vm = vm(1);
    let addr = vm.vmalloc(0, P, Protection::kernel()).unwrap();
    assert!(matches!(
        vm.vfree(addr + 12),
        Err(VmallocError::CallerMisuse(Misuse::Misaligned { .. }))
    ));
    assert_eq!(
        vm.vfree(addr + P),
        Err(VmallocError::CallerMisuse(Misuse::UnknownAddress(addr + P)))
    );
    vm.vfree(addr).unwrap();
    assert_eq!(
        vm.vfree(addr),
        Err(VmallocError::CallerMisuse(Misuse::UnknownAddress(addr)))
    );
    assert_eq!(
        vm.vmalloc(0, 0, Protection::kernel()),
        Err(VmallocError::CallerMisuse(Misuse::ZeroSize))
    );
}

#[test]
fn large_request_uses_large_mapping() {
    let vm = vm(1);
    vm.engine().allow_large.store(true, Ordering::Release);

    let addr = vm.vmalloc(0, 2 * LARGE, Protection::kernel()).unwrap();
    assert_eq!(addr % LARGE, 0);
    assert_eq!(vm.engine().large_attempts.load(Ordering::Acquire), 1);

    let area = vm.find_vm_area(addr).unwrap();
    assert_eq!(area.page_order, 9);
    assert_eq!(area.frames.len(), 2);
    assert_eq!(vm.vmalloc_nr_pages(), 1024);
    assert_eq!(vm.engine().mapped_pages(), 1024);

    vm.vfree(addr).unwrap();
    assert_eq!(vm.page_supplier().outstanding(), 0);
    assert_eq!(vm.vmalloc_nr_pages(), 0);
}

#[test]
fn refused_large_mapping_falls_back_once() {
    let vm = vm(1);
    let addr = vm.vmalloc(0, LARGE + 4 * P, Protection::kernel()).unwrap();

    assert_eq!(vm.engine().large_attempts.load(Ordering::Acquire), 1);
    let area = vm.find_vm_area(addr).unwrap();
    assert_eq!(area.page_order, 0);
    assert_eq!(area.size, LARGE + 4 * P);
    assert_eq!(vm.page_supplier().outstanding(), 516, "large frames were returned");
    assert_eq!(vm.busy_areas().len(), 1, "the large reservation was undone");
    assert!(vm.purgatory_areas().is_empty());
    vm.check_invariants().unwrap();
}

#[test]
fn missing_large_frames_fall_back_without_mapping_attempt() {
    let vm = vm(1);
    vm.page_supplier().refuse_large.store(true, Ordering::Release);
    vm.engine().allow_large.store(true, Ordering::Release);

    let addr = vm.vmalloc(0, LARGE, Protection::kernel()).unwrap();
    assert_eq!(vm.engine().large_attempts.load(Ordering::Acquire), 0);
    assert_eq!(vm.find_vm_area(addr).unwrap().page_order, 0);
    vm.check_invariants().unwrap();
}

#[test]
fn large_mappings_can_be_disabled() {
    let vm = common::vm_with(config(1).with_large_mappings(false));
    vm.engine().allow_large.store(true, Ordering::Release);
    vm.vmalloc(0, LARGE, Protection::kernel()).unwrap();
    assert_eq!(vm.engine().large_attempts.load(Ordering::Acquire), 0);

    let vm = common::vm(1);
    vm.engine().allow_large.store(true, Ordering::Release);
    vm.vmalloc_range(
        0,
        LARGE,
        P,
        vm.config().range,
        Protection::kernel(),
        VmFlags::NO_HUGE_VMAP,
    )
    .unwrap();
    assert_eq!(vm.engine().large_attempts.load(Ordering::Acquire), 0);
}

#[test]
fn page_shortage_unwinds_everything() {
    let vm = VmallocContext::init(config(1), RecordingEngine::default(), PoolPages::new(8)).unwrap();

    assert_eq!(
        vm.vmalloc(0, 16 * P, Protection::kernel()),
        Err(VmallocError::OutOfMemory),
        "more than the supplier could ever provide"
    );

    let kept = vm.vmalloc(0, 6 * P, Protection::kernel()).unwrap();
    assert_eq!(
        vm.vmalloc(0, 4 * P, Protection::kernel()),
        Err(VmallocError::OutOfMemory)
    );
    assert_eq!(vm.page_supplier().outstanding(), 6);
    assert_eq!(vm.busy_areas().len(), 1);
    assert!(vm.find_vm_area(kept).is_some());
    vm.check_invariants().unwrap();
}

#[test]
fn mapping_failure_unwinds_everything() {
    let vm = vm(1);
    vm.engine().fail_maps.store(1, Ordering::Release);
    assert_eq!(
        vm.vmalloc(0, 4 * P, Protection::kernel()),
        Err(VmallocError::Mapping(MapError::OutOfTableMemory))
    );
    assert_eq!(vm.page_supplier().outstanding(), 0);
    assert!(vm.busy_areas().is_empty());
    assert!(vm.purgatory_areas().is_empty());
    vm.check_invariants().unwrap();
}

#[test]
fn vmap_maps_caller_frames() {
    let vm = vm(1);
    let frames = [PhysicalFrame::page(0x7000), PhysicalFrame::page(0x3000)];
    let addr = vm.vmap(0, &frames, VmFlags::empty(), Protection::kernel_ro()).unwrap();

    assert_eq!(vm.engine().translate(addr), Some(0x7000));
    assert_eq!(vm.engine().translate(addr + P), Some(0x3000));
    let area = vm.find_vm_area(addr).unwrap();
    assert!(area.flags.contains(VmFlags::MAP));
    assert!(area.frames.is_empty(), "caller keeps the frames");

    vm.vunmap(addr).unwrap();
    assert_eq!(vm.engine().mapped_pages(), 0);
    vm.check_invariants().unwrap();
}

#[test]
fn vmap_can_take_ownership_of_frames() {
    let vm = vm(1);
    let supplier = vm.page_supplier();
    let frames: Vec<PhysicalFrame> = (0..3).map(|_| supplier.alloc_frame(0).unwrap()).collect();
    let addr = vm
        .vmap(0, &frames, VmFlags::MAP_PUT_PAGES | VmFlags::NO_GUARD, Protection::kernel())
        .unwrap();
    assert_eq!(vm.find_vm_area(addr).unwrap().range.size(), 3 * P);

    vm.vfree(addr).unwrap();
    assert_eq!(supplier.outstanding(), 0);
    assert_eq!(vm.vmalloc_nr_pages(), 0, "vmap areas are not counted as vmalloc pages");
}

#[test]
fn vmap_failure_leaves_nothing_reserved() {
    let vm = vm(1);
    assert!(matches!(
        vm.vmap(0, &[], VmFlags::empty(), Protection::kernel()),
        Err(VmallocError::CallerMisuse(Misuse::ZeroSize))
    ));
    vm.engine().fail_maps.store(1, Ordering::Release);
    assert!(
        vm.vmap(0, &[PhysicalFrame::page(0)], VmFlags::empty(), Protection::kernel())
            .is_err()
    );
    assert!(vm.busy_areas().is_empty());
    vm.check_invariants().unwrap();
}

#[test]
fn get_vm_area_reserves_without_mapping() {
    let vm = vm(1);
    let window = vm.config().range;
    let area = vm.get_vm_area(0, 5 * P, 16 * P, VmFlags::IOREMAP, window).unwrap();
    assert_eq!(area.addr() % (16 * P), 0);
    assert!(area.flags.contains(VmFlags::UNINITIALIZED | VmFlags::IOREMAP));
    assert_eq!(vm.engine().mapped_pages(), 0);
    assert_eq!(vm.find_vm_area(area.addr()), Some(area.clone()));

    vm.vunmap(area.addr()).unwrap();
    assert!(vm.find_vm_area(area.addr()).is_none());
}

#[test]
fn vm_map_ram_picks_the_path_by_size() {
    let vm = vm(1);
    let small: Vec<PhysicalFrame> = (0..4).map(|i| PhysicalFrame::page(i * P)).collect();
    let big: Vec<PhysicalFrame> = (0..100).map(|i| PhysicalFrame::page(i * P)).collect();

    let a = vm.vm_map_ram(0, &small, Protection::kernel()).unwrap();
    let b = vm.vm_map_ram(0, &big, Protection::kernel()).unwrap();
    assert_eq!(vm.nr_blocks(), 1);
    assert!(vm.busy_areas().iter().any(|x| x.owner == AreaOwner::Block));
    assert!(
        vm.busy_areas()
            .iter()
            .any(|x| x.owner == AreaOwner::Unowned && x.range.start == b)
    );
    assert_eq!(vm.engine().mapped_pages(), 104);
    assert_eq!(vm.find_vm_area(b), None, "no descriptor behind vm_map_ram");

    vm.vm_unmap_ram(a, 4).unwrap();
    vm.vm_unmap_ram(b, 100).unwrap();
    assert_eq!(vm.engine().mapped_pages(), 0);
    assert_eq!(vm.purgatory_areas().len(), 1);
    vm.check_invariants().unwrap();
}

#[test]
fn vm_map_ram_failure_releases_the_slot() {
    let vm = vm(1);
    vm.engine().fail_maps.store(1, Ordering::Release);
    let frames = [PhysicalFrame::page(0)];
    assert!(vm.vm_map_ram(0, &frames, Protection::kernel()).is_err());
    assert_eq!(vm.engine().unmaps.lock().unwrap().len(), 1, "slot was unwound");
    let addr = vm.vm_map_ram(0, &frames, Protection::kernel()).unwrap();
    assert_eq!(vm.nr_blocks(), 2, "the unwound block no longer serves");
    assert_eq!(vm.engine().translate(addr), Some(0));
    vm.check_invariants().unwrap();
}

#[test]
fn vm_unmap_ram_only_takes_its_own_intervals() {
    let vm = vm(1);
    assert_eq!(
        vm.vm_unmap_ram(common::BASE, 0),
        Err(VmallocError::CallerMisuse(Misuse::ZeroSize))
    );

    let addr = vm.vmalloc(0, 100 * P, Protection::kernel()).unwrap();
    assert_eq!(
        vm.vm_unmap_ram(addr, 100),
        Err(VmallocError::CallerMisuse(Misuse::UnknownAddress(addr)))
    );
    assert!(vm.find_vm_area(addr).is_some());
    assert_eq!(vm.engine().mapped_pages(), 100);

    let big: Vec<PhysicalFrame> = (0..100).map(|i| PhysicalFrame::page(i * P)).collect();
    let b = vm.vm_map_ram(0, &big, Protection::kernel()).unwrap();
    assert_eq!(
        vm.vm_unmap_ram(b, 80),
        Err(VmallocError::CallerMisuse(Misuse::UnknownAddress(b)))
    );
    assert_eq!(vm.engine().mapped_pages(), 200);
    vm.vm_unmap_ram(b, 100).unwrap();
    vm.vfree(addr).unwrap();
    assert_eq!(vm.engine().mapped_pages(), 0);
    vm.check_invariants().unwrap();
}

#[test]
fn deferred_frees_from_other_threads() {
    let vm = vm(4);
    let addrs: Vec<u64> = (0..32)
        .map(|i| vm.vmalloc(i % 4, P * (1 + i as u64 % 3), Protection::kernel()).unwrap())
        .collect();
    let first_pushes: Vec<bool> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let vm = &vm;
                let mine: Vec<u64> = addrs.iter().copied().skip(w).step_by(4).collect();
                s.spawn(move || {
                    mine.iter()
                        .map(|&a| vm.vfree_atomic(w, a).unwrap())
                        .collect::<Vec<bool>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });
    assert_eq!(
        first_pushes.iter().filter(|&&b| b).count(),
        4,
        "one wake-up per worker queue"
    );
    assert_eq!(vm.find_vm_area(addrs[0]).map(|a| a.addr()), Some(addrs[0]));

    assert_eq!(vm.drain_deferred(), 32);
    assert_eq!(vm.drain_deferred(), 0);
    assert!(addrs.iter().all(|&a| vm.find_vm_area(a).is_none()));
    assert_eq!(vm.page_supplier().outstanding(), 0);
    assert_eq!(vm.vfree_atomic(0, 0), Ok(false));
    assert_eq!(
        vm.vfree_atomic(9, 0x1000),
        Err(VmallocError::CallerMisuse(Misuse::UnknownWorker(9)))
    );
    vm.check_invariants().unwrap();
}

#[test]
fn shutdown_drains_deferred_frees() {
    let vm = vm(2);
    let addr = vm.vmalloc(1, P, Protection::kernel()).unwrap();
    assert!(vm.vfree_atomic(1, addr).unwrap());
    let report = vm.shutdown();
    assert_eq!(report.drained, 1);
    assert_eq!(report.live_areas, 0);
}
