use kernel_sync::{SpinMutex, TicketMutex};
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn lock_and_raii() {
    let l = SpinMutex::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = TicketMutex::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_value() {
    let l = SpinMutex::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(l.with_lock(|s| s.clone()), "ab");
}

#[test]
fn into_inner_and_get_mut() {
    let mut l = TicketMutex::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.into_inner(), [1, 2, 3, 4]);
}

fn hammer<M, F>(lock: Arc<M>, with: F)
where
    M: Send + Sync + 'static,
    F: Fn(&M, &dyn Fn(&mut usize)) + Send + Sync + Copy + 'static,
{
    let threads = 8;
    let iters = 2_000;
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    with(&*lock, &|v: &mut usize| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn contended_spin_increments_are_exact() {
    let lock = Arc::new(SpinMutex::new(0usize));
    hammer(Arc::clone(&lock), |m: &SpinMutex<usize>, f| m.with_lock(|v| f(v)));
    assert_eq!(lock.with_lock(|v| *v), 8 * 2_000);
}

#[test]
fn contended_ticket_increments_are_exact() {
    let lock = Arc::new(TicketMutex::new(0usize));
    hammer(Arc::clone(&lock), |m: &TicketMutex<usize>, f| m.with_lock(|v| f(v)));
    assert_eq!(lock.with_lock(|v| *v), 8 * 2_000);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn mutex_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinMutex::new(0u8));
    takes_sync(&TicketMutex::new(0u8));
}
