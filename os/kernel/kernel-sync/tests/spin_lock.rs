use kernel_sync::{SpinLock, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }

    // previous drop must have unlocked
    assert!(!l.is_locked());
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_lock_semantics() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);

    // while held, try_lock must fail
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = SpinLock::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    let got = l.with_lock(|s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn get_mut_allows_direct_mutation() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
}

fn hammer<L, F>(lock: Arc<L>, with: F) -> usize
where
    L: Send + Sync + 'static,
    F: Fn(&L, &mut dyn FnMut(&mut usize)) + Send + Sync + Copy + 'static,
{
    let threads = 8;
    let iters = 2_000;

    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                with(&*lock, &mut |v: &mut usize| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    threads * iters
}

#[test]
fn contended_spin_increments_are_exact_and_exclusive() {
    let lock = Arc::new(SpinLock::new(0usize));
    let expected = hammer(Arc::clone(&lock), |l: &SpinLock<usize>, f| {
        l.with_lock(|v| f(v));
    });
    assert_eq!(lock.with_lock(|v| *v), expected);
}

#[test]
fn contended_ticket_increments_are_exact_and_exclusive() {
    let lock = Arc::new(TicketMutex::new(0usize));
    let expected = hammer(Arc::clone(&lock), |l: &TicketMutex<usize>, f| {
        l.with_lock(|v| f(v));
    });
    assert_eq!(lock.with_lock(|v| *v), expected);
    assert!(!lock.is_locked());
}

#[test]
fn ticket_try_lock_fails_while_held() {
    let l = TicketMutex::new(());
    let g = l.lock();
    assert!(l.try_lock().is_none());
    assert!(l.is_locked());
    drop(g);
    assert!(l.try_lock().is_some());
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    let val = l.with_lock(|v| *v);
    assert_eq!(val, 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
