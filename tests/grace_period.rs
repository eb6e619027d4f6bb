// SPDX-License-Identifier: MPL-2.0

//! End-to-end grace-period scenarios driven through the public surface,
//! with one thread per processor standing in for the scheduler.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use prcu::{CpuId, Prcu};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn quiescent_synchronize_returns_immediately() {
    init_logs();
    let prcu = Prcu::new(8);
    let cpu = prcu.enter(CpuId::new(0));

    // With no readers anywhere, back-to-back grace periods complete without
    // waiting on anyone.
    prcu.synchronize();
    prcu.synchronize();
    drop(cpu);
}

#[test]
fn stuck_reader_blocks_synchronize() {
    init_logs();
    let prcu = &Prcu::new(4);
    let done = &AtomicBool::new(false);
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        s.spawn(move || {
            let cpu = prcu.enter(CpuId::new(3));
            prcu.read_lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            prcu.read_unlock();
            drop(cpu);
        });

        locked_rx.recv().unwrap();
        let writer = s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(0));
            prcu.synchronize();
            done.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    });
}

#[test]
fn preempted_reader_blocks_synchronize_until_migrated_unlock() {
    init_logs();
    let prcu = &Prcu::new(6);
    let done = &AtomicBool::new(false);

    thread::scope(|s| {
        // A reader acquires depth 2 on processor 3 and is switched out.
        s.spawn(move || {
            let cpu = prcu.enter(CpuId::new(3));
            prcu.read_lock();
            prcu.read_lock();
            prcu.note_context_switch();
            drop(cpu);
        })
        .join()
        .unwrap();

        let writer = s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(0));
            prcu.synchronize();
            done.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        // The reader resumes on processor 5 and leaves both nesting levels;
        // that is what the writer has been waiting for.
        s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(5));
            prcu.read_unlock();
            prcu.read_unlock();
        })
        .join()
        .unwrap();

        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    });
}

#[test]
fn callbacks_split_by_grace_period_across_processors() {
    init_logs();
    let prcu = &Prcu::new(2);
    let fired = Arc::new(AtomicUsize::new(0));

    // Enqueue on processor 0.
    thread::scope(|s| {
        let early = fired.clone();
        s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(0));
            prcu.call(move || {
                early.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();

        // A grace period driven from another processor authorizes it.
        s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(1));
            prcu.synchronize();
        })
        .join()
        .unwrap();

        // A later callback on processor 0 must wait for the next grace
        // period; the earlier one fires on the tick. The empty section
        // first lets the processor acknowledge the finished grace period,
        // as any reader activity on it would.
        let late = fired.clone();
        s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(0));
            prcu.read_lock();
            prcu.read_unlock();
            prcu.call(move || {
                late.fetch_add(1, Ordering::SeqCst);
            });
            prcu.check_callbacks();
        })
        .join()
        .unwrap();
    });

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn barrier_flushes_all_processors() {
    init_logs();
    const WORKERS: u32 = 4;
    const PER_CPU: usize = 25;

    let prcu = &Prcu::new(WORKERS as usize + 1);
    let fired = Arc::new(AtomicUsize::new(0));
    let armed = &AtomicUsize::new(0);
    let stop = &AtomicBool::new(false);

    thread::scope(|s| {
        for worker in 0..WORKERS {
            let fired = fired.clone();
            s.spawn(move || {
                let _cpu = prcu.enter(CpuId::new(worker + 1));
                for _ in 0..PER_CPU {
                    let fired = fired.clone();
                    prcu.call(move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    });
                }
                armed.fetch_add(1, Ordering::SeqCst);

                // The periodic tick; sentinel callbacks fire from here.
                while !stop.load(Ordering::SeqCst) {
                    prcu.check_callbacks();
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }

        let fired = fired.clone();
        s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(0));
            while armed.load(Ordering::SeqCst) != WORKERS as usize {
                thread::yield_now();
            }
            prcu.barrier();
            stop.store(true, Ordering::SeqCst);
            assert_eq!(fired.load(Ordering::SeqCst), WORKERS as usize * PER_CPU);
        });
    });

    assert_eq!(fired.load(Ordering::SeqCst), WORKERS as usize * PER_CPU);
}

#[test]
fn concurrent_synchronizers_both_return() {
    init_logs();
    let prcu = &Prcu::new(2);

    thread::scope(|s| {
        for id in 0..2 {
            s.spawn(move || {
                let _cpu = prcu.enter(CpuId::new(id));
                prcu.synchronize();
            });
        }
    });
}

#[test]
fn readers_never_observe_reclaimed_state() {
    init_logs();
    const READERS: u32 = 3;
    const UPDATES: usize = 100;
    const MAGIC: u64 = 0x5ca1_ab1e;
    const POISON: u64 = 0xdead_dead;

    let prcu = &Prcu::new(2 * READERS as usize + 1);
    let shared = &AtomicPtr::new(Box::into_raw(Box::new(MAGIC)));
    let stop = &AtomicBool::new(false);

    thread::scope(|s| {
        for reader in 0..READERS {
            s.spawn(move || {
                let cpus = [CpuId::new(2 * reader), CpuId::new(2 * reader + 1)];
                let mut side = 0;
                let mut iter = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    iter += 1;
                    let guard = prcu.enter(cpus[side]);
                    prcu.read_lock();
                    let ptr = shared.load(Ordering::Acquire);

                    if iter % 4 == 0 {
                        // Get preempted mid-section and resume on the other
                        // processor; the section's depth rides the global
                        // counter in between.
                        drop(guard);
                        side ^= 1;
                        let guard = prcu.enter(cpus[side]);
                        assert_eq!(unsafe { *ptr }, MAGIC);
                        prcu.read_unlock();
                        drop(guard);
                    } else {
                        assert_eq!(unsafe { *ptr }, MAGIC);
                        prcu.read_unlock();
                        drop(guard);
                    }
                    thread::yield_now();
                }
            });
        }

        s.spawn(move || {
            let _cpu = prcu.enter(CpuId::new(2 * READERS));
            for _ in 0..UPDATES {
                let fresh = Box::into_raw(Box::new(MAGIC));
                let old = shared.swap(fresh, Ordering::AcqRel);
                prcu.synchronize();
                // Every section that could have seen `old` is over; poison
                // it so a protocol violation trips the readers' asserts,
                // then free it.
                unsafe {
                    *old = POISON;
                    drop(Box::from_raw(old));
                }
            }
            stop.store(true, Ordering::Relaxed);
        });
    });

    drop(unsafe { Box::from_raw(shared.load(Ordering::Acquire)) });
}
