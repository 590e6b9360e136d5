use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::sync::WaitGroup;
use depot::{NaiveThreadPool, RayonThreadPool, Result, SharedQueueThreadPool, ThreadPool};

fn spawn_counter<P: ThreadPool>(pool: P) -> Result<()> {
    const TASK_NUM: usize = 20;
    const ADD_COUNT: usize = 1000;

    let wg = WaitGroup::new();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..TASK_NUM {
        let counter = Arc::clone(&counter);
        let wg = wg.clone();
        pool.spawn(move || {
            for _ in 0..ADD_COUNT {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            drop(wg);
        })
    }

    wg.wait();
    assert_eq!(counter.load(Ordering::SeqCst), TASK_NUM * ADD_COUNT);
    Ok(())
}

// a connection handler that panics must not take its pool thread with it
fn spawn_panic_task<P: ThreadPool>() -> Result<()> {
    const TASK_NUM: usize = 20;

    let pool = P::new(4)?;
    for _ in 0..TASK_NUM {
        pool.spawn(|| panic!("connection handler panicked"));
    }
    spawn_counter(pool)
}

#[test]
fn naive_thread_pool_spawn_counter() -> Result<()> {
    spawn_counter(NaiveThreadPool::new(4)?)
}

#[test]
fn shared_queue_thread_pool_spawn_counter() -> Result<()> {
    spawn_counter(SharedQueueThreadPool::new(4)?)
}

#[test]
fn rayon_thread_pool_spawn_counter() -> Result<()> {
    spawn_counter(RayonThreadPool::new(4)?)
}

#[test]
fn shared_queue_thread_pool_panic_task() -> Result<()> {
    spawn_panic_task::<SharedQueueThreadPool>()
}

#[test]
fn rayon_thread_pool_panic_task() -> Result<()> {
    spawn_panic_task::<RayonThreadPool>()
}
