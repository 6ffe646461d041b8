//! Worker thread pool dispatching ready actors.
//!
//! Actors register as weak references; each worker makes repeated passes
//! over the registry and offers every live actor one `process_task` call.
//! In condition mode the bounded wait inside the actor's acquire throttles
//! idle passes; in spin mode workers never sleep and trade CPU for latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::thread_config::{apply_thread_config, ThreadConfig};

/// One schedulable unit: a call makes at most one pass over the actor's
/// pending control messages and work.
pub trait Schedulable: Send + Sync {
    fn process_task(&self);

    /// Toggle the bounded condition-variable wait in the actor's acquire
    /// path. Pools call this at registration to match their yield mode.
    fn set_wait_mode(&self, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldMode {
    /// Sleep on condition variables between changes. Lowest CPU at idle.
    Condition,
    /// Spin over the registered actors. Lowest latency, higher CPU.
    Spin,
}

#[derive(Debug, Clone)]
pub struct ThreadPoolArgs {
    /// Worker thread count; zero means one per available CPU.
    pub num_threads: usize,
    pub yield_mode: YieldMode,
    pub thread_config: ThreadConfig,
}

impl Default for ThreadPoolArgs {
    fn default() -> Self {
        Self {
            num_threads: 0,
            yield_mode: YieldMode::Condition,
            thread_config: ThreadConfig::default(),
        }
    }
}

pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolInner {
    actors: Mutex<Vec<Weak<dyn Schedulable>>>,
    running: AtomicBool,
    yield_mode: YieldMode,
}

impl ThreadPool {
    pub fn new(args: ThreadPoolArgs) -> Arc<ThreadPool> {
        let num_threads = if args.num_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            args.num_threads
        };

        let inner = Arc::new(PoolInner {
            actors: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            yield_mode: args.yield_mode,
        });

        let mut workers = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let worker_inner = Arc::clone(&inner);
            let config = args.thread_config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("weir-pool-{index}"))
                .spawn(move || worker_main(worker_inner, index, config))
                .expect("failed to spawn pool worker thread");
            workers.push(handle);
        }
        debug!(num_threads, mode = ?args.yield_mode, "thread pool started");

        Arc::new(ThreadPool {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// The process-wide pool new actors join unless told otherwise.
    pub fn default_pool() -> Arc<ThreadPool> {
        static DEFAULT: OnceLock<Arc<ThreadPool>> = OnceLock::new();
        Arc::clone(DEFAULT.get_or_init(|| ThreadPool::new(ThreadPoolArgs::default())))
    }

    pub fn register(&self, actor: &Arc<dyn Schedulable>) {
        actor.set_wait_mode(self.inner.yield_mode == YieldMode::Condition);
        let mut actors = self.inner.actors.lock().expect("pool registry poisoned");
        actors.retain(|weak| weak.strong_count() > 0);
        actors.push(Arc::downgrade(actor));
    }

    pub fn yield_mode(&self) -> YieldMode {
        self.inner.yield_mode
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock().expect("pool workers poisoned"));
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn worker_main(inner: Arc<PoolInner>, index: usize, config: ThreadConfig) {
    apply_thread_config(&config);

    while inner.running.load(Ordering::Acquire) {
        let snapshot: Vec<Arc<dyn Schedulable>> = {
            let mut actors = inner.actors.lock().expect("pool registry poisoned");
            actors.retain(|weak| weak.strong_count() > 0);
            actors.iter().filter_map(Weak::upgrade).collect()
        };

        if snapshot.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        // Offset each worker's starting point so passes interleave across
        // actors instead of convoying on the same one.
        let len = snapshot.len();
        for step in 0..len {
            if !inner.running.load(Ordering::Acquire) {
                return;
            }
            let actor = &snapshot[(index + step) % len];
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| actor.process_task()))
                .is_err()
            {
                debug!(worker = index, "actor task panicked");
            }
        }

        if inner.yield_mode == YieldMode::Spin {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{Schedulable, ThreadPool, ThreadPoolArgs, YieldMode};

    #[derive(Default)]
    struct CountingActor {
        calls: AtomicU64,
    }

    impl Schedulable for CountingActor {
        fn process_task(&self) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            // Keep idle passes cheap; the pool supplies no other throttle
            // for this test double.
            std::thread::sleep(Duration::from_micros(100));
        }

        fn set_wait_mode(&self, _enabled: bool) {}
    }

    fn wait_for_calls(actor: &CountingActor, at_least: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if actor.calls.load(Ordering::Relaxed) >= at_least {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn registered_actor_is_dispatched_repeatedly() {
        let pool = ThreadPool::new(ThreadPoolArgs {
            num_threads: 2,
            yield_mode: YieldMode::Condition,
            ..Default::default()
        });
        let actor = Arc::new(CountingActor::default());
        pool.register(&(Arc::clone(&actor) as Arc<dyn Schedulable>));
        assert!(wait_for_calls(&actor, 10), "actor should be revisited");
    }

    #[test]
    fn dropped_actor_is_pruned_from_the_registry() {
        let pool = ThreadPool::new(ThreadPoolArgs {
            num_threads: 1,
            ..Default::default()
        });
        let actor = Arc::new(CountingActor::default());
        pool.register(&(Arc::clone(&actor) as Arc<dyn Schedulable>));
        assert!(wait_for_calls(&actor, 1));
        drop(actor);
        // The pool must keep running with an empty registry.
        std::thread::sleep(Duration::from_millis(5));
    }

    #[test]
    fn pool_drop_joins_workers() {
        let pool = ThreadPool::new(ThreadPoolArgs {
            num_threads: 2,
            yield_mode: YieldMode::Spin,
            ..Default::default()
        });
        let actor = Arc::new(CountingActor::default());
        pool.register(&(Arc::clone(&actor) as Arc<dyn Schedulable>));
        assert!(wait_for_calls(&actor, 1));
        drop(pool);
        let settled = actor.calls.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(actor.calls.load(Ordering::Relaxed), settled);
    }
}
