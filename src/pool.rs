use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::HarvestError;

/// Cooperative cancellation shared between the signal handler and the workers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Minimum spacing between network requests, tracked per worker thread.
pub struct Pacer {
    interval: Duration,
    slots: Vec<Mutex<Option<Instant>>>,
}

impl Pacer {
    pub fn new(width: usize, interval: Duration) -> Self {
        Self {
            interval,
            slots: (0..width.max(1)).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Blocks the calling worker until its previous request is at least `interval` old.
    pub fn pause(&self) {
        if self.interval.is_zero() {
            return;
        }
        let slot = rayon::current_thread_index().unwrap_or(0) % self.slots.len();
        let Ok(mut last) = self.slots[slot].lock() else {
            thread::sleep(self.interval);
            return;
        };
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

/// Outputs of the items that were started, plus how many were never picked up.
#[derive(Debug)]
pub struct PoolRun<O> {
    pub outputs: Vec<O>,
    pub cancelled: usize,
}

/// Fixed-width pool that processes one stage's candidates at a time.
pub struct WorkerPool {
    pool: ThreadPool,
    width: usize,
    shutdown: ShutdownFlag,
}

impl WorkerPool {
    pub fn new(width: usize, shutdown: ShutdownFlag) -> Result<Self, HarvestError> {
        let width = width.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(width)
            .thread_name(|idx| format!("harvest-worker-{idx}"))
            .build()
            .map_err(|err| HarvestError::Filesystem(format!("build worker pool: {err}")))?;
        Ok(Self {
            pool,
            width,
            shutdown,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Runs `work` over `items`. The shutdown flag is checked before each item
    /// starts; items already running always complete.
    pub fn run<T, O, F>(&self, items: Vec<T>, work: F) -> PoolRun<O>
    where
        T: Send,
        O: Send,
        F: Fn(T) -> O + Send + Sync,
    {
        let shutdown = &self.shutdown;
        let results = self.pool.install(|| {
            items
                .into_par_iter()
                .map(|item| {
                    if shutdown.is_requested() {
                        None
                    } else {
                        Some(work(item))
                    }
                })
                .collect::<Vec<_>>()
        });

        let mut outputs = Vec::with_capacity(results.len());
        let mut cancelled = 0usize;
        for result in results {
            match result {
                Some(output) => outputs.push(output),
                None => cancelled += 1,
            }
        }
        PoolRun { outputs, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn runs_every_item_in_order() {
        let pool = WorkerPool::new(3, ShutdownFlag::new()).unwrap();
        let run = pool.run((1..=10).collect(), |n: u32| n * 2);
        assert_eq!(run.cancelled, 0);
        assert_eq!(run.outputs, (1..=10).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_stops_new_items() {
        let shutdown = ShutdownFlag::new();
        let pool = WorkerPool::new(1, shutdown.clone()).unwrap();
        let started = AtomicUsize::new(0);
        let run = pool.run((0..6).collect(), |n: u32| {
            started.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                shutdown.request();
            }
            n
        });
        assert_eq!(run.outputs.len(), started.load(Ordering::SeqCst));
        assert_eq!(run.outputs.len() + run.cancelled, 6);
        assert!(run.cancelled >= 1);
    }

    #[test]
    fn pacer_spaces_requests() {
        let pacer = Pacer::new(1, Duration::from_millis(30));
        let start = Instant::now();
        pacer.pause();
        pacer.pause();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
