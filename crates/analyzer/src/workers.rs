use crate::error::{AnalyzerError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type TaskFn = Box<dyn FnOnce() + Send>;

/// Fixed-size pool of OS threads for CPU-bound analysis work.
///
/// Tasks are dispatched FIFO off a shared queue; results come back over
/// a per-task channel, so nothing crosses the worker boundary except the
/// payload and its result. A worker that dies is replaced the next time
/// its loss is observed, so capacity never shrinks over time.
pub struct WorkerPool {
    injector: Mutex<Option<mpsc::Sender<TaskFn>>>,
    queue: Arc<Mutex<mpsc::Receiver<TaskFn>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    disposed: Arc<AtomicBool>,
    size: usize,
}

impl WorkerPool {
    /// Pool sized to leave one core free, minimum one worker.
    pub fn with_default_size() -> Self {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(cores.saturating_sub(1).max(1))
    }

    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<TaskFn>();
        let queue = Arc::new(Mutex::new(receiver));
        let disposed = Arc::new(AtomicBool::new(false));
        let workers = (0..size)
            .map(|index| spawn_worker(Arc::clone(&queue), Arc::clone(&disposed), index))
            .collect();
        log::info!("started worker pool with {size} workers");
        Self {
            injector: Mutex::new(Some(sender)),
            queue,
            workers: Mutex::new(workers),
            disposed,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueue a CPU-bound task and await its result.
    pub async fn run_task<R, F>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, receive) = tokio::sync::oneshot::channel();
        let boxed: TaskFn = Box::new(move || {
            let _ = reply.send(task());
        });

        {
            let injector = self.lock_injector();
            let sender = injector.as_ref().ok_or(AnalyzerError::PoolDisposed)?;
            sender
                .send(boxed)
                .map_err(|_| AnalyzerError::PoolDisposed)?;
        }

        match receive.await {
            Ok(result) => Ok(result),
            Err(_) => {
                // Dropped without a reply: either the pool was disposed
                // while the task sat in the queue, or the executing
                // worker vanished.
                if self.disposed.load(Ordering::SeqCst) {
                    return Err(AnalyzerError::PoolDisposed);
                }
                self.respawn_dead_workers();
                Err(AnalyzerError::WorkerLost)
            }
        }
    }

    /// Terminate the pool. In-flight tasks finish; queued tasks are
    /// dropped unrun and their callers see a pool-disposed error.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        *self.lock_injector() = None;
        let mut workers = self.lock_workers();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        log::info!("worker pool disposed");
    }

    fn respawn_dead_workers(&self) {
        let mut workers = self.lock_workers();
        let before = workers.len();
        workers.retain(|handle| !handle.is_finished());
        let lost = before - workers.len();
        if self.lock_injector().is_none() {
            return;
        }
        for index in 0..lost {
            log::warn!("respawning worker thread to replace a dead one");
            workers.push(spawn_worker(
                Arc::clone(&self.queue),
                Arc::clone(&self.disposed),
                before + index,
            ));
        }
    }

    fn lock_injector(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<TaskFn>>> {
        self.injector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        *self.lock_injector() = None;
    }
}

fn spawn_worker(
    queue: Arc<Mutex<mpsc::Receiver<TaskFn>>>,
    disposed: Arc<AtomicBool>,
    index: usize,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("toolmesh-worker-{index}"))
        .spawn(move || loop {
            let task = {
                let receiver = queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                receiver.recv()
            };
            match task {
                Ok(task) => {
                    // A task pulled after disposal is dropped unrun; its
                    // reply channel closing tells the caller why.
                    if disposed.load(Ordering::SeqCst) {
                        drop(task);
                        continue;
                    }
                    // A panicking task must not take the thread with it.
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        log::error!("analysis task panicked in worker thread");
                    }
                }
                Err(_) => break,
            }
        })
        .expect("failed to spawn worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_tasks_and_returns_results() {
        let pool = WorkerPool::new(2);
        let value = pool.run_task(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_many_tasks_across_workers() {
        let pool = Arc::new(WorkerPool::new(3));
        let tasks: Vec<_> = (0..20)
            .map(|n| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.run_task(move || n * n).await.unwrap() })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results.sort();
        assert_eq!(results[0], 0);
        assert_eq!(results[19], 361);
    }

    #[tokio::test]
    async fn test_panicking_task_reports_lost_worker() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run_task(|| -> usize { panic!("kaboom") })
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::WorkerLost));

        // The pool still works afterwards.
        let value = pool.run_task(|| 7).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_dispose_rejects_new_tasks() {
        let pool = WorkerPool::new(1);
        pool.dispose();
        let err = pool.run_task(|| 1).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::PoolDisposed));
    }

    #[tokio::test]
    async fn test_dispose_abandons_queued_tasks() {
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        let pool = Arc::new(WorkerPool::new(1));
        let ran = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        // Occupy the lone worker until the gate opens.
        let blocker = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.run_task(move || {
                    let _ = gate_rx.recv();
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // This one can only sit in the queue.
        let queued = {
            let pool = Arc::clone(&pool);
            let ran = Arc::clone(&ran);
            tokio::spawn(async move {
                pool.run_task(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let disposer = {
            let pool = Arc::clone(&pool);
            tokio::task::spawn_blocking(move || pool.dispose())
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate_tx.send(()).unwrap();

        disposer.await.unwrap();
        blocker.await.unwrap().unwrap();

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, AnalyzerError::PoolDisposed));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
