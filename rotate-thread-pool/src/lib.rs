use std::{mem, sync::Arc, thread::JoinHandle};

use crossbeam::channel::{Receiver, Sender};

enum Task {
    Action(Box<dyn FnOnce() + Send + 'static>),
    Terminate,
}

/// Called with the worker index on the worker's own thread.
type Hook = Arc<dyn Fn(usize) + Send + Sync + 'static>;

#[derive(Clone, Default)]
struct Hooks {
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
}

/// Configures a [`ThreadPool`] before its workers are spawned.
pub struct Builder {
    size: usize,
    name_prefix: String,
    hooks: Hooks,
}

impl Builder {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            name_prefix: "worker".to_string(),
            hooks: Hooks::default(),
        }
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Runs on every worker thread before it takes its first task, e.g. to
    /// register the thread with a reclamation collector.
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(f));
        self
    }

    /// Runs on every worker thread after it stopped taking tasks.
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.hooks.on_stop = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> ThreadPool {
        assert!(self.size > 0, "ThreadPool size must be greater than 0.");

        let (sender, receiver) = crossbeam::channel::unbounded();
        let workers = Arc::new(
            (0..self.size)
                .map(|id| {
                    Worker::new(
                        id,
                        format!("{}-{}", self.name_prefix, id),
                        receiver.clone(),
                        self.hooks.clone(),
                    )
                })
                .collect(),
        );
        ThreadPool { workers, sender }
    }
}

pub struct ThreadPool {
    workers: Arc<Vec<Worker>>,
    sender: Sender<Task>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        Builder::new(size).build()
    }

    pub fn builder(size: usize) -> Builder {
        Builder::new(size)
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Task::Action(Box::new(f)))
            .expect("Failed to send job.");
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Waits for every queued task to finish and stops the workers.
    ///
    /// Panics if a task panicked on one of the workers.
    pub fn join(self) {
        drop(self);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in 0..self.len() {
            self.sender
                .send(Task::Terminate)
                .expect("Failed to send termination signal.");
        }

        let workers = Arc::into_inner(mem::replace(&mut self.workers, Arc::new(Vec::new())))
            .expect("Failed to get workers.");

        let mut panicked = 0;
        for mut worker in workers {
            let thread = worker.thread.take().expect("Worker thread already taken.");
            if thread.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 && !std::thread::panicking() {
            panic!("{panicked} worker thread(s) panicked");
        }
    }
}

struct Worker {
    _id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, name: String, recv: Receiver<Task>, hooks: Hooks) -> Self {
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Some(on_start) = &hooks.on_start {
                    on_start(id);
                }
                Self::run_loop(id, recv);
                if let Some(on_stop) = &hooks.on_stop {
                    on_stop(id);
                }
            })
            .expect("Failed to create worker thread.");
        Self {
            _id: id,
            thread: Some(thread),
        }
    }

    fn run_loop(id: usize, recv: Receiver<Task>) {
        loop {
            match recv.recv() {
                Ok(Task::Action(action)) => {
                    tracing::trace!("Worker {} got a job; executing.", id);
                    action();
                }
                Ok(Task::Terminate) => {
                    tracing::debug!("Worker {} terminated; shutting down.", id);
                    break;
                }
                Err(_) => {
                    tracing::error!("Worker {} disconnected; shutting down.", id);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Barrier, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };
    use std::time::Duration;

    #[test]
    fn test_create_pool() {
        let pool = ThreadPool::new(4);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    #[should_panic(expected = "greater than 0")]
    fn test_zero_size_pool() {
        let _ = ThreadPool::new(0);
    }

    #[test]
    fn test_join_runs_queued_tasks() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let c = Arc::clone(&counter);
            pool.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_concurrent_tasks() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        for _ in 0..100 {
            let c = Arc::clone(&counter);
            let b = Arc::clone(&barrier);
            pool.execute(move || {
                b.wait();
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_termination() {
        let pool = ThreadPool::new(2);
        let terminated = Arc::new(AtomicBool::new(false));

        let t = Arc::clone(&terminated);
        pool.execute(move || {
            std::thread::sleep(Duration::from_millis(50));
            t.store(true, Ordering::SeqCst);
        });

        drop(pool);

        assert!(terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn test_lifecycle_hooks_run_on_workers() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicUsize::new(0));

        let pool = {
            let started = started.clone();
            let stopped = stopped.clone();
            ThreadPool::builder(3)
                .name_prefix("hooked")
                .on_thread_start(move |id| {
                    let name = std::thread::current().name().map(str::to_owned);
                    started.lock().unwrap().push((id, name));
                })
                .on_thread_stop(move |_| {
                    stopped.fetch_add(1, Ordering::SeqCst);
                })
                .build()
        };
        pool.join();

        let mut started = started.lock().unwrap().clone();
        started.sort();
        assert_eq!(
            started,
            (0..3)
                .map(|id| (id, Some(format!("hooked-{id}"))))
                .collect::<Vec<_>>()
        );
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }

    #[test]
    #[should_panic(expected = "worker thread(s) panicked")]
    fn test_task_panic_surfaces_on_join() {
        let pool = ThreadPool::new(2);
        pool.execute(|| panic!("task failed"));
        pool.join();
    }
}
