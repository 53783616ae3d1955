//! Single-worker serialized task queue.
//!
//! A `Looper<S>` owns a piece of mutable state `S` inside one tokio task.
//! Everything else talks to that state by posting closures, which the worker
//! runs one at a time in submission order. This is the only synchronization
//! used for pool and routing state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

pub type Task<S> = Box<dyn FnOnce(&mut S, &Looper<S>) + Send + 'static>;

enum Message<S> {
    Run(Task<S>),
    Close,
}

static NEXT_LOOPER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_LOOPER: u64;
}

#[derive(Debug, thiserror::Error)]
#[error("task queue {0} is closed")]
pub struct LooperClosed(pub String);

pub struct Looper<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    id: u64,
    name: String,
    tx: mpsc::UnboundedSender<Message<S>>,
    // tasks handed to `execute` from the worker itself
    urgent: mpsc::UnboundedSender<Task<S>>,
}

impl<S> Clone for Looper<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Send + 'static> Looper<S> {
    /// Start the worker task owning `state`. Must be called inside a tokio runtime.
    pub fn spawn(name: impl Into<String>, state: S) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (urgent, urgent_rx) = mpsc::unbounded_channel();
        let looper = Looper {
            inner: Arc::new(Inner {
                id: NEXT_LOOPER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                tx,
                urgent,
            }),
        };
        tokio::spawn(looper.clone().run(state, rx, urgent_rx));
        looper
    }

    async fn run(
        self,
        mut state: S,
        mut rx: mpsc::UnboundedReceiver<Message<S>>,
        mut urgent_rx: mpsc::UnboundedReceiver<Task<S>>,
    ) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Run(task) => self.run_task(&mut state, task, &mut urgent_rx),
                Message::Close => break,
            }
        }
        debug!(looper = %self.inner.name, "task queue stopped");
    }

    fn run_task(
        &self,
        state: &mut S,
        task: Task<S>,
        urgent_rx: &mut mpsc::UnboundedReceiver<Task<S>>,
    ) {
        CURRENT_LOOPER.sync_scope(self.inner.id, || {
            self.guarded(state, task);
            while let Ok(next) = urgent_rx.try_recv() {
                self.guarded(state, next);
            }
        });
    }

    fn guarded(&self, state: &mut S, task: Task<S>) {
        if catch_unwind(AssertUnwindSafe(|| task(state, self))).is_err() {
            error!(looper = %self.inner.name, "task panicked, queue keeps running");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.is_closed()
    }

    /// Enqueue `task` behind everything already submitted.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut S, &Looper<S>) + Send + 'static,
    {
        if self.inner.tx.send(Message::Run(Box::new(task))).is_err() {
            debug!(looper = %self.inner.name, "task dropped, queue closed");
        }
    }

    /// Like `post`, but when called from the worker the task runs right after
    /// the current one, ahead of anything else in the queue.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce(&mut S, &Looper<S>) + Send + 'static,
    {
        if self.in_looper() {
            if self.inner.urgent.send(Box::new(task)).is_err() {
                debug!(looper = %self.inner.name, "task dropped, queue closed");
            }
        } else {
            self.post(task);
        }
    }

    pub fn post_delay<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: FnOnce(&mut S, &Looper<S>) + Send + 'static,
    {
        let looper = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            looper.post(task);
        })
    }

    /// Post `task` every `period`, first run one period from now. Stops once
    /// the queue is closed or the returned handle is aborted.
    pub fn schedule_at_fixed_rate<F>(&self, period: Duration, task: F) -> JoinHandle<()>
    where
        F: Fn(&mut S, &Looper<S>) + Send + Sync + 'static,
    {
        let looper = self.clone();
        let task = Arc::new(task);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if looper.is_closed() {
                    break;
                }
                let task = Arc::clone(&task);
                looper.post(move |state, looper| task(state, looper));
            }
        })
    }

    /// Run `f` on the worker and hand its result back to an async caller.
    pub async fn call<R, F>(&self, f: F) -> Result<R, LooperClosed>
    where
        F: FnOnce(&mut S, &Looper<S>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move |state, looper| {
            let _ = tx.send(f(state, looper));
        });
        rx.await.map_err(|_| LooperClosed(self.inner.name.clone()))
    }

    pub fn in_looper(&self) -> bool {
        CURRENT_LOOPER
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
    }

    /// Panics when the caller is not running on this queue's worker.
    pub fn check_looper(&self) {
        assert!(
            self.in_looper(),
            "task queue {} touched from outside its worker",
            self.inner.name
        );
    }

    /// Stop the worker after the tasks already queued have run.
    pub fn close(&self) {
        let _ = self.inner.tx.send(Message::Close);
    }
}
