//! Serial render queue.
//!
//! A [`RenderQueue`] owns one worker thread that runs submitted tasks one at a
//! time, in submission order. Because each task blocks the worker for its
//! whole lifetime, a task's teardown always happens before the next task
//! registers with the engine. Callers get their outcome back over a oneshot
//! channel, either by awaiting it or by blocking on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use futures::future::join_all;
use tokio::sync::oneshot;

use crate::task::TaskHandle;
use crate::{Error, RenderOutcome, RenderTask, Result};

enum Command {
    Run(Box<RenderTask>, oneshot::Sender<RenderOutcome>),
    Close(oneshot::Sender<()>),
}

/// Handle to a worker thread that executes render tasks serially.
#[derive(Clone)]
pub struct RenderQueue {
    cmd_tx: Sender<Command>,
    closed: Arc<AtomicBool>,
}

/// A task that has been handed to a [`RenderQueue`].
pub struct PendingRender {
    handle: TaskHandle,
    rx: oneshot::Receiver<RenderOutcome>,
}

impl RenderQueue {
    /// Spawn the worker thread.
    pub fn new() -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();

        thread::Builder::new()
            .name("rfrender-queue".into())
            .spawn(move || {
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        Command::Run(mut task, resp) => {
                            task.start();
                            // The caller may have stopped listening.
                            let _ = resp.send(task.outcome());
                        }
                        Command::Close(resp) => {
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                log::debug!("Render queue worker exiting");
            })
            .map_err(|e| Error::InitializationError(format!("Failed to spawn worker: {}", e)))?;

        Ok(Self {
            cmd_tx,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Submit a task. It runs after every task submitted before it.
    pub fn enqueue(&self, task: RenderTask) -> Result<PendingRender> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }
        let handle = task.handle();
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Run(Box::new(task), tx))
            .map_err(|_| Error::QueueClosed)?;
        log::debug!("Queued render - {}", handle.name());
        Ok(PendingRender { handle, rx })
    }

    /// Submit a task and await its outcome
    pub async fn render(&self, task: RenderTask) -> Result<RenderOutcome> {
        self.enqueue(task)?.outcome().await
    }

    /// Submit a task and block the current thread until it completes.
    ///
    /// Must not be called from within an async runtime.
    pub fn render_blocking(&self, task: RenderTask) -> Result<RenderOutcome> {
        self.enqueue(task)?.outcome_blocking()
    }

    /// Submit every task, then await all outcomes. Tasks still run one at a
    /// time; outcomes come back in submission order.
    pub async fn render_all<I>(&self, tasks: I) -> Vec<Result<RenderOutcome>>
    where
        I: IntoIterator<Item = RenderTask>,
    {
        let pending: Vec<_> = tasks.into_iter().map(|task| self.enqueue(task)).collect();
        join_all(pending.into_iter().map(|pending| async move { pending?.outcome().await })).await
    }

    /// Stop accepting work and wait for queued tasks to drain.
    pub async fn close(&self) -> Result<()> {
        let rx = self.request_close()?;
        rx.await.map_err(|_| Error::QueueClosed)
    }

    /// Blocking variant of [`RenderQueue::close`]
    pub fn shutdown(&self) -> Result<()> {
        let rx = self.request_close()?;
        rx.blocking_recv().map_err(|_| Error::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn request_close(&self) -> Result<oneshot::Receiver<()>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close(tx))
            .map_err(|_| Error::QueueClosed)?;
        Ok(rx)
    }
}

impl PendingRender {
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Cancel the task, whether it is still queued or already running
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub async fn outcome(self) -> Result<RenderOutcome> {
        self.rx.await.map_err(|_| Error::QueueClosed)
    }

    /// Must not be called from within an async runtime.
    pub fn outcome_blocking(self) -> Result<RenderOutcome> {
        self.rx.blocking_recv().map_err(|_| Error::QueueClosed)
    }
}
