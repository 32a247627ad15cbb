// SPDX-License-Identifier: AGPL-3.0-only

//! One worker thread per context.
//!
//! The context is moved onto its worker when the thread is spawned and is
//! only ever touched there. Other threads hand it closures through an
//! mpsc channel; closures run strictly in submission order. A failed task
//! aborts the rest of the current batch: later tasks are skipped until
//! the next [`WorkThread::flush`], which reports the failure.
//!
//! Dropping a [`WorkThread`] sends a shutdown sentinel and joins the
//! thread, so the context (and its device memory) is released on the
//! worker before the drop returns.

use crate::context::ComputeContext;
use crate::error::{ContextError, Result};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce(&mut ComputeContext) -> Result<()> + Send>;

enum Message {
    Run(Task),
    Flush(mpsc::Sender<Option<ContextError>>),
    Shutdown,
}

/// The worker thread owning one context.
pub struct WorkThread {
    index: usize,
    sender: mpsc::Sender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl WorkThread {
    /// Move `context` onto a new named thread.
    ///
    /// # Errors
    ///
    /// [`ContextError::Initialization`] if the thread cannot be spawned.
    pub fn spawn(context: ComputeContext) -> Result<Self> {
        let index = context.context_index();
        let (sender, receiver) = mpsc::channel::<Message>();
        let handle = std::thread::Builder::new()
            .name(format!("mdcontext-worker-{index}"))
            .spawn(move || run(context, &receiver))
            .map_err(|e| ContextError::Initialization(format!("spawning worker for context {index}: {e}")))?;
        Ok(Self {
            index,
            sender,
            handle: Some(handle),
        })
    }

    /// Index of the context this thread owns.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| ContextError::Worker(self.index))
    }

    /// Queue `task`; returns immediately.
    ///
    /// # Errors
    ///
    /// [`ContextError::Worker`] if the thread has exited.
    pub fn add_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut ComputeContext) -> Result<()> + Send + 'static,
    {
        self.send(Message::Run(Box::new(task)))
    }

    /// Wait for every queued task and report the first failure since the
    /// previous flush.
    ///
    /// # Errors
    ///
    /// The failed task's error, or [`ContextError::Worker`] if the thread
    /// has exited.
    pub fn flush(&self) -> Result<()> {
        let (reply, done) = mpsc::channel();
        self.send(Message::Flush(reply))?;
        match done.recv() {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(e),
            Err(_) => Err(ContextError::Worker(self.index)),
        }
    }

    /// Run `f` on the worker after every queued task and wait for its
    /// result.
    ///
    /// # Errors
    ///
    /// The error `f` returns, a pending failure of an earlier task, or
    /// [`ContextError::Worker`] if the thread has exited.
    pub fn with_context<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ComputeContext) -> Result<R> + Send + 'static,
    {
        let (reply, done) = mpsc::channel();
        self.add_task(move |context| {
            let _ = reply.send(f(context));
            Ok(())
        })?;
        match done.recv() {
            Ok(result) => result,
            Err(_) => {
                self.flush()?;
                Err(ContextError::Worker(self.index))
            }
        }
    }
}

impl Drop for WorkThread {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("worker for context {} panicked", self.index);
            }
        }
    }
}

impl std::fmt::Debug for WorkThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkThread")
            .field("index", &self.index)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn run(mut context: ComputeContext, receiver: &mpsc::Receiver<Message>) {
    let index = context.context_index();
    log::debug!("worker for context {index} started");
    let mut failure: Option<ContextError> = None;
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(task) => {
                if failure.is_some() {
                    continue;
                }
                if let Err(e) = task(&mut context) {
                    log::warn!("task on context {index} failed: {e}");
                    failure = Some(e);
                }
            }
            Message::Flush(reply) => {
                let _ = reply.send(failure.take());
            }
            Message::Shutdown => break,
        }
    }
    log::debug!("worker for context {index} stopped");
}

/// Flush every worker; all are drained even when one fails.
///
/// # Errors
///
/// The first failure, in context order.
pub fn sync_all(threads: &[WorkThread]) -> Result<()> {
    let mut first = None;
    for thread in threads {
        if let Err(e) = thread.flush() {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Lock shared orchestration state.
///
/// # Errors
///
/// [`ContextError::InvalidState`] if a worker panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ContextError::InvalidState("shared orchestration state poisoned".into()))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::HostProvider;
    use crate::context::{ContextOptions, SystemLayout};
    use std::sync::Arc;

    fn worker(index: usize) -> WorkThread {
        let options = ContextOptions {
            context_index: index,
            ..ContextOptions::default()
        };
        let ctx = ComputeContext::new(&SystemLayout::new(vec![1.0; 8]), options, &HostProvider::reference(1)).unwrap();
        WorkThread::spawn(ctx).unwrap()
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let w = worker(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            w.add_task(move |_| {
                seen.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }
        w.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn with_context_returns_value_from_worker() {
        let w = worker(3);
        assert_eq!(w.with_context(|ctx| Ok(ctx.context_index())).unwrap(), 3);
        let name = w.with_context(|_| Ok(std::thread::current().name().map(String::from))).unwrap();
        assert_eq!(name.as_deref(), Some("mdcontext-worker-3"));
    }

    #[test]
    fn failure_skips_rest_of_batch_and_surfaces_on_flush() {
        let w = worker(0);
        let ran = Arc::new(Mutex::new(false));
        w.add_task(|_| Err(ContextError::InvalidState("boom".into()))).unwrap();
        let flag = Arc::clone(&ran);
        w.add_task(move |_| {
            *flag.lock().unwrap() = true;
            Ok(())
        })
        .unwrap();
        assert!(matches!(w.flush(), Err(ContextError::InvalidState(m)) if m == "boom"));
        assert!(!*ran.lock().unwrap());
        w.flush().unwrap();
    }

    #[test]
    fn with_context_after_failure_reports_the_failure() {
        let w = worker(0);
        w.add_task(|_| Err(ContextError::Backend("lost".into()))).unwrap();
        assert!(matches!(w.with_context(|_| Ok(1)), Err(ContextError::Backend(_))));
    }

    #[test]
    fn sync_all_drains_every_worker() {
        let workers = [worker(0), worker(1)];
        workers[1].add_task(|_| Err(ContextError::Worker(1))).unwrap();
        assert!(matches!(sync_all(&workers), Err(ContextError::Worker(1))));
        sync_all(&workers).unwrap();
    }

    #[test]
    fn drop_releases_the_context_on_the_worker() {
        let provider = HostProvider::reference(1);
        let ctx = ComputeContext::new(&SystemLayout::new(vec![1.0]), ContextOptions::default(), &provider).unwrap();
        let w = WorkThread::spawn(ctx).unwrap();
        assert_eq!(provider.live_backends(), 1);
        drop(w);
        assert_eq!(provider.live_backends(), 0);
    }
}
