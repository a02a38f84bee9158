//! Polling for results of asynchronous render-loop executions.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use prism_core::{CommandError, Response, Value};

use crate::protocol::parse_result;

/// Answer to one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Complete(Vec<Response>),
}

impl PollStatus {
    /// Parses `{complete, results}` as returned by
    /// `render_loop_get_execute_results`.
    pub fn from_value(value: &Value) -> Self {
        if !value.get("complete").and_then(Value::as_bool).unwrap_or(false) {
            return PollStatus::Pending;
        }
        let results = value
            .get("results")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_result).collect())
            .unwrap_or_default();
        PollStatus::Complete(results)
    }
}

pub type PollCallback = Box<dyn FnOnce(Result<Vec<Response>, CommandError>) + Send>;

/// A running poll loop.
#[derive(Debug)]
pub struct PollHandle {
    aborted: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stops polling. The callback will not run.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn aborter(&self) -> PollAborter {
        PollAborter {
            aborted: self.aborted.clone(),
            task: self.task.abort_handle(),
        }
    }
}

/// Cloneable abort switch for a [`PollHandle`].
#[derive(Debug, Clone)]
pub struct PollAborter {
    aborted: Arc<AtomicBool>,
    task: tokio::task::AbortHandle,
}

impl PollAborter {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResultPoller {
    delay: Duration,
}

impl ResultPoller {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Calls `fetch` every `delay` until it reports completion or fails,
    /// then hands the outcome to `callback` once.
    pub fn start<F, Fut>(&self, mut fetch: F, callback: PollCallback) -> PollHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<PollStatus, CommandError>> + Send + 'static,
    {
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = aborted.clone();
        let delay = self.delay;
        let task = tokio::spawn(async move {
            let mut polls = 0u32;
            let outcome = loop {
                tokio::time::sleep(delay).await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                polls += 1;
                match fetch().await {
                    Ok(PollStatus::Pending) => {
                        log::trace!("execute results pending after {polls} polls");
                    }
                    Ok(PollStatus::Complete(results)) => break Ok(results),
                    Err(error) => break Err(error),
                }
            };
            if !flag.load(Ordering::SeqCst) {
                callback(outcome);
            }
        });
        PollHandle { aborted, task }
    }

    /// Like [`start`](Self::start), awaiting the outcome. `None` if aborted.
    pub async fn run<F, Fut>(
        &self,
        fetch: F,
        on_start: impl FnOnce(PollAborter),
    ) -> Option<Result<Vec<Response>, CommandError>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<PollStatus, CommandError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = self.start(
            fetch,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        on_start(handle.aborter());
        rx.await.ok()
    }
}
