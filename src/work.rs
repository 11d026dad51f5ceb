//! Carrier for one unit of caller-supplied work.
//!
//! A [`WorkItem`] pairs the caller's request and run function with two
//! capacity-1 channels; exactly one of {result, error} is ever published,
//! and the consuming [`Work`] methods make that structural. The queue
//! drives items through the type-erased [`Work`] trait, so the scheduler
//! never sees the request or result types.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};
use crate::worker::Worker;

/// The job body: runs against a held, connected worker.
pub type WorkRunFn<T, U> =
    Box<dyn FnOnce(CancellationToken, T, Arc<dyn Worker>) -> BoxFuture<'static, Result<U>> + Send>;

/// Type-erased view of a [`WorkItem`] as the queue drives it.
///
/// `run_with` and `fail` consume the item, so a given item publishes at
/// most once; the queue calls exactly one of them.
#[async_trait]
pub trait Work: Send {
    /// The caller's cancellation token.
    fn token(&self) -> &CancellationToken;

    /// Short request description for logs.
    fn describe(&self) -> String;

    /// Invoke the run function against `worker` and publish its result or
    /// error. Cancellation interrupts the run and publishes `Canceled`.
    async fn run_with(self: Box<Self>, worker: Arc<dyn Worker>);

    /// Publish `err` without running.
    fn fail(self: Box<Self>, err: FleetError);
}

/// One job: context, request, run function and the publication channels.
pub struct WorkItem<T, U> {
    token: CancellationToken,
    request: T,
    run: WorkRunFn<T, U>,
    result_tx: mpsc::Sender<U>,
    err_tx: mpsc::Sender<FleetError>,
}

/// The caller's end of a submitted item: capacity-1 result and error
/// channels. Exactly one of them yields exactly one value.
pub struct WorkOutcome<U> {
    pub result: mpsc::Receiver<U>,
    pub error: mpsc::Receiver<FleetError>,
}

impl<T, U> WorkItem<T, U>
where
    T: fmt::Debug + Send + 'static,
    U: Send + 'static,
{
    /// Build an item and the outcome handle its caller keeps.
    pub fn new<F, Fut>(
        token: CancellationToken,
        request: T,
        run: F,
    ) -> (Self, WorkOutcome<U>)
    where
        F: FnOnce(CancellationToken, T, Arc<dyn Worker>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);

        let item = Self {
            token,
            request,
            run: Box::new(move |ctx, req, worker| Box::pin(run(ctx, req, worker))),
            result_tx,
            err_tx,
        };
        let outcome = WorkOutcome {
            result: result_rx,
            error: err_rx,
        };
        (item, outcome)
    }
}

#[async_trait]
impl<T, U> Work for WorkItem<T, U>
where
    T: fmt::Debug + Send + 'static,
    U: Send + 'static,
{
    fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn describe(&self) -> String {
        format!("{:?}", self.request)
    }

    async fn run_with(self: Box<Self>, worker: Arc<dyn Worker>) {
        let Self {
            token,
            request,
            run,
            result_tx,
            err_tx,
        } = *self;

        let fut = run(token.clone(), request, worker);

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = err_tx.try_send(FleetError::Canceled);
            }
            res = fut => match res {
                Ok(value) => {
                    let _ = result_tx.try_send(value);
                }
                Err(err) => {
                    let _ = err_tx.try_send(err);
                }
            },
        }
    }

    fn fail(self: Box<Self>, err: FleetError) {
        let _ = self.err_tx.try_send(err);
    }
}
