#![forbid(unsafe_code)]

//! Executor dispatch.
//!
//! Decides which backend servers receive a compiled plan, runs one task per
//! target and merges their output into a single [`ResultStream`]. Partial
//! failures are reported per target; deciding whether they are acceptable is
//! left to the caller.

pub mod client;
pub mod stream;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::compiler::CompiledPlan;
use crate::types::TargetId;

pub use client::{
    ClientError, ExecuteClient, ManageOp, ManageReply, QueryId, QueryRequest, QueryStatus, Record,
    RecordSink,
};
pub use stream::{DispatchReport, ResultStream};

use stream::{InFlight, StreamParts, TargetOutcome};

/// Why a single target did not deliver.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Availability check failed.
    #[error("unavailable")]
    Unavailable,
    /// No completion within the per-target timeout.
    #[error("timed out")]
    TimedOut,
    /// The server reported an error.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// Stopped because its output was no longer needed.
    #[error("cancelled")]
    Cancelled,
}

impl From<ClientError> for FailureReason {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Unavailable(_) => FailureReason::Unavailable,
            ClientError::Rpc(message) => FailureReason::Rpc(message),
            ClientError::Cancelled => FailureReason::Cancelled,
        }
    }
}

/// A target that did not deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    /// Fleet position.
    pub target: TargetId,
    /// Client endpoint.
    pub endpoint: String,
    /// What went wrong.
    pub reason: FailureReason,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.target, self.endpoint, self.reason)
    }
}

/// Errors that reject a dispatch request as a whole.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No selected target was reachable.
    #[error("no reachable target for {mode} dispatch ({} failed)", .failures.len())]
    NoTarget {
        /// Selection mode in use.
        mode: ExecutorMode,
        /// Every selected target with its failure.
        failures: Vec<TargetFailure>,
    },
    /// The executor was shut down.
    #[error("executor is shut down")]
    Closed,
}

/// Which targets receive a plan.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// The first server of the fleet only.
    #[default]
    Single,
    /// Every server of the fleet, once.
    Broadcast,
}

impl ExecutorMode {
    /// Targets addressed in this mode.
    pub fn select(self, fleet: &Fleet) -> Vec<TargetId> {
        match self {
            ExecutorMode::Single if fleet.is_empty() => Vec::new(),
            ExecutorMode::Single => vec![TargetId(0)],
            ExecutorMode::Broadcast => (0..fleet.len()).map(TargetId).collect(),
        }
    }
}

impl fmt::Display for ExecutorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorMode::Single => f.write_str("single"),
            ExecutorMode::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Ordered, read-only list of backend clients.
#[derive(Clone, Default)]
pub struct Fleet {
    clients: Vec<Arc<dyn ExecuteClient>>,
}

impl Fleet {
    /// Fleet in the given order; position is the [`TargetId`].
    pub fn new(clients: Vec<Arc<dyn ExecuteClient>>) -> Self {
        Self { clients }
    }

    /// Number of servers.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True for an empty fleet.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Client at `target`.
    pub fn get(&self, target: TargetId) -> Option<&Arc<dyn ExecuteClient>> {
        self.clients.get(target.0)
    }
}

impl fmt::Debug for Fleet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.clients.iter().map(|client| client.endpoint()))
            .finish()
    }
}

/// Dispatch tuning.
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// Upper bound for one target's availability check, request or
    /// management call. Time spent waiting on a full result channel is not
    /// counted.
    pub target_timeout: Duration,
    /// Records buffered per channel before targets are throttled.
    pub result_buffer: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            target_timeout: Duration::from_secs(30),
            result_buffer: 1024,
        }
    }
}

/// Replies to one administrative operation.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ManageReport {
    /// Targets that answered.
    pub replies: Vec<(TargetId, ManageReply)>,
    /// Targets that did not.
    pub failed: Vec<TargetFailure>,
    /// The query was also running locally and got cancelled.
    pub cancelled_locally: bool,
}

type Registry = Arc<Mutex<FxHashMap<QueryId, CancellationToken>>>;

/// Routes compiled plans and administrative operations to the fleet.
pub struct QueryExecutor {
    fleet: Fleet,
    mode: ExecutorMode,
    options: DispatchOptions,
    next_query: AtomicU64,
    in_flight: Registry,
    shutdown: CancellationToken,
}

impl QueryExecutor {
    /// Creates an executor over `fleet`.
    pub fn new(fleet: Fleet, mode: ExecutorMode, options: DispatchOptions) -> Self {
        Self {
            fleet,
            mode,
            options,
            next_query: AtomicU64::new(1),
            in_flight: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Selection mode.
    pub fn mode(&self) -> ExecutorMode {
        self.mode
    }

    /// Configured fleet.
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// Queries whose stream is still alive.
    pub fn in_flight(&self) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self.in_flight.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Sends `plan` to the selected targets and returns the merged stream.
    ///
    /// Fails only when no selected target is reachable; unreachable targets
    /// of a broadcast otherwise show up in the final report.
    #[instrument(skip_all, fields(mode = %self.mode))]
    pub async fn execute(&self, plan: Arc<CompiledPlan>) -> Result<ResultStream, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        let query_id = QueryId(self.next_query.fetch_add(1, Ordering::Relaxed));
        let (available, failures) = self.check_availability(self.mode.select(&self.fleet)).await;
        if available.is_empty() {
            warn!(query = %query_id, failed = failures.len(), "no reachable target");
            return Err(DispatchError::NoTarget {
                mode: self.mode,
                failures,
            });
        }

        let cancel = self.shutdown.child_token();
        self.in_flight.lock().insert(query_id, cancel.clone());
        let in_flight = InFlight {
            id: query_id,
            registry: Arc::clone(&self.in_flight),
        };

        let ordered = plan.preserves_order() && available.len() > 1;
        let buffer = self.options.result_buffer.max(1);
        let mut tasks = JoinSet::new();
        let mut lanes = Vec::new();
        let mut merged = None;
        let shared = if ordered {
            None
        } else {
            let (tx, rx) = mpsc::channel(buffer);
            merged = Some(rx);
            Some(tx)
        };

        for (target, client) in &available {
            let tx = match &shared {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(buffer);
                    lanes.push(rx);
                    tx
                }
            };
            let request = QueryRequest {
                query_id,
                target: *target,
                plan: Arc::clone(&plan),
            };
            let sink = RecordSink::new(*target, tx, cancel.clone());
            tasks.spawn(run_target(
                Arc::clone(client),
                request,
                sink,
                self.options.target_timeout,
                cancel.clone(),
            ));
        }
        drop(shared);

        let mut report = DispatchReport::default();
        for failure in failures {
            report.failed.push(failure);
        }
        info!(
            query = %query_id,
            targets = available.len(),
            ordered,
            limit = ?plan.result_bound(),
            "dispatched plan"
        );
        Ok(ResultStream::new(StreamParts {
            query_id,
            ordered: ordered.then_some(lanes),
            merged,
            tasks,
            cancel,
            limit: plan.result_bound(),
            report,
            in_flight,
        }))
    }

    /// Routes an administrative operation to the same targets results come
    /// from. `Cancel` also stops the local side of a running query.
    #[instrument(skip_all, fields(mode = %self.mode, query = %op.query_id()))]
    pub async fn manage(&self, op: ManageOp) -> Result<ManageReport, DispatchError> {
        let mut report = ManageReport::default();
        if let ManageOp::Cancel(id) = op {
            if let Some(token) = self.in_flight.lock().get(&id) {
                token.cancel();
                report.cancelled_locally = true;
            }
        }

        let (available, failures) = self.check_availability(self.mode.select(&self.fleet)).await;
        report.failed = failures;
        if available.is_empty() {
            return Err(DispatchError::NoTarget {
                mode: self.mode,
                failures: report.failed,
            });
        }

        let timeout = self.options.target_timeout;
        let mut tasks = JoinSet::new();
        for (target, client) in available {
            tasks.spawn(async move {
                let endpoint = client.endpoint().to_owned();
                let call = isolate(async move { client.manage(op).await });
                let reply = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(Ok(reply))) => Ok(reply),
                    Ok(Ok(Err(err))) => Err(FailureReason::from(err)),
                    Ok(Err(err)) => Err(aborted(target, &err)),
                    Err(_) => Err(FailureReason::TimedOut),
                };
                (target, endpoint, reply)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, _, Ok(reply))) => report.replies.push((target, reply)),
                Ok((target, endpoint, Err(reason))) => {
                    warn!(target_id = %target, %endpoint, %reason, "manage failed");
                    report.failed.push(TargetFailure {
                        target,
                        endpoint,
                        reason,
                    });
                }
                Err(err) => warn!(error = %err, "manage task aborted"),
            }
        }
        report.replies.sort_by_key(|(target, _)| *target);
        report.failed.sort_by_key(|failure| failure.target);
        Ok(report)
    }

    /// Cancels every running query and rejects new ones.
    pub fn shutdown(&self) {
        debug!(in_flight = self.in_flight.lock().len(), "executor shutting down");
        self.shutdown.cancel();
    }

    /// Checks every target concurrently; a target that does not answer within
    /// the target timeout counts as timed out.
    async fn check_availability(
        &self,
        targets: Vec<TargetId>,
    ) -> (Vec<(TargetId, Arc<dyn ExecuteClient>)>, Vec<TargetFailure>) {
        let timeout = self.options.target_timeout;
        let mut checks = JoinSet::new();
        for target in targets {
            let Some(client) = self.fleet.get(target) else {
                continue;
            };
            let client = Arc::clone(client);
            checks.spawn(async move {
                let checked = Arc::clone(&client);
                let call = isolate(async move { checked.is_available().await });
                let state = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err(FailureReason::Unavailable),
                    Ok(Err(err)) => Err(aborted(target, &err)),
                    Err(_) => Err(FailureReason::TimedOut),
                };
                (target, client, state)
            });
        }

        let mut available = Vec::with_capacity(checks.len());
        let mut failures = Vec::new();
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((target, client, Ok(()))) => available.push((target, client)),
                Ok((target, client, Err(reason))) => {
                    debug!(
                        target_id = %target,
                        endpoint = client.endpoint(),
                        %reason,
                        "availability check failed"
                    );
                    failures.push(TargetFailure {
                        target,
                        endpoint: client.endpoint().to_owned(),
                        reason,
                    });
                }
                Err(err) => warn!(error = %err, "availability task aborted"),
            }
        }
        available.sort_by_key(|(target, _)| *target);
        failures.sort_by_key(|failure| failure.target);
        (available, failures)
    }
}

/// Client call running on its own task. Dropping it aborts the task, so
/// cancelling the caller still stops the backend call.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs a client call so that a panic inside it is reported against its
/// target instead of unwinding the dispatch task.
fn isolate<F>(call: F) -> AbortOnDrop<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AbortOnDrop(tokio::spawn(call))
}

fn aborted(target: TargetId, err: &JoinError) -> FailureReason {
    warn!(target_id = %target, error = %err, "client call aborted");
    FailureReason::Rpc("task aborted".into())
}

async fn run_target(
    client: Arc<dyn ExecuteClient>,
    request: QueryRequest,
    sink: RecordSink,
    timeout: Duration,
    cancel: CancellationToken,
) -> TargetOutcome {
    let target = request.target;
    let endpoint = client.endpoint().to_owned();
    let stalls = sink.stalls();
    let started = Instant::now();
    let mut call = isolate(async move { client.execute(request, sink).await });
    let result = loop {
        let now = Instant::now();
        let (waiting, stalled) = stalls.stalled(now);
        let deadline = if waiting {
            now + timeout
        } else {
            started + timeout + stalled
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(FailureReason::Cancelled),
            joined = &mut call => break match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) if cancel.is_cancelled() => Err(FailureReason::Cancelled),
                Ok(Err(err)) => Err(FailureReason::from(err)),
                Err(err) => Err(aborted(target, &err)),
            },
            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                let (waiting, stalled) = stalls.stalled(now);
                if !waiting && now >= started + timeout + stalled {
                    break Err(FailureReason::TimedOut);
                }
            }
        }
    };
    debug!(target_id = %target, %endpoint, ok = result.is_ok(), "target finished");
    TargetOutcome {
        target,
        endpoint,
        result,
    }
}
