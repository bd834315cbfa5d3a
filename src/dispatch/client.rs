//! Backend execution client seam.
//!
//! The RPC transport lives outside this crate. Every backend server is
//! reached through an [`ExecuteClient`]; dispatch only decides which clients
//! receive a plan and how their output is merged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::compiler::value::Value;
use crate::compiler::CompiledPlan;
use crate::types::TargetId;

/// Identifier of one dispatched query, unique per executor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q-{}", self.0)
    }
}

/// Plan shipped to one target.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    /// Query the request belongs to.
    pub query_id: QueryId,
    /// Target receiving the request.
    pub target: TargetId,
    /// Compiled plan.
    pub plan: Arc<CompiledPlan>,
}

/// One result record produced by a target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Producing target.
    pub target: TargetId,
    /// Payload.
    pub value: Value,
}

/// Administrative operation routed like results.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "query", rename_all = "snake_case")]
pub enum ManageOp {
    /// Stop a running query.
    Cancel(QueryId),
    /// Ask for the state of a query.
    Status(QueryId),
    /// Free server-side resources held for a finished query.
    Release(QueryId),
}

impl ManageOp {
    /// Query the operation applies to.
    pub fn query_id(&self) -> QueryId {
        match self {
            ManageOp::Cancel(id) | ManageOp::Status(id) | ManageOp::Release(id) => *id,
        }
    }
}

/// Server-side state of a query.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Still producing results.
    Running,
    /// Finished, resources may still be held.
    Finished,
    /// Not known to the server.
    Unknown,
}

/// Reply to a [`ManageOp`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManageReply {
    /// Operation applied.
    Ack,
    /// Answer to [`ManageOp::Status`].
    Status(QueryStatus),
}

/// Errors a client reports back to dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The server could not be reached.
    #[error("server unavailable: {0}")]
    Unavailable(String),
    /// The server answered with an error.
    #[error("rpc failed: {0}")]
    Rpc(String),
    /// The consumer went away or the query was cancelled.
    #[error("query cancelled")]
    Cancelled,
}

/// Time a target spent waiting for room in its result channel.
///
/// Shared by every clone of one [`RecordSink`]. The per-target timeout only
/// counts the time the target was free to make progress.
#[derive(Debug, Default)]
pub(crate) struct StallClock {
    state: Mutex<StallState>,
}

#[derive(Debug, Default)]
struct StallState {
    waiting: usize,
    since: Option<Instant>,
    total: Duration,
}

impl StallClock {
    fn begin(self: &Arc<Self>) -> Stall {
        let mut state = self.state.lock();
        if state.waiting == 0 {
            state.since = Some(Instant::now());
        }
        state.waiting += 1;
        Stall(Arc::clone(self))
    }

    /// Whether a send is blocked right now, and the total blocked time up to
    /// `now`.
    pub(crate) fn stalled(&self, now: Instant) -> (bool, Duration) {
        let state = self.state.lock();
        let running = state
            .since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        (state.waiting > 0, state.total + running)
    }
}

struct Stall(Arc<StallClock>);

impl Drop for Stall {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.waiting -= 1;
        if state.waiting == 0 {
            if let Some(since) = state.since.take() {
                state.total += since.elapsed();
            }
        }
    }
}

/// Where a client pushes the records of one request.
#[derive(Clone, Debug)]
pub struct RecordSink {
    target: TargetId,
    tx: mpsc::Sender<Record>,
    cancel: CancellationToken,
    stalls: Arc<StallClock>,
}

impl RecordSink {
    pub(crate) fn new(target: TargetId, tx: mpsc::Sender<Record>, cancel: CancellationToken) -> Self {
        Self {
            target,
            tx,
            cancel,
            stalls: Arc::default(),
        }
    }

    pub(crate) fn stalls(&self) -> Arc<StallClock> {
        Arc::clone(&self.stalls)
    }

    /// Delivers one record. Fails with [`ClientError::Cancelled`] once the
    /// consumer stopped reading; clients should stop producing then.
    ///
    /// Waiting for a slow consumer does not count against the target's
    /// timeout.
    pub async fn send(&self, value: Value) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let record = Record {
            target: self.target,
            value,
        };
        let record = match self.tx.try_send(record) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(ClientError::Cancelled),
            Err(TrySendError::Full(record)) => record,
        };
        let _stall = self.stalls.begin();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            sent = self.tx.send(record) => sent.map_err(|_| ClientError::Cancelled),
        }
    }

    /// True once the consumer no longer wants records.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Target this sink belongs to.
    pub fn target(&self) -> TargetId {
        self.target
    }
}

/// Connection to one backend execution server.
#[async_trait]
pub trait ExecuteClient: Send + Sync {
    /// Address used in logs and failure reports.
    fn endpoint(&self) -> &str;

    /// Cheap reachability check run before a target is selected.
    async fn is_available(&self) -> bool {
        true
    }

    /// Runs `request` and pushes every result into `sink`. Returns once the
    /// server finished producing.
    async fn execute(&self, request: QueryRequest, sink: RecordSink) -> Result<(), ClientError>;

    /// Applies an administrative operation.
    async fn manage(&self, op: ManageOp) -> Result<ManageReply, ClientError>;
}
