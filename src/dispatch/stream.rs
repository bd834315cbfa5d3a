//! Client-visible result stream merging the output of every dispatched
//! target.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::dispatch::client::{QueryId, Record};
use crate::dispatch::{FailureReason, TargetFailure};
use crate::types::TargetId;

/// How one target's request ended.
#[derive(Debug)]
pub(crate) struct TargetOutcome {
    pub target: TargetId,
    pub endpoint: String,
    pub result: Result<(), FailureReason>,
}

/// Per-target summary of one dispatched query.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DispatchReport {
    /// Query id.
    pub query_id: Option<QueryId>,
    /// Targets that produced all their results.
    pub succeeded: Vec<TargetId>,
    /// Targets that failed, with the reason.
    pub failed: Vec<TargetFailure>,
    /// Targets stopped because the consumer no longer needed their output.
    pub cancelled: Vec<TargetId>,
    /// Records handed to the consumer.
    pub records: u64,
}

impl DispatchReport {
    /// True when no target failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn record(&mut self, outcome: TargetOutcome) {
        match outcome.result {
            Ok(()) => self.succeeded.push(outcome.target),
            Err(FailureReason::Cancelled) => self.cancelled.push(outcome.target),
            Err(reason) => {
                warn!(
                    target_id = %outcome.target,
                    endpoint = %outcome.endpoint,
                    %reason,
                    "target failed"
                );
                self.failed.push(TargetFailure {
                    target: outcome.target,
                    endpoint: outcome.endpoint,
                    reason,
                });
            }
        }
    }

    fn sort(&mut self) {
        self.succeeded.sort();
        self.cancelled.sort();
        self.failed.sort_by_key(|failure| failure.target);
    }
}

enum Lanes {
    /// Records arrive in whatever order the targets produce them.
    Merged(mpsc::Receiver<Record>),
    /// Targets are drained one after another in fleet order.
    Ordered(VecDeque<mpsc::Receiver<Record>>),
}

/// Removes a query from the executor's in-flight registry once its stream is
/// gone.
pub(crate) struct InFlight {
    pub id: QueryId,
    pub registry: Arc<Mutex<FxHashMap<QueryId, CancellationToken>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

/// Stream of records for one dispatched query.
///
/// Dropping the stream cancels every outstanding target.
pub struct ResultStream {
    query_id: QueryId,
    lanes: Lanes,
    tasks: JoinSet<TargetOutcome>,
    cancel: CancellationToken,
    limit: Option<u64>,
    delivered: u64,
    exhausted: bool,
    report: DispatchReport,
    _in_flight: InFlight,
    _guard: DropGuard,
}

pub(crate) struct StreamParts {
    pub query_id: QueryId,
    pub ordered: Option<Vec<mpsc::Receiver<Record>>>,
    pub merged: Option<mpsc::Receiver<Record>>,
    pub tasks: JoinSet<TargetOutcome>,
    pub cancel: CancellationToken,
    pub limit: Option<u64>,
    pub report: DispatchReport,
    pub in_flight: InFlight,
}

impl ResultStream {
    pub(crate) fn new(parts: StreamParts) -> Self {
        let lanes = match (parts.ordered, parts.merged) {
            (Some(lanes), _) => Lanes::Ordered(lanes.into_iter().collect()),
            (None, Some(rx)) => Lanes::Merged(rx),
            (None, None) => Lanes::Ordered(VecDeque::new()),
        };
        let mut report = parts.report;
        report.query_id = Some(parts.query_id);
        Self {
            query_id: parts.query_id,
            lanes,
            tasks: parts.tasks,
            _guard: parts.cancel.clone().drop_guard(),
            cancel: parts.cancel,
            limit: parts.limit,
            delivered: 0,
            exhausted: false,
            report,
            _in_flight: parts.in_flight,
        }
    }

    /// Query id assigned at dispatch.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Next record, or `None` once every target finished or the plan's
    /// result bound was reached.
    pub async fn next(&mut self) -> Option<Record> {
        if self.exhausted {
            return None;
        }
        if self.limit.is_some_and(|limit| self.delivered >= limit) {
            self.stop_early();
            return None;
        }
        let record = match &mut self.lanes {
            Lanes::Merged(rx) => rx.recv().await,
            Lanes::Ordered(lanes) => loop {
                let Some(front) = lanes.front_mut() else {
                    break None;
                };
                match front.recv().await {
                    Some(record) => break Some(record),
                    None => {
                        lanes.pop_front();
                    }
                }
            },
        };
        match record {
            Some(record) => {
                self.delivered += 1;
                if self.limit.is_some_and(|limit| self.delivered >= limit) {
                    self.stop_early();
                }
                Some(record)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    fn stop_early(&mut self) {
        if !self.exhausted {
            debug!(query = %self.query_id, delivered = self.delivered, "result bound reached");
        }
        self.exhausted = true;
        self.cancel.cancel();
    }

    /// Stops reading, cancels targets that are still running and returns the
    /// per-target report.
    pub async fn finish(mut self) -> DispatchReport {
        if !self.exhausted {
            self.cancel.cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => self.report.record(outcome),
                Err(err) => warn!(query = %self.query_id, error = %err, "target task aborted"),
            }
        }
        self.report.records = self.delivered;
        self.report.sort();
        std::mem::take(&mut self.report)
    }

    /// Reads every record and returns them with the report.
    pub async fn collect(mut self) -> (Vec<Record>, DispatchReport) {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        let report = self.finish().await;
        (records, report)
    }
}
