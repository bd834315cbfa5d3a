use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graphflow::compiler::schema::InMemorySchema;
use graphflow::compiler::value::Value;
use graphflow::compiler::{compile, CompiledPlan, Traversal};
use graphflow::dispatch::{
    ClientError, DispatchError, DispatchOptions, ExecuteClient, ExecutorMode, FailureReason, Fleet,
    ManageOp, ManageReply, QueryExecutor, QueryRequest, QueryStatus, RecordSink,
};
use graphflow::types::TargetId;
use parking_lot::Mutex;

#[derive(Clone, Copy)]
enum Behavior {
    Complete,
    Fail,
    Hang,
    Endless,
    Panic,
}

struct MockClient {
    endpoint: String,
    available: bool,
    availability_hangs: bool,
    behavior: Behavior,
    records: Vec<i64>,
    executed: AtomicUsize,
    managed: Mutex<Vec<ManageOp>>,
    stopped: Arc<AtomicBool>,
}

impl MockClient {
    fn new(idx: usize, behavior: Behavior, records: Vec<i64>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: format!("mock-{idx}:7000"),
            available: true,
            availability_hangs: false,
            behavior,
            records,
            executed: AtomicUsize::new(0),
            managed: Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn unavailable(idx: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoint: format!("mock-{idx}:7000"),
            available: false,
            availability_hangs: false,
            behavior: Behavior::Complete,
            records: Vec::new(),
            executed: AtomicUsize::new(0),
            managed: Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn unresponsive(idx: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoint: format!("mock-{idx}:7000"),
            available: true,
            availability_hangs: true,
            behavior: Behavior::Complete,
            records: Vec::new(),
            executed: AtomicUsize::new(0),
            managed: Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

struct StopFlag(Arc<AtomicBool>);

impl Drop for StopFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecuteClient for MockClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn is_available(&self) -> bool {
        if self.availability_hangs {
            std::future::pending::<()>().await;
        }
        self.available
    }

    async fn execute(&self, _request: QueryRequest, sink: RecordSink) -> Result<(), ClientError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let _flag = StopFlag(Arc::clone(&self.stopped));
        match self.behavior {
            Behavior::Complete => {
                for value in &self.records {
                    sink.send(Value::Long(*value)).await?;
                }
                Ok(())
            }
            Behavior::Fail => Err(ClientError::Rpc("partition offline".into())),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behavior::Panic => panic!("backend exploded"),
            Behavior::Endless => {
                let mut next = 0;
                loop {
                    sink.send(Value::Long(next)).await?;
                    next += 1;
                }
            }
        }
    }

    async fn manage(&self, op: ManageOp) -> Result<ManageReply, ClientError> {
        self.managed.lock().push(op);
        Ok(match op {
            ManageOp::Status(_) => ManageReply::Status(QueryStatus::Running),
            _ => ManageReply::Ack,
        })
    }
}

fn fleet(clients: &[Arc<MockClient>]) -> Fleet {
    graphflow::logging::install_once("warn");
    Fleet::new(
        clients
            .iter()
            .map(|client| Arc::clone(client) as Arc<dyn ExecuteClient>)
            .collect(),
    )
}

fn plan(traversal: Traversal) -> Arc<CompiledPlan> {
    let schema = InMemorySchema::new();
    Arc::new(compile(&traversal.build().unwrap(), &schema).unwrap())
}

fn options(timeout_ms: u64) -> DispatchOptions {
    DispatchOptions {
        target_timeout: Duration::from_millis(timeout_ms),
        result_buffer: 4,
    }
}

fn values(records: &[graphflow::dispatch::Record]) -> Vec<i64> {
    records
        .iter()
        .map(|record| match record.value {
            Value::Long(v) => v,
            ref other => panic!("unexpected value {other}"),
        })
        .collect()
}

#[tokio::test]
async fn single_mode_addresses_first_server_only() {
    let clients: Vec<_> = (0..3)
        .map(|idx| MockClient::new(idx, Behavior::Complete, vec![1, 2]))
        .collect();
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Single, options(1_000));
    let stream = executor.execute(plan(Traversal::v())).await.unwrap();
    let (records, report) = stream.collect().await;

    assert_eq!(
        clients.iter().map(|c| c.executed()).collect::<Vec<_>>(),
        vec![1, 0, 0]
    );
    assert!(records.iter().all(|r| r.target == TargetId(0)));
    assert_eq!(records.len(), 2);
    assert_eq!(report.succeeded, vec![TargetId(0)]);
    assert!(report.is_success());
    assert_eq!(report.records, 2);
}

#[tokio::test]
async fn broadcast_addresses_every_server_once() {
    let clients: Vec<_> = (0..3)
        .map(|idx| MockClient::new(idx, Behavior::Complete, vec![idx as i64; 5]))
        .collect();
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(1_000));
    let (records, report) = executor
        .execute(plan(Traversal::v().dedup()))
        .await
        .unwrap()
        .collect()
        .await;

    assert!(clients.iter().all(|c| c.executed() == 1));
    assert_eq!(records.len(), 15);
    for target in 0..3 {
        assert_eq!(
            records.iter().filter(|r| r.target == TargetId(target)).count(),
            5
        );
    }
    assert_eq!(report.succeeded, vec![TargetId(0), TargetId(1), TargetId(2)]);
}

#[tokio::test]
async fn partial_failures_are_reported_per_target() {
    let clients = vec![
        MockClient::new(0, Behavior::Fail, Vec::new()),
        MockClient::unavailable(1),
        MockClient::new(2, Behavior::Complete, vec![7]),
        MockClient::new(3, Behavior::Hang, Vec::new()),
    ];
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(50));
    let (records, report) = executor
        .execute(plan(Traversal::e()))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(values(&records), vec![7]);
    assert_eq!(report.succeeded, vec![TargetId(2)]);
    let failed: Vec<(TargetId, FailureReason)> = report
        .failed
        .iter()
        .map(|f| (f.target, f.reason.clone()))
        .collect();
    assert_eq!(
        failed,
        vec![
            (TargetId(0), FailureReason::Rpc("partition offline".into())),
            (TargetId(1), FailureReason::Unavailable),
            (TargetId(3), FailureReason::TimedOut),
        ]
    );
    assert_eq!(report.failed[1].endpoint, "mock-1:7000");
    assert!(!report.is_success());
}

#[tokio::test]
async fn no_reachable_target_is_an_error() {
    let clients = vec![
        MockClient::unavailable(0),
        MockClient::new(1, Behavior::Complete, vec![1]),
    ];
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Single, options(1_000));
    match executor.execute(plan(Traversal::v())).await {
        Err(DispatchError::NoTarget { mode, failures }) => {
            assert_eq!(mode, ExecutorMode::Single);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].target, TargetId(0));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("dispatch should fail"),
    }
    assert_eq!(clients[1].executed(), 0);

    let empty = QueryExecutor::new(Fleet::default(), ExecutorMode::Broadcast, options(1_000));
    assert!(matches!(
        empty.execute(plan(Traversal::v())).await,
        Err(DispatchError::NoTarget { .. })
    ));
}

#[tokio::test]
async fn early_stop_plan_cancels_outstanding_targets() {
    let clients: Vec<_> = (0..2)
        .map(|idx| MockClient::new(idx, Behavior::Endless, Vec::new()))
        .collect();
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(5_000));
    let bounded = plan(Traversal::v().range(0, 3));
    assert_eq!(bounded.result_bound(), Some(3));

    let (records, report) = executor.execute(bounded).await.unwrap().collect().await;
    assert_eq!(records.len(), 3);
    assert_eq!(report.records, 3);
    assert_eq!(report.cancelled, vec![TargetId(0), TargetId(1)]);
    assert!(report.failed.is_empty());
    assert!(executor.in_flight().is_empty());
}

#[tokio::test]
async fn keyed_range_does_not_truncate_the_stream() {
    let clients: Vec<_> = (0..2)
        .map(|idx| {
            let base = idx as i64 * 10;
            MockClient::new(idx, Behavior::Complete, vec![base, base + 1])
        })
        .collect();
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(1_000));
    let keyed = plan(Traversal::v().range(0, 2).by_key());
    assert_eq!(keyed.result_bound(), None);

    let (records, report) = executor.execute(keyed).await.unwrap().collect().await;
    assert_eq!(records.len(), 4);
    assert_eq!(report.succeeded, vec![TargetId(0), TargetId(1)]);
    assert!(report.cancelled.is_empty());
}

#[tokio::test]
async fn hanging_availability_check_times_out() {
    let clients = vec![
        MockClient::unresponsive(0),
        MockClient::new(1, Behavior::Complete, vec![5]),
    ];
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(100));
    let stream = tokio::time::timeout(
        Duration::from_secs(5),
        executor.execute(plan(Traversal::v())),
    )
    .await
    .expect("dispatch returned")
    .unwrap();
    let (records, report) = stream.collect().await;

    assert_eq!(values(&records), vec![5]);
    assert_eq!(clients[0].executed(), 0);
    assert_eq!(report.succeeded, vec![TargetId(1)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].target, TargetId(0));
    assert_eq!(report.failed[0].reason, FailureReason::TimedOut);
}

#[tokio::test]
async fn hanging_availability_check_fails_single_dispatch() {
    let clients = vec![MockClient::unresponsive(0)];
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Single, options(100));
    let dispatched = tokio::time::timeout(
        Duration::from_secs(5),
        executor.execute(plan(Traversal::v())),
    )
    .await
    .expect("dispatch returned");
    match dispatched {
        Err(DispatchError::NoTarget { failures, .. }) => {
            assert_eq!(failures[0].reason, FailureReason::TimedOut);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("dispatch should fail"),
    }
}

#[tokio::test]
async fn panicking_client_is_reported() {
    let clients = vec![
        MockClient::new(0, Behavior::Panic, Vec::new()),
        MockClient::new(1, Behavior::Complete, vec![3]),
    ];
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(1_000));
    let (records, report) = executor
        .execute(plan(Traversal::v()))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(values(&records), vec![3]);
    assert_eq!(report.succeeded, vec![TargetId(1)]);
    let failed: Vec<(TargetId, FailureReason)> = report
        .failed
        .iter()
        .map(|f| (f.target, f.reason.clone()))
        .collect();
    assert_eq!(
        failed,
        vec![(TargetId(0), FailureReason::Rpc("task aborted".into()))]
    );
}

#[tokio::test]
async fn slow_consumer_does_not_time_out_ordered_targets() {
    let clients = vec![
        MockClient::new(0, Behavior::Complete, vec![1, 2, 3]),
        MockClient::new(1, Behavior::Complete, vec![4, 5, 6, 7, 8, 9]),
    ];
    let options = DispatchOptions {
        target_timeout: Duration::from_millis(100),
        result_buffer: 2,
    };
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options);
    let mut stream = executor
        .execute(plan(Traversal::v().order(None, false)))
        .await
        .unwrap();

    let mut records = Vec::new();
    while let Some(record) = stream.next().await {
        records.push(record);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    let report = stream.finish().await;

    assert_eq!(values(&records), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(report.succeeded, vec![TargetId(0), TargetId(1)]);
}

#[tokio::test]
async fn ordered_plans_drain_targets_in_fleet_order() {
    let clients = vec![
        MockClient::new(0, Behavior::Complete, vec![1, 2, 3]),
        MockClient::new(1, Behavior::Complete, vec![4, 5, 6]),
    ];
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(1_000));
    let ordered = plan(Traversal::v().order(None, false));
    assert!(ordered.preserves_order());
    let (records, report) = executor.execute(ordered).await.unwrap().collect().await;
    assert_eq!(values(&records), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
        records.iter().map(|r| r.target.0).collect::<Vec<_>>(),
        vec![0, 0, 0, 1, 1, 1]
    );
    assert!(report.is_success());
}

#[tokio::test]
async fn dropping_the_stream_cancels_backends() {
    let client = MockClient::new(0, Behavior::Endless, Vec::new());
    let executor = QueryExecutor::new(
        fleet(&[Arc::clone(&client)]),
        ExecutorMode::Single,
        options(5_000),
    );
    let mut stream = executor.execute(plan(Traversal::v())).await.unwrap();
    assert!(stream.next().await.is_some());
    assert_eq!(executor.in_flight(), vec![stream.query_id()]);
    drop(stream);

    assert!(executor.in_flight().is_empty());
    for _ in 0..100 {
        if client.stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("backend call still running after the stream was dropped");
}

#[tokio::test]
async fn manage_follows_result_routing() {
    let clients: Vec<_> = (0..3)
        .map(|idx| MockClient::new(idx, Behavior::Complete, Vec::new()))
        .collect();
    let single = QueryExecutor::new(fleet(&clients), ExecutorMode::Single, options(1_000));
    let report = single
        .manage(ManageOp::Status(graphflow::dispatch::QueryId(9)))
        .await
        .unwrap();
    assert_eq!(
        report.replies,
        vec![(TargetId(0), ManageReply::Status(QueryStatus::Running))]
    );
    assert!(!report.cancelled_locally);

    let broadcast = QueryExecutor::new(fleet(&clients), ExecutorMode::Broadcast, options(1_000));
    let report = broadcast
        .manage(ManageOp::Release(graphflow::dispatch::QueryId(9)))
        .await
        .unwrap();
    assert_eq!(report.replies.len(), 3);
    assert_eq!(clients[0].managed.lock().len(), 2);
    assert_eq!(clients[1].managed.lock().len(), 1);
    assert_eq!(clients[2].managed.lock().len(), 1);
}

#[tokio::test]
async fn cancel_stops_the_local_query_too() {
    let client = MockClient::new(0, Behavior::Endless, Vec::new());
    let executor = QueryExecutor::new(
        fleet(&[Arc::clone(&client)]),
        ExecutorMode::Single,
        options(5_000),
    );
    let mut stream = executor.execute(plan(Traversal::v())).await.unwrap();
    assert!(stream.next().await.is_some());

    let report = executor
        .manage(ManageOp::Cancel(stream.query_id()))
        .await
        .unwrap();
    assert!(report.cancelled_locally);
    assert_eq!(report.replies, vec![(TargetId(0), ManageReply::Ack)]);

    while stream.next().await.is_some() {}
    let report = stream.finish().await;
    assert_eq!(report.cancelled, vec![TargetId(0)]);
}

#[tokio::test]
async fn shut_down_executor_rejects_work() {
    let clients = vec![MockClient::new(0, Behavior::Complete, vec![1])];
    let executor = QueryExecutor::new(fleet(&clients), ExecutorMode::Single, options(1_000));
    executor.shutdown();
    assert!(matches!(
        executor.execute(plan(Traversal::v())).await,
        Err(DispatchError::Closed)
    ));
}
