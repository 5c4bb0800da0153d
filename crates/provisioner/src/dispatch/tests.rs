use std::time::Duration;

use super::*;

use crate::config::ProvisionerConfig;
use crate::db::{NewCluster, PoolLimits};
use crate::testing::temp_db;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("write of {0} refused")]
struct WriteRefused(String);

/// Writes one cluster, then optionally dispatches `then` and fails afterwards.
#[derive(Debug, Clone)]
struct WriteClusterCommand {
    id: String,
    then: Option<Box<WriteClusterCommand>>,
    fail: bool,
    swallow_inner_error: bool,
    hold: Duration,
}

impl WriteClusterCommand {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            then: None,
            fail: false,
            swallow_inner_error: false,
            hold: Duration::ZERO,
        }
    }

    fn then(mut self, inner: Self) -> Self {
        self.then = Some(Box::new(inner));
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn swallowing_inner_error(mut self) -> Self {
        self.swallow_inner_error = true;
        self
    }

    /// Keeps the transaction open for `hold` after writing.
    fn holding(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }
}

impl Request for WriteClusterCommand {
    type Response = usize;
    const NAME: &'static str = "WriteClusterCommand";
}

struct WriteClusterHandler;

#[async_trait]
impl Handler<WriteClusterCommand> for WriteClusterHandler {
    async fn handle(
        &self,
        request: WriteClusterCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<usize> {
        context
            .store()
            .insert_cluster(&NewCluster {
                id: request.id.clone(),
                user_id: None,
                name: request.id.clone(),
            })
            .await?;
        tokio::time::sleep(request.hold).await;

        let mut deepest = context.depth();
        if let Some(inner) = request.then {
            match context.dispatch(*inner).await {
                Ok(depth) => deepest = depth,
                Err(_) if request.swallow_inner_error => {}
                Err(error) => return Err(error),
            }
        }

        if request.fail {
            return Err(WriteRefused(request.id).into());
        }

        Ok(deepest)
    }
}

struct UnregisteredQuery;

impl Request for UnregisteredQuery {
    type Response = ();
    const NAME: &'static str = "UnregisteredQuery";
}

async fn dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new(temp_db().await);
    dispatcher.register::<WriteClusterCommand, _>(WriteClusterHandler);
    dispatcher
}

async fn cluster_exists(dispatcher: &Dispatcher, id: &str) -> bool {
    let mut connection = dispatcher.db().pool().acquire().await.expect("acquire");
    Store::new(&mut connection)
        .get_cluster_by_id(id)
        .await
        .expect("get cluster")
        .is_some()
}

#[tokio::test]
async fn nested_dispatch_commits_every_write() {
    let dispatcher = dispatcher().await;

    let depth = dispatcher
        .send(
            WriteClusterCommand::new("a").then(WriteClusterCommand::new("b")),
            &CancellationToken::new(),
        )
        .await
        .expect("send");

    assert_eq!(depth, 1);
    assert!(cluster_exists(&dispatcher, "a").await);
    assert!(cluster_exists(&dispatcher, "b").await);
}

#[tokio::test]
async fn inner_failure_rolls_back_outer_and_inner_writes() {
    let dispatcher = dispatcher().await;

    let error = dispatcher
        .send(
            WriteClusterCommand::new("a").then(WriteClusterCommand::new("b").failing()),
            &CancellationToken::new(),
        )
        .await
        .expect_err("inner failure");

    assert_eq!(
        error.downcast_ref::<WriteRefused>(),
        Some(&WriteRefused("b".to_string()))
    );
    assert!(!cluster_exists(&dispatcher, "a").await);
    assert!(!cluster_exists(&dispatcher, "b").await);
}

#[tokio::test]
async fn outer_failure_rolls_back_completed_inner_write() {
    let dispatcher = dispatcher().await;

    let error = dispatcher
        .send(
            WriteClusterCommand::new("a")
                .then(WriteClusterCommand::new("b"))
                .failing(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("outer failure");

    assert_eq!(
        error.downcast_ref::<WriteRefused>(),
        Some(&WriteRefused("a".to_string()))
    );
    assert!(!cluster_exists(&dispatcher, "b").await);
}

#[tokio::test]
async fn failed_send_leaves_earlier_commits_alone() {
    let dispatcher = dispatcher().await;
    let cancellation = CancellationToken::new();

    dispatcher
        .send(WriteClusterCommand::new("kept"), &cancellation)
        .await
        .expect("first send");
    dispatcher
        .send(WriteClusterCommand::new("dropped").failing(), &cancellation)
        .await
        .expect_err("second send");

    assert!(cluster_exists(&dispatcher, "kept").await);
    assert!(!cluster_exists(&dispatcher, "dropped").await);
}

#[tokio::test]
async fn depth_grows_with_each_nested_dispatch() {
    let dispatcher = dispatcher().await;

    let depth = dispatcher
        .send(
            WriteClusterCommand::new("a")
                .then(WriteClusterCommand::new("b").then(WriteClusterCommand::new("c"))),
            &CancellationToken::new(),
        )
        .await
        .expect("send");

    assert_eq!(depth, 2);
}

#[tokio::test]
async fn missing_handler_is_reported_by_name() {
    let dispatcher = dispatcher().await;

    let error = dispatcher
        .send(UnregisteredQuery, &CancellationToken::new())
        .await
        .expect_err("no handler");

    assert!(matches!(
        error.downcast_ref::<DispatchError>(),
        Some(DispatchError::NoHandler("UnregisteredQuery"))
    ));
}

#[tokio::test]
async fn cancelled_send_does_not_run_the_handler() {
    let dispatcher = dispatcher().await;
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let error = dispatcher
        .send(WriteClusterCommand::new("a"), &cancellation)
        .await
        .expect_err("cancelled");

    assert!(matches!(
        error.downcast_ref::<DispatchError>(),
        Some(DispatchError::Cancelled("WriteClusterCommand"))
    ));
    assert!(!cluster_exists(&dispatcher, "a").await);
}

#[tokio::test]
async fn concurrent_sends_each_commit() {
    let dispatcher = dispatcher().await;
    let cancellation = CancellationToken::new();

    let (first, second) = tokio::join!(
        dispatcher.send(WriteClusterCommand::new("left"), &cancellation),
        dispatcher.send(WriteClusterCommand::new("right"), &cancellation),
    );

    first.expect("left");
    second.expect("right");
    assert!(cluster_exists(&dispatcher, "left").await);
    assert!(cluster_exists(&dispatcher, "right").await);
}

#[tokio::test]
async fn recovered_inner_failure_still_rolls_back() {
    let dispatcher = dispatcher().await;

    let error = dispatcher
        .send(
            WriteClusterCommand::new("a")
                .then(WriteClusterCommand::new("b").failing())
                .swallowing_inner_error(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("rollback-only transaction");

    assert!(matches!(
        error.downcast_ref::<DispatchError>(),
        Some(DispatchError::RollbackOnly("WriteClusterCommand"))
    ));
    assert!(!cluster_exists(&dispatcher, "a").await);
    assert!(!cluster_exists(&dispatcher, "b").await);
}

#[tokio::test]
async fn overlapping_send_waits_for_a_long_running_one() {
    // A configured timeout shorter than the hold is raised to the run budget.
    let config = ProvisionerConfig {
        database_acquire_timeout_secs: Some(0),
        ..ProvisionerConfig::default()
    };
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("provisioner.db");
    let db = DbClient::initialize_with_limits(
        &db_path.to_string_lossy(),
        PoolLimits::from_config(&config),
    )
    .await
    .expect("db init");
    let mut dispatcher = Dispatcher::new(db);
    dispatcher.register::<WriteClusterCommand, _>(WriteClusterHandler);
    let cancellation = CancellationToken::new();

    let slow = dispatcher.send(
        WriteClusterCommand::new("slow").holding(Duration::from_millis(300)),
        &cancellation,
    );
    let other = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher
            .send(WriteClusterCommand::new("other"), &cancellation)
            .await
    };
    let (slow, other) = tokio::join!(slow, other);

    slow.expect("slow send");
    other.expect("overlapping send");
    assert!(cluster_exists(&dispatcher, "slow").await);
    assert!(cluster_exists(&dispatcher, "other").await);
}
