//! Operator retry and skip against the in-memory store.

mod common;

use common::{default_tasks, simple_graph, task, FakePermissions, RecordingBus, CONTAINER};
use gantry_cache::MemoryKv;
use gantry_core::events::{Event, LogColor};
use gantry_core::ids::*;
use gantry_core::ports::BuildRecordRepository;
use gantry_core::record::TaskStatusUpdate;
use gantry_core::task::BuildTask;
use gantry_core::{BuildStatus, Error};
use gantry_db::memory::MemoryBuildRecordRepository;
use gantry_engine::config::RetryConfig;
use gantry_engine::{BuildRecordService, ContainerLocks, RetryCoordinator, RetryRequest};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    repo: Arc<MemoryBuildRecordRepository>,
    cache: Arc<MemoryKv>,
    records: BuildRecordService,
    bus: Arc<RecordingBus>,
    coordinator: RetryCoordinator,
    build_id: BuildId,
}

fn retry_config() -> RetryConfig {
    RetryConfig {
        lock_ttl_secs: 60,
        lock_retry_interval_ms: 5,
        lock_attempts: 20,
    }
}

async fn harness(permissions: FakePermissions, graph: gantry_core::build::BuildGraph) -> Harness {
    common::init_test_logging();
    let repo = Arc::new(MemoryBuildRecordRepository::new());
    let build_id = graph.build.build_id;
    repo.save_build(&graph).await.unwrap();
    let bus = Arc::new(RecordingBus::default());
    let cache = Arc::new(MemoryKv::new());
    let locks = ContainerLocks::new(cache.clone(), &retry_config());
    Harness {
        records: BuildRecordService::new(repo.clone()),
        coordinator: RetryCoordinator::new(repo.clone(), Arc::new(permissions), bus.clone(), locks),
        repo,
        cache,
        bus,
        build_id,
    }
}

impl Harness {
    async fn set(&self, task: &str, execute_count: u32, status: BuildStatus) {
        self.records
            .update_task_status(
                TaskStatusUpdate::new(self.build_id, TaskId::new(task), execute_count).with_status(status),
            )
            .await
            .unwrap();
    }

    /// Fail `t-2` and finish the job as failed.
    async fn fail_job(&self) {
        self.set("t-2", 1, BuildStatus::Running).await;
        self.set("t-2", 1, BuildStatus::Failed).await;
        self.records
            .update_container_status(self.build_id, &ContainerId::new(CONTAINER), 1, BuildStatus::Failed)
            .await
            .unwrap();
    }

    fn request(&self, task: &str, skip: bool) -> RetryRequest {
        RetryRequest {
            project_id: ProjectId::new("proj"),
            build_id: self.build_id,
            task_id: task.to_string(),
            execute_count: 1,
            skip,
            user_id: "bob".to_string(),
        }
    }
}

#[tokio::test]
async fn test_retry_then_succeed_leaves_one_record_for_new_attempt() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.fail_job().await;

    let outcome = h.coordinator.retry(&h.request("t-2", false)).await.unwrap().unwrap();
    assert_eq!(outcome.execute_count, 2);
    assert!(!outcome.skipped);

    let container = h
        .repo
        .get_container(h.build_id, &ContainerId::new(CONTAINER))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(container.execute_count, 2);
    assert_eq!(container.status, BuildStatus::Queue);

    h.set("t-2", 2, BuildStatus::Running).await;
    h.set("t-2", 2, BuildStatus::Succeed).await;

    let records = h.repo.list_task_records(h.build_id, &TaskId::new("t-2")).await.unwrap();
    let current: Vec<_> = records
        .iter()
        .filter(|r| r.execute_count == 2 && r.status != BuildStatus::Unexec)
        .collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].status, BuildStatus::Succeed);
    assert!(records
        .iter()
        .any(|r| r.execute_count == 1 && r.status == BuildStatus::Failed));

    let live = h.repo.get_task(h.build_id, &TaskId::new("t-2")).await.unwrap().unwrap();
    assert_eq!(live.status, BuildStatus::Succeed);
    assert_eq!(live.execute_count, 2);
}

#[tokio::test]
async fn test_retry_resets_bracketing_and_unexec_tasks() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.set("t-2", 1, BuildStatus::Running).await;
    h.set("t-2", 1, BuildStatus::Canceled).await;
    h.records
        .update_container_status(h.build_id, &ContainerId::new(CONTAINER), 1, BuildStatus::Canceled)
        .await
        .unwrap();

    h.coordinator.retry(&h.request("t-2", false)).await.unwrap().unwrap();

    for (id, expected) in [
        ("startVM-1", BuildStatus::Queue),
        ("t-1", BuildStatus::Queue),
        ("t-2", BuildStatus::Queue),
        ("t-3", BuildStatus::Queue),
        ("stopVM-1", BuildStatus::Queue),
        ("end-1", BuildStatus::Queue),
    ] {
        let live = h.repo.get_task(h.build_id, &TaskId::new(id)).await.unwrap().unwrap();
        assert_eq!(live.status, expected, "{id}");
    }
    // t-1 kept its first attempt; only reset tasks got a record for attempt 2.
    assert!(h
        .repo
        .get_task_record(h.build_id, &TaskId::new("t-1"), 2)
        .await
        .unwrap()
        .is_none());
    assert!(h
        .repo
        .get_task_record(h.build_id, &TaskId::new("t-3"), 2)
        .await
        .unwrap()
        .is_some());
    // Bracketing tasks are reset live without a new record.
    assert!(h
        .repo
        .get_task_record(h.build_id, &TaskId::new("stopVM-1"), 2)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_retry_publishes_refresh_and_log_line() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.fail_job().await;

    assert!(h.coordinator.retry_task(&h.request("t-2", false)).await.unwrap());

    let events = h.bus.published();
    assert_eq!(events.len(), 2);
    match &events[0] {
        Event::ContainerRefresh(p) => {
            assert_eq!(p.container_id.as_str(), CONTAINER);
            assert_eq!(p.execute_count, 2);
            assert_eq!(p.user_id, "bob");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match &events[1] {
        Event::BuildLog(p) => {
            assert_eq!(p.message, "bob retry fail task [test]");
            assert_eq!(p.color, LogColor::Yellow);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_skip_with_permission_marks_task_skip() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.fail_job().await;

    let outcome = h.coordinator.retry(&h.request("t-2", true)).await.unwrap().unwrap();
    assert!(outcome.skipped);

    let record = h
        .repo
        .get_task_record(h.build_id, &TaskId::new("t-2"), 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, BuildStatus::Skip);
    match &h.bus.published()[1] {
        Event::BuildLog(p) => assert_eq!(p.message, "bob skip the fail task [test]"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_skip_without_permission_retries() {
    for permissions in [FakePermissions::deny_all(), FakePermissions::failing()] {
        let h = harness(permissions, simple_graph(default_tasks)).await;
        h.fail_job().await;
        let outcome = h.coordinator.retry(&h.request("t-2", true)).await.unwrap().unwrap();
        assert!(!outcome.skipped);
    }
}

#[tokio::test]
async fn test_manual_skip_task_needs_no_permission() {
    let graph = simple_graph(|build_id| {
        let mut tasks = default_tasks(build_id);
        tasks[2].options.manual_skip = true;
        tasks
    });
    let h = harness(FakePermissions::deny_all(), graph).await;
    h.fail_job().await;
    let outcome = h.coordinator.retry(&h.request("t-2", true)).await.unwrap().unwrap();
    assert!(outcome.skipped);
}

#[tokio::test]
async fn test_running_job_cannot_be_retried() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.set("t-2", 1, BuildStatus::Running).await;
    h.set("t-2", 1, BuildStatus::Failed).await;

    let err = h.coordinator.retry(&h.request("t-2", false)).await.unwrap_err();
    assert!(matches!(err, Error::JobStillRunning { .. }));
    assert!(h.bus.published().is_empty());

    // The failed precondition released the lock.
    h.records
        .update_container_status(h.build_id, &ContainerId::new(CONTAINER), 1, BuildStatus::Failed)
        .await
        .unwrap();
    assert!(h.coordinator.retry_task(&h.request("t-2", false)).await.unwrap());
}

#[tokio::test]
async fn test_only_failed_or_cancelled_tasks_retry() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.fail_job().await;
    h.set("t-1", 1, BuildStatus::Running).await;
    h.set("t-1", 1, BuildStatus::Succeed).await;

    let err = h.coordinator.retry(&h.request("t-1", false)).await.unwrap_err();
    assert!(matches!(err, Error::TaskNotRetryable { .. }));
    assert!(err.is_user_facing());
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    assert!(!h.coordinator.retry_task(&h.request("nope", false)).await.unwrap());
}

#[tokio::test]
async fn test_task_resolved_by_step_alias() {
    let graph = simple_graph(|build_id| {
        let mut tasks = default_tasks(build_id);
        tasks[2] = BuildTask {
            step_id: Some("unit-tests".to_string()),
            ..task(build_id, "t-2", "test", 3)
        };
        tasks
    });
    let h = harness(FakePermissions::allow_all(), graph).await;
    h.fail_job().await;

    let outcome = h.coordinator.retry(&h.request("unit-tests", false)).await.unwrap().unwrap();
    assert_eq!(outcome.task_id.as_str(), "t-2");
}

#[tokio::test]
async fn test_concurrent_retries_admit_one() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.fail_job().await;
    let request = h.request("t-2", false);

    let (a, b) = tokio::join!(h.coordinator.retry(&request), h.coordinator.retry(&request));
    let succeeded = [&a, &b].iter().filter(|r| matches!(r, Ok(Some(_)))).count();
    assert_eq!(succeeded, 1);

    let container = h
        .repo
        .get_container(h.build_id, &ContainerId::new(CONTAINER))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(container.execute_count, 2);
}

#[tokio::test]
async fn test_retry_rechecks_task_after_waiting_for_lock() {
    let h = harness(FakePermissions::allow_all(), simple_graph(default_tasks)).await;
    h.fail_job().await;
    let container_id = ContainerId::new(CONTAINER);

    // Someone else holds the job lock while a competing retry runs to success.
    let holder = ContainerLocks::new(h.cache.clone(), &retry_config());
    let guard = holder.acquire(h.build_id, &container_id).await.unwrap();
    let competitor = RetryCoordinator::new(
        h.repo.clone(),
        Arc::new(FakePermissions::allow_all()),
        Arc::new(RecordingBus::default()),
        ContainerLocks::new(Arc::new(MemoryKv::new()), &retry_config()),
    );

    let competing = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        competitor.retry(&h.request("t-2", false)).await.unwrap().unwrap();
        h.set("t-2", 2, BuildStatus::Running).await;
        h.set("t-2", 2, BuildStatus::Succeed).await;
        h.records
            .update_container_status(h.build_id, &container_id, 2, BuildStatus::Succeed)
            .await
            .unwrap();
        guard.release().await;
    };
    let request = h.request("t-2", false);
    let (result, ()) = tokio::join!(h.coordinator.retry(&request), competing);

    let err = result.unwrap_err();
    assert!(matches!(err, Error::TaskNotRetryable { ref status, .. } if status == "SUCCEED"), "{err:?}");
    let container = h.repo.get_container(h.build_id, &container_id).await.unwrap().unwrap();
    assert_eq!(container.execute_count, 2);
    assert_eq!(container.status, BuildStatus::Succeed);
}
