
use std::sync::atomic::Ordering;
use std::time::Duration;

use node_agent::dispatch::{Action, SessionAction};
use node_agent::shutdown::AgentState;
use node_agent::tasks::{CleanupAction, JobId, TaskId, TaskRunState, WorkDescriptor};
use test_harness::*;

const WAIT: Duration = Duration::from_secs(30);

async fn launch(t: &TestAgent, handle: &str, w: WorkDescriptor) -> usize {
    t.agent
        .dispatcher()
        .submit_actions(vec![SessionAction::new(
            session(handle),
            Action::LaunchTask { work: w },
        )])
        .await
}

#[tokio::test(start_paused = true)]
async fn test_response_id_is_forwarded_in_order() {
    let mut t = TestAgent::bind(test_config());
    t.start().await;
    assert_eq!(launch(&t, "s1", work("t1", "j1")).await, 1);

    let coordinators = t.coordinators.clone();
    let addr = session("s1").coordinator_addr;
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&addr).len() >= 4).await);

    let heartbeats = t.coordinators.heartbeats_to(&addr);
    assert_eq!(heartbeats[0].last_response_id, -1);
    for (i, heartbeat) in heartbeats.iter().enumerate().skip(1) {
        assert_eq!(heartbeat.last_response_id, i as i32);
    }
    assert_eq!(heartbeats[0].status.node_name, "test-node");
    assert_eq!(
        heartbeats[0].status.action_addr,
        t.agent.identity().action_addr.to_string()
    );
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_assigned_interval_paces_reporter() {
    let mut t = TestAgent::bind(test_config());
    t.coordinators.set_interval_ms(500);
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;

    let coordinators = t.coordinators.clone();
    let addr = session("s1").coordinator_addr;
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&addr).len() >= 4).await);

    let heartbeats = t.coordinators.heartbeats_to(&addr);
    for pair in heartbeats.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(500));
    }
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_job_sends_slow_heartbeat() {
    let mut config = test_config();
    config.slow_heartbeat_ceiling_ms = 1_000;
    let mut t = TestAgent::bind(config);
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;

    let coordinators = t.coordinators.clone();
    let addr = session("s1").coordinator_addr;
    assert!(wait_for(WAIT, || !coordinators.heartbeats_to(&addr).is_empty()).await);
    assert!(
        t.agent
            .task_finished(&TaskId::from("t1"), TaskRunState::Succeeded, None)
            .await
    );

    // Wait for the heartbeat that reports t1 as finished
    assert!(
        wait_for(WAIT, || coordinators.heartbeats_to(&addr).iter().any(|h| h
            .status
            .tasks
            .iter()
            .any(|s| s.state == TaskRunState::Succeeded)))
        .await
    );
    let reported_at = t.coordinators.heartbeats_to(&addr).len();

    // No tasks left: silence until the ceiling, then one empty heartbeat
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&addr).len() > reported_at).await);
    let heartbeats = t.coordinators.heartbeats_to(&addr);
    let last_with_tasks = &heartbeats[reported_at - 1];
    let slow = &heartbeats[reported_at];
    assert!(slow.status.tasks.is_empty());
    assert!(slow.at.duration_since(last_with_tasks.at) > Duration::from_millis(1_000));
    assert!(t.agent.reporters().is_reporting(&JobId::from("j1")).await);
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_purges_session() {
    let mut t = TestAgent::bind(test_config());
    t.coordinators.set_version("0.0.0-other");
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;

    let coordinators = t.coordinators.clone();
    assert!(wait_for(WAIT, || !coordinators.failures().is_empty()).await);
    let failures = t.coordinators.failures();
    let failure = &failures[0];
    assert!(failure.message.contains("Incompatible build version"));
    assert_eq!(failure.kind, None);

    let cleanup = tokio::time::timeout(WAIT, t.queues.cleanups.recv())
        .await
        .expect("purge should queue a cleanup");
    assert!(matches!(
        cleanup,
        Some(CleanupAction::KillJob { ref job_id, .. }) if *job_id == JobId::from("j1")
    ));

    let ctx = t.agent.context().clone();
    assert!(ctx.ledger.lock().await.get(&TaskId::from("t1")).is_none());
    assert!(!t.agent.reporters().is_reporting(&JobId::from("j1")).await);
    assert!(t.coordinators.heartbeats_to(&session("s1").coordinator_addr).is_empty());
    // Session-level failure, the agent keeps running
    assert_eq!(t.agent.state(), AgentState::Running);
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_version_check_can_be_disabled() {
    let mut t = TestAgent::bind(test_config().with_version_check(false));
    t.coordinators.set_version("0.0.0-other");
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;

    let coordinators = t.coordinators.clone();
    let addr = session("s1").coordinator_addr;
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&addr).len() >= 2).await);
    assert!(t.coordinators.failures().is_empty());
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_coordinator_only_affects_its_session() {
    let mut t = TestAgent::bind(test_config());
    t.coordinators.make_failing(&session("bad").coordinator_addr);
    t.start().await;
    launch(&t, "bad", work("t1", "j1")).await;
    launch(&t, "good", work("t2", "j2")).await;

    let ctx = t.agent.context().clone();
    let mut purged = false;
    for _ in 0..100 {
        if ctx.ledger.lock().await.get(&TaskId::from("t1")).is_none() {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(purged);

    let coordinators = t.coordinators.clone();
    let good = session("good").coordinator_addr;
    let before = t.coordinators.heartbeats_to(&good).len();
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&good).len() >= before + 2).await);
    assert!(ctx.ledger.lock().await.get(&TaskId::from("t2")).is_some());
    assert!(t.agent.reporters().is_reporting(&JobId::from("j2")).await);
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disk_error_reported_and_session_purged() {
    let mut t = TestAgent::bind(test_config());
    t.resources.fail_disk();
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;

    let coordinators = t.coordinators.clone();
    assert!(wait_for(WAIT, || !coordinators.failures().is_empty()).await);
    let failures = t.coordinators.failures();
    let failure = &failures[0];
    assert_eq!(failure.kind.as_deref(), Some("DiskError"));

    let reporters = t.agent.reporters();
    let mut stopped = false;
    for _ in 0..100 {
        if !reporters.is_reporting(&JobId::from("j1")).await {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(stopped);
    assert_eq!(t.agent.state(), AgentState::Running);
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_coordinator_kills_job() {
    let mut t = TestAgent::bind(test_config());
    t.coordinators.make_unreachable(&session("s1").coordinator_addr);
    t.start().await;

    assert_eq!(launch(&t, "s1", work("t1", "j1")).await, 1);
    assert!(t.queues.launches.recv().await.is_some());

    let cleanup = tokio::time::timeout(WAIT, t.queues.cleanups.recv())
        .await
        .expect("failed connect should kill the job");
    assert_eq!(
        cleanup,
        Some(CleanupAction::KillJob {
            job_id: JobId::from("j1"),
            tasks: vec![TaskId::from("t1")],
        })
    );
    assert!(!t.agent.reporters().is_reporting(&JobId::from("j1")).await);
    assert!(t.agent.context().ledger.lock().await.is_empty());

    // Later launches for the job are stale
    assert_eq!(launch(&t, "s1", work("t2", "j1")).await, 0);
    assert_eq!(t.agent.state(), AgentState::Running);
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_kills_job() {
    let mut config = test_config();
    config.coordinator_connect_timeout_ms = 1_000;
    let mut t = TestAgent::bind(config);
    t.coordinators
        .make_slow(&session("s1").coordinator_addr, Duration::from_secs(5));
    t.start().await;

    assert_eq!(launch(&t, "s1", work("t1", "j1")).await, 1);
    let cleanup = tokio::time::timeout(WAIT, t.queues.cleanups.recv())
        .await
        .expect("connect timeout should kill the job");
    assert!(matches!(
        cleanup,
        Some(CleanupAction::KillJob { ref job_id, .. }) if *job_id == JobId::from("j1")
    ));
    assert!(t.agent.context().ledger.lock().await.is_empty());
    assert!(!t.agent.reporters().is_reporting(&JobId::from("j1")).await);
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_finished_task_wakes_reporter_early() {
    let mut t = TestAgent::bind(test_config());
    t.coordinators.set_interval_ms(10_000);
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;

    let coordinators = t.coordinators.clone();
    let addr = session("s1").coordinator_addr;
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&addr).len() == 1).await);
    let first = t.coordinators.heartbeats_to(&addr)[0].at;

    t.agent
        .task_finished(&TaskId::from("t1"), TaskRunState::Failed, Some("exit code 1".to_string()))
        .await;
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&addr).len() == 2).await);

    let second = &t.coordinators.heartbeats_to(&addr)[1];
    assert!(second.at.duration_since(first) < Duration::from_secs(1));
    let status = &second.status.tasks[0];
    assert_eq!(status.state, TaskRunState::Failed);
    assert_eq!(status.diagnostics.as_deref(), Some("exit code 1"));
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_counters_gated_by_update_interval() {
    let mut config = test_config();
    config.counter_update_interval_ms = 1_000;
    let mut t = TestAgent::bind(config);
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;
    t.agent
        .update_task_progress(
            &TaskId::from("t1"),
            0.5,
            [("records".to_string(), 10u64)].into_iter().collect(),
        )
        .await;

    let coordinators = t.coordinators.clone();
    let addr = session("s1").coordinator_addr;
    assert!(wait_for(WAIT, || coordinators.heartbeats_to(&addr).len() >= 15).await);

    let heartbeats = t.coordinators.heartbeats_to(&addr);
    let with_counters: Vec<_> = heartbeats.iter().filter(|h| h.status.include_counters).collect();
    assert!(with_counters.len() >= 2);
    assert!(with_counters.len() < heartbeats.len());
    for pair in with_counters.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(1_000));
    }
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_reporter_per_job() {
    let mut t = TestAgent::bind(test_config());
    t.start().await;
    assert_eq!(launch(&t, "s1", work("t1", "j1")).await, 1);
    assert_eq!(launch(&t, "s1", work("t2", "j1")).await, 1);

    assert!(wait_for_reporter(&t.agent, "j1", WAIT).await);
    assert_eq!(t.coordinators.connects.load(Ordering::SeqCst), 1);
    assert_eq!(t.agent.context().registry.reporter_count().await, 1);
    t.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_reporter_sends_nothing_more() {
    let mut t = TestAgent::bind(test_config());
    t.start().await;
    launch(&t, "s1", work("t1", "j1")).await;

    let coordinators = t.coordinators.clone();
    let addr = session("s1").coordinator_addr;
    assert!(wait_for(WAIT, || !coordinators.heartbeats_to(&addr).is_empty()).await);

    let reporters = t.agent.reporters();
    assert!(reporters.stop(&JobId::from("j1")).await);
    assert!(!reporters.stop(&JobId::from("j1")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let count = t.coordinators.heartbeats_to(&addr).len();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(t.coordinators.heartbeats_to(&addr).len(), count);
    assert_eq!(t.coordinators.closes.load(Ordering::SeqCst), 1);
    t.stop().await;
}
