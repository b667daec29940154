
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use node_agent::error::AgentError;
use node_agent::shutdown::AgentState;
use node_agent::tasks::{CleanupAction, JobId};
use test_harness::*;

const WAIT: Duration = Duration::from_secs(30);

/// Minimal HTTP/1.1 exchange over a real socket.
async fn http(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_servers_answer_over_tcp() {
    let mut t = TestAgent::bind(test_config());
    t.start().await;

    let cluster = t.cluster.clone();
    assert!(wait_for(WAIT, || cluster.heartbeat_count() >= 1).await);

    let callback = t.agent.identity().callback_addr;
    let response = http(callback, "GET", "/alive", "").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#"{"alive":true}"#));

    let action = t.agent.identity().action_addr;
    let launch = r#"[{"session":{"handle":"s1","coordinator_addr":"coordinator-s1:9000"},"action":{"type":"launch_task","work":{"task_id":"t1","job_id":"j1","kind":"map"}}}]"#;
    let response = http(action, "POST", "/actions", launch).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""accepted":1"#));
    assert!(t.queues.launches.recv().await.is_some());

    let response = http(callback, "POST", "/sessions/s1/blacklist", "").await;
    assert!(response.contains(r#""blacklisted":true"#));
    let cleanup = tokio::time::timeout(WAIT, t.queues.cleanups.recv()).await.unwrap();
    assert!(matches!(
        cleanup,
        Some(CleanupAction::KillJob { ref job_id, .. }) if *job_id == JobId::from("j1")
    ));

    t.stop().await;
    assert_eq!(t.agent.state(), AgentState::Stopped);
    assert!(TcpStream::connect(callback).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_shutdown_stops_everything() {
    let mut t = TestAgent::bind(test_config());
    t.start().await;
    assert_eq!(t.agent.state(), AgentState::Running);

    t.agent
        .dispatcher()
        .submit_actions(vec![node_agent::dispatch::SessionAction::new(
            session("s1"),
            node_agent::dispatch::Action::LaunchTask { work: work("t1", "j1") },
        )])
        .await;
    assert!(wait_for_reporter(&t.agent, "j1", WAIT).await);

    t.stop().await;
    assert_eq!(t.agent.state(), AgentState::Stopped);
    assert_eq!(t.agent.context().registry.reporter_count().await, 0);

    // Nothing keeps talking after stop
    let heartbeats = t.cluster.heartbeat_count();
    let addr = session("s1").coordinator_addr;
    let reports = t.coordinators.heartbeats_to(&addr).len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(t.cluster.heartbeat_count(), heartbeats);
    assert_eq!(t.coordinators.heartbeats_to(&addr).len(), reports);

    // A second shutdown is a no-op
    t.agent.shutdown();
    assert_eq!(t.agent.state(), AgentState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_disallowed_node_reaches_stopped() {
    let cluster = FakeClusterManager::always(ClusterReply::Disallowed);
    let mut t = TestAgent::bind_with(test_config(), cluster);
    t.start().await;

    tokio::time::timeout(WAIT, t.agent.wait_stopped())
        .await
        .expect("agent should stop on its own");
    assert_eq!(t.agent.state(), AgentState::Stopped);
    assert!(t.agent.lifecycle().is_shutting_down());
}

#[tokio::test]
async fn test_run_twice_is_rejected() {
    let mut t = TestAgent::bind(test_config());
    t.start().await;

    let err = t.agent.run().await.unwrap_err();
    assert!(matches!(err, AgentError::Internal(_)));
    t.stop().await;
}

#[tokio::test]
async fn test_shutdown_before_run() {
    let t = TestAgent::bind(test_config());
    t.agent.shutdown();
    t.agent.run().await.unwrap();
    assert_eq!(t.agent.state(), AgentState::Stopped);
    assert_eq!(t.cluster.heartbeat_count(), 0);
}

#[tokio::test]
async fn test_identity_uses_bound_ports() {
    let t = TestAgent::bind(test_config());
    let identity = t.agent.identity();
    assert_eq!(identity.name, "test-node");
    assert_ne!(identity.callback_addr.port(), 0);
    assert_ne!(identity.action_addr.port(), 0);
    assert_ne!(identity.callback_addr.port(), identity.action_addr.port());
    assert_eq!(identity.total.num_cpus, 8);
    assert_eq!(identity.total.network_mbps, 100);
}
