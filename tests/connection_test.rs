mod support;

use std::sync::Arc;
use std::time::Duration;

use edge_runner::config_intake::ConfigIntake;
use edge_runner::engine::{ConfigSink, ConnectionEngine};
use edge_runner::error::RunnerError;
use edge_runner::supervisor::ToolProviderSupervisor;
use edge_runner::types::{ConnectionState, RunnerConfig};

use support::MockControlPlane;

fn config_for(url: String) -> RunnerConfig {
    RunnerConfig {
        cp_url: url,
        auth_token: "s3cr3t".to_string(),
        runner_name: "integration-test".to_string(),
        reconnect_delay_initial: Duration::from_millis(5),
        reconnect_delay_max: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(30),
        health_check_interval: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn registers_successfully_and_reaches_connected() {
    let cp = MockControlPlane::bind().await;
    let url = cp.ws_url();

    let server = tokio::spawn(async move {
        let mut session = cp.accept().await;
        let req = session.handle_registration(true).await;
        assert_eq!(req["method"], "runner/register");
        assert_eq!(req["params"]["token"], "s3cr3t");
        session
    });

    let engine = ConnectionEngine::new(config_for(url));
    engine.start().await.expect("registration should succeed");
    assert_eq!(engine.state().await, ConnectionState::Connected);

    engine.stop().await;
    let session = server.await.unwrap();
    session.close().await;
}

#[tokio::test]
async fn auth_failure_is_returned_from_start_and_does_not_reconnect() {
    let cp = MockControlPlane::bind().await;
    let url = cp.ws_url();

    let server = tokio::spawn(async move {
        let mut session = cp.accept().await;
        session.handle_registration(false).await;
        session
    });

    let engine = ConnectionEngine::new(config_for(url));
    let err = engine.start().await.expect_err("bad token must fail start()");
    assert!(matches!(err, RunnerError::AuthFailed { .. }));
    assert_eq!(engine.state().await, ConnectionState::Disconnected);

    let session = server.await.unwrap();
    session.close().await;
}

#[tokio::test]
async fn config_push_is_routed_to_the_installed_sink_and_replied_to() {
    let cp = MockControlPlane::bind().await;
    let url = cp.ws_url();

    let engine = ConnectionEngine::new(config_for(url));
    let supervisor = Arc::new(ToolProviderSupervisor::new(Duration::from_secs(30)));
    let intake = Arc::new(ConfigIntake::new(supervisor));
    engine.set_config_sink(intake as Arc<dyn ConfigSink>).await;

    let server = tokio::spawn(async move {
        let mut session = cp.accept().await;
        session.handle_registration(true).await;

        session
            .send_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "config/push",
                "params": {"mcps": {}},
            }))
            .await;

        let reply = session.recv_json().await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["status"], "ok");
        assert_eq!(reply["result"]["mcps_received"], 0);

        session
    });

    engine.start().await.expect("registration should succeed");

    let session = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server task should finish promptly")
        .unwrap();

    engine.stop().await;
    session.close().await;
}
