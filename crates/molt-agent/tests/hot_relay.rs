//! End-to-end hot relay: the real supervisor driving the reference agent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use molt_supervisor::config::HookConfig;
use molt_supervisor::{GenerationId, GenerationState, RelayRequest, Supervisor, SupervisorConfig, SupervisorError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn agent_config(runtime_dir: &std::path::Path) -> SupervisorConfig {
    SupervisorConfig::for_tests(vec![env!("CARGO_BIN_EXE_molt-agent").to_string()], runtime_dir)
}

fn client() -> reqwest::Client {
    // Fresh connection per request so each one is accepted by whichever
    // generation currently owns the listener.
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn recall(client: &reqwest::Client, supervisor: &Supervisor) -> Value {
    client
        .get(format!("http://{}/", supervisor.local_addr()))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn remember(client: &reqwest::Client, supervisor: &Supervisor, message: &str) {
    let response = client
        .post(format!("http://{}/", supervisor.local_addr()))
        .body(message.to_string())
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

async fn wait_until_terminated(supervisor: &Supervisor, id: GenerationId) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = supervisor.status().await;
            if status.generation(id).map(|g| g.state) == Some(GenerationState::Terminated) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("previous generation did not terminate");
}

/// Relay once the previous retirement has released the handoff lock.
async fn relay_when_idle(supervisor: &Supervisor) -> GenerationId {
    for _ in 0..100 {
        match supervisor.relay(RelayRequest::default()).await {
            Err(SupervisorError::HandoffInProgress) => tokio::time::sleep(Duration::from_millis(50)).await,
            result => return result.unwrap(),
        }
    }
    panic!("handoff lock never released");
}

#[tokio::test]
async fn test_memory_survives_relay() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::start(agent_config(dir.path())).await.unwrap();
    let client = client();

    let before = recall(&client, &supervisor).await;
    assert_eq!(before["status"], "alive");
    assert_eq!(before["memory_size"], 0);
    assert_eq!(before["generation"], 1);

    remember(&client, &supervisor, "hello").await;

    let promoted = supervisor.relay(RelayRequest::default()).await.unwrap();
    assert_eq!(promoted, GenerationId::new(2));
    wait_until_terminated(&supervisor, GenerationId::FIRST).await;

    let after = recall(&client, &supervisor).await;
    assert_eq!(after["generation"], 2);
    assert_eq!(after["memory_size"], 1);
    assert_eq!(after["history"], serde_json::json!(["hello"]));
    assert_eq!(after["session_id"], before["session_id"]);
    assert_ne!(after["pid"], before["pid"]);

    let status = supervisor.status().await;
    assert_eq!(status.active, Some(GenerationId::new(2)));
    assert_eq!(status.relays.succeeded, 1);

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_traffic_flows_through_repeated_relays() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::start(agent_config(dir.path())).await.unwrap();
    remember(&client(), &supervisor, "steady").await;

    let served = Arc::new(AtomicU64::new(0));
    let refused = Arc::new(AtomicU64::new(0));
    let stop = CancellationToken::new();

    let mut callers = Vec::new();
    for _ in 0..4 {
        let (served, refused, stop) = (Arc::clone(&served), Arc::clone(&refused), stop.clone());
        let url = format!("http://{}/", supervisor.local_addr());
        callers.push(tokio::spawn(async move {
            let client = client();
            while !stop.is_cancelled() {
                let outcome = match client.get(&url).send().await {
                    Ok(response) if response.status().is_success() => response.json::<Value>().await.ok(),
                    _ => None,
                };
                match outcome {
                    Some(body) if body["history"] == serde_json::json!(["steady"]) => {
                        served.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        refused.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    let mut previous = GenerationId::FIRST;
    for expected in 2..=4 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let promoted = relay_when_idle(&supervisor).await;
        assert_eq!(promoted, GenerationId::new(expected));
        wait_until_terminated(&supervisor, previous).await;
        previous = promoted;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    stop.cancel();
    for caller in callers {
        caller.await.unwrap();
    }

    let (served, refused) = (served.load(Ordering::Relaxed), refused.load(Ordering::Relaxed));
    assert!(served > 0);
    assert_eq!(refused, 0, "{refused} of {} requests failed during relays", served + refused);
    assert_eq!(supervisor.status().await.relays.succeeded, 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failed_successor_keeps_memory_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = agent_config(dir.path());
    config.handoff.ready_timeout_ms = 1_500;
    let supervisor = Supervisor::start(config).await.unwrap();
    let client = client();

    remember(&client, &supervisor, "keep me").await;

    let err = supervisor
        .relay(RelayRequest {
            command: Some(vec!["sh".into(), "-c".into(), "exec sleep 30".into()]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Timeout { .. }), "{err}");

    let status = supervisor.status().await;
    assert_eq!(status.active, Some(GenerationId::FIRST));
    assert_eq!(status.relays.failed, 1);
    assert_eq!(
        status.generation(GenerationId::new(2)).map(|g| g.state),
        Some(GenerationState::Failed)
    );

    let current = recall(&client, &supervisor).await;
    assert_eq!(current["generation"], 1);
    assert_eq!(current["history"], serde_json::json!(["keep me"]));

    // The broken command was never adopted.
    let promoted = supervisor.relay(RelayRequest::default()).await.unwrap();
    assert_eq!(promoted, GenerationId::new(3));
    wait_until_terminated(&supervisor, GenerationId::FIRST).await;

    let after = recall(&client, &supervisor).await;
    assert_eq!(after["generation"], 3);
    assert_eq!(after["history"], serde_json::json!(["keep me"]));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_relay_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = agent_config(dir.path());
    config.pre_flight.push(HookConfig {
        name: "settle".into(),
        command: vec!["sleep".into(), "1".into()],
        timeout_ms: 5_000,
    });
    let supervisor = Supervisor::start(config).await.unwrap();

    let first = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.relay(RelayRequest::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = supervisor.relay(RelayRequest::default()).await;
    assert!(matches!(second, Err(SupervisorError::HandoffInProgress)));

    assert_eq!(first.await.unwrap().unwrap(), GenerationId::new(2));

    supervisor.shutdown().await;
}
