//! A server process killed mid-connection.
//!
//! The test binary re-executes itself filtered to `crash_child_server`, which
//! only does anything when `SHMLANE_CRASH_CHILD` is set.

mod common;

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use common::{TempBase, init_tracing};
use shmlane::{Address, DisconnectReason, MessageType, TransportConfig};

const CHILD_ENV: &str = "SHMLANE_CRASH_CHILD";
const SESSION: &str = "scenario-d";

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_child_server() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let config = TransportConfig::from_env().unwrap();
    let mut server = shmlane::listen(&Address::new(SESSION), config).await.unwrap();
    loop {
        let mut stream = server.accept().await.unwrap();
        tokio::spawn(async move {
            while let Ok(incoming) = stream.next_message().await {
                let message = incoming.into_message();
                if stream
                    .reply(message.msg_type, message.payload, message.message_id)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_server_surfaces_disconnect() {
    init_tracing();
    let base = TempBase::new("crash");
    let config = base.config();
    let address = Address::new(SESSION);

    let child = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "crash_child_server", "--nocapture"])
        .env(CHILD_ENV, "1")
        .env("SHMLANE_BASE_PATH", &base.path)
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let mut child = KillOnDrop(child);
    let server_pid = child.0.id();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut stream = loop {
        match shmlane::connect(&address, &config).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() < deadline => {
                tracing::debug!(%e, "server not up yet");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("child server never accepted: {e}"),
        }
    };
    assert_eq!(stream.connection().peer_pid(), server_pid);

    let id = stream
        .send(MessageType::CHAT_MESSAGE, "are you there")
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(10), stream.next_message())
        .await
        .unwrap()
        .unwrap()
        .into_message();
    assert_eq!(reply.message_id, id);

    child.0.kill().unwrap();
    child.0.wait().unwrap();

    let started = Instant::now();
    let err = loop {
        match stream.heartbeat().await {
            Ok(_) => {
                assert!(
                    started.elapsed() < Duration::from_secs(5),
                    "sends kept succeeding after the server died"
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(e) => break e,
        }
    };
    assert_eq!(
        err.disconnect_reason(),
        Some(DisconnectReason::PeerExited { pid: server_pid }),
        "{err}"
    );

    // With the listener gone, new connections fail fast instead of waiting.
    let err = shmlane::connect(&address, &config).await.unwrap_err();
    assert!(matches!(err, shmlane::TransportError::NoListener { .. }), "{err}");
}
