//! UDP transport for the NTP protocol stack: session tables, the
//! registration/0-RTT-revival state machines, and the socket loop that
//! drives both.
//!
//! Everything under [`endpoint`] and [`agent`] is plain synchronous
//! dispatch over a session table, unit-tested without a runtime; [`run`]
//! is the thin `tokio` shell that feeds it real datagrams.

pub mod agent;
pub mod endpoint;
pub mod keystore;
pub mod session;

pub use agent::{AgentAction, AgentEndpoint};
pub use endpoint::{Action, EndpointError, ServerEndpoint, TaskCatalogue};
pub use keystore::Keystore;
pub use session::{Session, SessionState};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, warn};

const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Persists, deletes and loads the revival keystore. External collaborator
/// per the protocol's stated non-goals (keystore file I/O); a concrete
/// implementation backs it with `tokio::fs`, an in-memory store backs
/// tests.
#[async_trait::async_trait]
pub trait KeystoreStore: Send + Sync {
    async fn save(&self, keystore: &Keystore);
    async fn load(&self) -> Option<Keystore>;
    async fn delete(&self);
}

/// Runs the server side: binds `addr`, dispatches every inbound datagram
/// through [`ServerEndpoint::handle_inbound`], and executes the actions it
/// returns. `catalogue` supplies the task subset pushed to a newly
/// registered agent; `metrics` receives every decoded `SEND_METRICS`
/// report.
pub async fn run_server(
    addr: SocketAddr,
    catalogue: Arc<dyn TaskCatalogue>,
    metrics: mpsc::Sender<([u8; 16], String, spack::MetricReport)>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(addr).await?;
    let endpoint = ServerEndpoint::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    let mut retransmission_tick = tokio::time::interval(Duration::from_millis(ntp_flow::DEFAULT_RETRANSMISSION_TIMEOUT_MS));

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = result?;
                for action in endpoint.handle_inbound(&buf[..len], peer, catalogue.as_ref()) {
                    dispatch_server_action(&socket, &metrics, action).await;
                }
            }
            _ = retransmission_tick.tick() => {
                for action in endpoint.poll_retransmissions() {
                    dispatch_server_action(&socket, &metrics, action).await;
                }
            }
        }
    }
}

async fn dispatch_server_action(
    socket: &UdpSocket,
    metrics: &mpsc::Sender<([u8; 16], String, spack::MetricReport)>,
    action: Action,
) {
    match action {
        Action::Send { to, bytes } => {
            if let Err(e) = socket.send_to(&bytes, to).await {
                warn!(error = %e, %to, "failed to send reply");
            }
        }
        Action::MetricReceived { session_id, task_id, report } => {
            if metrics.send((session_id, task_id, report)).await.is_err() {
                error!("metrics receiver dropped");
            }
        }
        Action::PersistKeystore(_) | Action::DeleteKeystore | Action::DeleteSession(_) => {
            // Server-side sessions are held entirely in the in-process
            // table and already removed by the endpoint itself before this
            // action reaches the I/O loop; only the agent persists a
            // keystore to disk.
        }
    }
}

/// Runs the agent side against the server `agent` was constructed with:
/// attempts 0-RTT revival if `keystore_store` holds a keystore, otherwise performs a fresh
/// handshake, then dispatches inbound traffic until the socket closes or a
/// terminal `CONNECTION_REJECTED`/max-retransmission failure occurs.
///
/// `socket` and `agent` are shared with the caller (the monitoring worker
/// sends `SEND_METRICS` through the same socket via [`send_agent_metrics`])
/// rather than owned outright, so both are passed in already constructed.
pub async fn run_agent(
    socket: Arc<UdpSocket>,
    agent: Arc<AgentEndpoint>,
    keystore_store: Arc<dyn KeystoreStore>,
    tasks: mpsc::Sender<std::collections::BTreeMap<String, spack::Task>>,
) -> std::io::Result<()> {
    let initial_actions = match keystore_store.load().await {
        Some(ks) => agent.start_revival(ks),
        None => agent.start_register(),
    };
    for action in initial_actions {
        dispatch_agent_action(&socket, &keystore_store, &tasks, action).await;
    }

    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let (len, _peer) = tokio::time::timeout(Duration::from_secs(30), socket.recv_from(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no traffic from server"))??;
        for action in agent.handle_inbound(&buf[..len]) {
            dispatch_agent_action(&socket, &keystore_store, &tasks, action).await;
        }
    }
}

async fn dispatch_agent_action(
    socket: &UdpSocket,
    keystore_store: &Arc<dyn KeystoreStore>,
    tasks: &mpsc::Sender<std::collections::BTreeMap<String, spack::Task>>,
    action: AgentAction,
) {
    match action {
        AgentAction::Send { to, bytes } | AgentAction::SendMetrics { to, bytes } => {
            if let Err(e) = socket.send_to(&bytes, to).await {
                warn!(error = %e, %to, "failed to send");
            }
        }
        AgentAction::PersistKeystore(ks) => keystore_store.save(&ks).await,
        AgentAction::DeleteKeystore => keystore_store.delete().await,
        AgentAction::TasksReceived(task_collection) => {
            if tasks.send(task_collection).await.is_err() {
                error!("task-collection receiver dropped");
            }
        }
        AgentAction::Terminate(reason) => {
            error!(?reason, "server rejected this agent; exiting");
            std::process::exit(1);
        }
    }
}

/// Encodes and sends one `SEND_METRICS` datagram through `socket`. Used by
/// the monitoring worker, which otherwise has no access to `run_agent`'s
/// dispatch loop.
pub async fn send_agent_metrics(socket: &UdpSocket, agent: &AgentEndpoint, task_id: &str, blob: Vec<u8>) {
    for action in agent.send_metrics(task_id, blob) {
        if let AgentAction::SendMetrics { to, bytes } = action {
            if let Err(e) = socket.send_to(&bytes, to).await {
                warn!(error = %e, %to, "failed to send metrics");
            }
        }
    }
}
