mod keystore_file;
mod worker;

use clap::Parser;
use keystore_file::FileKeystoreStore;
use ntp_transport::AgentEndpoint;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use worker::{SyntheticMetricSource, TaskWorker};

/// Runs a monitoring agent: handshakes (or revives) against a server,
/// receives its task catalogue, and streams metrics and alerts back.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to register or revive against.
    #[arg(long, env = "NTP_SERVER_ADDR")]
    server: SocketAddr,

    /// Address of the alert-channel TCP server.
    #[arg(long, env = "NTP_ALERT_ADDR")]
    alert_server: SocketAddr,

    /// Where the 0-RTT revival keystore is persisted.
    #[arg(long, env = "NTP_KEYSTORE_PATH", default_value = "ntp-agent.keystore")]
    keystore_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    let agent = Arc::new(AgentEndpoint::new(args.server));
    let keystore_store = Arc::new(FileKeystoreStore::new(args.keystore_path));
    let device_source = Arc::new(SyntheticMetricSource::new());
    let link_probe: Arc<dyn worker::LinkProbe> = device_source.clone();
    let device_source: Arc<dyn worker::DeviceMetricSource> = device_source;

    let (tasks_tx, mut tasks_rx) = tokio::sync::mpsc::channel::<BTreeMap<String, spack::Task>>(8);

    let transport_task = tokio::spawn(ntp_transport::run_agent(
        socket.clone(),
        agent.clone(),
        keystore_store,
        tasks_tx,
    ));

    let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                for (_, handle) in workers.drain() {
                    handle.abort();
                }
                transport_task.abort();
                break;
            }
            tasks = tasks_rx.recv() => {
                let Some(tasks) = tasks else {
                    warn!("transport loop exited, shutting down");
                    break;
                };
                info!(count = tasks.len(), "received task catalogue");
                workers.retain(|task_id, handle| {
                    let keep = tasks.contains_key(task_id);
                    if !keep {
                        info!(task = %task_id, "task removed, stopping worker");
                        handle.abort();
                    }
                    keep
                });
                for (task_id, task) in tasks {
                    if workers.contains_key(&task_id) {
                        continue;
                    }
                    let worker = TaskWorker {
                        task_id: task_id.clone(),
                        task,
                        session_id: agent.session_id(),
                    };
                    let handle = tokio::spawn(worker.run(
                        socket.clone(),
                        agent.clone(),
                        args.alert_server,
                        device_source.clone(),
                        link_probe.clone(),
                    ));
                    workers.insert(task_id, handle);
                }
            }
        }
    }

    Ok(())
}
