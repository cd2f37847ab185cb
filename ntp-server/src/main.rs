mod alert_sink;
mod catalogue;

use alert_sink::LoggingAlertSink;
use catalogue::DemoCatalogue;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Runs the NTP coordinator: the UDP protocol endpoint plus the alert
/// side-channel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the UDP protocol endpoint binds to.
    #[arg(long, env = "NTP_LISTEN_ADDR", default_value = "0.0.0.0:9990")]
    listen: SocketAddr,

    /// Address the alert-channel TCP listener binds to.
    #[arg(long, env = "NTP_ALERT_LISTEN_ADDR", default_value = "0.0.0.0:9991")]
    alert_listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let catalogue = Arc::new(DemoCatalogue::new());
    let sink = Arc::new(LoggingAlertSink);
    let (metrics_tx, mut metrics_rx) = tokio::sync::mpsc::channel(64);

    let udp = tokio::spawn({
        let listen = args.listen;
        async move {
            info!(%listen, "starting UDP protocol endpoint");
            if let Err(e) = ntp_transport::run_server(listen, catalogue, metrics_tx).await {
                error!(error = %e, "UDP endpoint exited");
            }
        }
    });

    let alert = tokio::spawn({
        let alert_listen = args.alert_listen;
        async move {
            info!(%alert_listen, "starting alert channel");
            if let Err(e) = ntp_alert::run_alert_server(alert_listen, sink).await {
                error!(error = %e, "alert channel exited");
            }
        }
    });

    let metrics_drain = tokio::spawn(async move {
        while let Some((session_id, task_id, report)) = metrics_rx.recv().await {
            info!(
                session_id = %hex(&session_id),
                task = %task_id,
                cpu_usage = ?report.cpu_usage,
                ram_usage = ?report.ram_usage,
                "received metrics"
            );
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        _ = udp => {},
        _ = alert => {},
        _ = metrics_drain => {},
    }

    Ok(())
}

fn hex(bytes: &[u8; 16]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
