//! The alert side-channel: a reliable-stream transport carrying
//! `AlertFlow` records, SPACK-encoded the same way as a UDP metric report.

pub mod record;
pub mod transport;

pub use record::{AlertFlow, RecordError, PROTOCOL_VERSION, SIGNATURE};
pub use transport::{AlertTransport, TcpAlertTransport, TransportError};

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, warn};

/// Persists an `AlertFlow`, correlated to a device by session-id rather
/// than source address, with `alert = true`. External collaborator (the
/// persistent store is out of scope for this crate).
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn record_alert(&self, alert: AlertFlow);
}

/// Accepts alert-channel connections on `addr` and feeds every decoded
/// record to `sink`. One task per connection; a connection that errors out
/// (bad frame, closed socket) is dropped without affecting the others.
pub async fn run_alert_server(addr: SocketAddr, sink: std::sync::Arc<dyn AlertSink>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, peer) = listener.accept().await?;
        let sink = sink.clone();
        tokio::spawn(async move {
            let mut transport = TcpAlertTransport::new(stream);
            loop {
                match transport.recv().await {
                    Ok(alert) => sink.record_alert(alert).await,
                    Err(e) => {
                        warn!(error = %e, %peer, "alert channel connection closed");
                        break;
                    }
                }
            }
        });
    }
}

/// Sends a single `AlertFlow` on a fresh connection to `addr`. The
/// monitoring worker calls this once per crossed threshold; a longer-lived
/// connection is an available optimisation, not a requirement.
pub async fn send_alert(
    addr: SocketAddr,
    record: &AlertFlow,
    device: &spack::DeviceMetrics,
    link: &spack::LinkMetrics,
    names: &mut spack::NameTable,
) -> transport::Result<()> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let mut transport = TcpAlertTransport::new(stream);
    transport.send(record, device, link, names).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use spack::{DeviceMetrics, LinkMetrics, MetricReport, NameTable};
    use std::sync::{Arc, Mutex};

    struct CollectingSink(Mutex<Vec<AlertFlow>>);

    #[async_trait::async_trait]
    impl AlertSink for CollectingSink {
        async fn record_alert(&self, alert: AlertFlow) {
            self.0.lock().unwrap().push(alert);
        }
    }

    #[tokio::test]
    async fn a_sent_alert_reaches_the_server_sink() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let sink_for_server = sink.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let sink = sink_for_server.clone();
                tokio::spawn(async move {
                    let mut transport = TcpAlertTransport::new(stream);
                    if let Ok(alert) = transport.recv().await {
                        sink.record_alert(alert).await;
                    }
                });
            }
        });

        let record = AlertFlow {
            session_id: [4u8; 16],
            task_id: "ping-gateway".to_string(),
            report: MetricReport { cpu_usage: Some(91), ..Default::default() },
        };
        let device = DeviceMetrics { cpu: true, ram: false, interface_stats: false, volume: false };
        let link = LinkMetrics::default();
        let mut names = NameTable::new();
        send_alert(addr, &record, &device, &link, &mut names).await.unwrap();

        for _ in 0..50 {
            if !sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(sink.0.lock().unwrap().as_slice(), &[record]);
    }
}
