//! Persists an `AlertFlow`. The real persistent store is out of scope here;
//! this stand-in just logs, with `alert = true` in the structured fields to
//! match how a real sink would tag the row.

use ntp_alert::{AlertFlow, AlertSink};
use tracing::warn;

pub struct LoggingAlertSink;

#[async_trait::async_trait]
impl AlertSink for LoggingAlertSink {
    async fn record_alert(&self, alert: AlertFlow) {
        warn!(
            alert = true,
            session_id = %hex(&alert.session_id),
            task = %alert.task_id,
            cpu_usage = ?alert.report.cpu_usage,
            ram_usage = ?alert.report.ram_usage,
            packet_loss_pct = ?alert.report.packet_loss_pct,
            latency_ms = ?alert.report.latency_ms,
            "threshold violation"
        );
    }
}

fn hex(bytes: &[u8; 16]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
