//! The per-task monitoring loop (external collaborator per the protocol
//! core: it drives outbound traffic but the probe executors and system
//! metric readers it samples are not part of the protocol itself).
//!
//! Each tick: sample the task's selected device/link metrics, compare
//! against its alert thresholds, emit an `AlertFlow` for every crossed
//! threshold, substitute that field's sentinel in the same tick's batch
//! `SEND_METRICS`, and send it.

use ntp_transport::AgentEndpoint;
use spack::{DeviceMetrics, MetricReport, NameTable, Task};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::warn;

/// Instantaneous device-level samples. The CPU/RAM readers and the
/// per-interface packet-rate counter are external collaborators; this
/// trait is the seam the worker calls through.
#[async_trait::async_trait]
pub trait DeviceMetricSource: Send + Sync {
    async fn cpu_usage_pct(&self) -> u8;
    async fn ram_usage_pct(&self) -> u8;
    async fn interface_pps(&self) -> BTreeMap<String, u32>;
    async fn volume(&self) -> u32;
}

/// One link probe's result for a tick. `None` fields were not requested by
/// the task (or the probe could not produce them this tick).
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkSample {
    pub bandwidth_bps: Option<u32>,
    pub jitter_ms: Option<i16>,
    pub packet_loss_pct: Option<i8>,
    pub latency_ms: Option<i16>,
}

/// Runs the throughput probe and ICMP echo for one task. External
/// collaborator; a real implementation drives actual network I/O.
#[async_trait::async_trait]
pub trait LinkProbe: Send + Sync {
    async fn probe(&self, task: &Task) -> LinkSample;
}

/// A synthetic stand-in for both trait seams above. The real probe
/// executors and system-metric readers are out of scope for the protocol
/// core; this keeps the worker runnable end to end with plausible numbers
/// instead of leaving it unimplementable.
pub struct SyntheticMetricSource {
    cpu_tick: std::sync::atomic::AtomicU8,
}

impl SyntheticMetricSource {
    pub fn new() -> Self {
        Self {
            cpu_tick: std::sync::atomic::AtomicU8::new(10),
        }
    }
}

impl Default for SyntheticMetricSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DeviceMetricSource for SyntheticMetricSource {
    async fn cpu_usage_pct(&self) -> u8 {
        use std::sync::atomic::Ordering;
        let next = (self.cpu_tick.load(Ordering::Relaxed) + 7) % 100;
        self.cpu_tick.store(next, Ordering::Relaxed);
        next
    }

    async fn ram_usage_pct(&self) -> u8 {
        use rand::Rng;
        rand::thread_rng().gen_range(20..70)
    }

    async fn interface_pps(&self) -> BTreeMap<String, u32> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        BTreeMap::from([("eth0".to_string(), rng.gen_range(0..2_000))])
    }

    async fn volume(&self) -> u32 {
        0
    }
}

#[async_trait::async_trait]
impl LinkProbe for SyntheticMetricSource {
    async fn probe(&self, task: &Task) -> LinkSample {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let view = task.view();
        LinkSample {
            bandwidth_bps: view.bandwidth().map(|_| rng.gen_range(1_000_000..10_000_000)),
            jitter_ms: view.jitter().map(|_| rng.gen_range(0..20)),
            packet_loss_pct: view.packet_loss().map(|_| rng.gen_range(0..3)),
            latency_ms: view.latency().map(|_| rng.gen_range(1..40)),
        }
    }
}

/// One running monitoring task: ticks at `task.frequency_ms`, samples,
/// checks thresholds, and pushes `SEND_METRICS` (plus any `AlertFlow`s)
/// through `socket`/`alert_addr` until cancelled.
pub struct TaskWorker {
    pub task_id: String,
    pub task: Task,
    pub session_id: [u8; 16],
}

impl TaskWorker {
    pub async fn run(
        self,
        socket: Arc<UdpSocket>,
        agent: Arc<AgentEndpoint>,
        alert_addr: SocketAddr,
        device_source: Arc<dyn DeviceMetricSource>,
        link_probe: Arc<dyn LinkProbe>,
    ) {
        let view = self.task.view();
        let frequency = std::time::Duration::from_millis(view.frequency_ms().max(1) as u64);
        let mut interval = tokio::time::interval(frequency);
        let mut names = NameTable::new();

        loop {
            interval.tick().await;
            let mut report = self.sample(device_source.as_ref(), link_probe.as_ref()).await;
            self.apply_alerts(&mut report, &mut names, alert_addr).await;

            let device = self.task.device_metrics;
            let blob = match report.pack(device, &self.task.link_metrics, &mut names).encode() {
                Ok(b) => b,
                Err(e) => {
                    warn!(task = %self.task_id, error = %e, "failed to encode metric report");
                    continue;
                }
            };
            ntp_transport::send_agent_metrics(&socket, &agent, &self.task_id, blob).await;
        }
    }

    async fn sample(&self, device_source: &dyn DeviceMetricSource, link_probe: &dyn LinkProbe) -> MetricReport {
        let device: DeviceMetrics = self.task.device_metrics;
        let mut report = MetricReport::default();
        if device.cpu {
            report.cpu_usage = Some(device_source.cpu_usage_pct().await);
        }
        if device.ram {
            report.ram_usage = Some(device_source.ram_usage_pct().await);
        }
        if device.interface_stats {
            report.interface_stats = Some(device_source.interface_pps().await);
        }
        if device.volume {
            report.volume = Some(device_source.volume().await);
        }

        let link = &self.task.link_metrics;
        if link.bandwidth.is_some() || link.jitter.is_some() || link.packet_loss.is_some() || link.latency.is_some() {
            let sample = link_probe.probe(&self.task).await;
            report.bandwidth_bps = sample.bandwidth_bps;
            report.jitter_ms = sample.jitter_ms;
            report.packet_loss_pct = sample.packet_loss_pct;
            report.latency_ms = sample.latency_ms;
        }
        report
    }

    /// Emits an `AlertFlow` for every field that crossed its threshold this
    /// tick, then clears that field on `report` so the batch `SEND_METRICS`
    /// reports its ignore sentinel instead of the value already alerted on.
    async fn apply_alerts(&self, report: &mut MetricReport, names: &mut NameTable, alert_addr: SocketAddr) {
        let conditions = self.task.alert_conditions;

        if let (Some(value), Some(threshold)) = (report.cpu_usage, conditions.cpu_usage) {
            if value >= threshold {
                let device = DeviceMetrics { cpu: true, ..DeviceMetrics::default() };
                let alert_report = MetricReport { cpu_usage: Some(value), ..Default::default() };
                self.send_alert(names, alert_addr, device, spack::LinkMetrics::default(), alert_report).await;
                report.cpu_usage = None;
            }
        }
        if let (Some(value), Some(threshold)) = (report.ram_usage, conditions.ram_usage) {
            if value >= threshold {
                let device = DeviceMetrics { ram: true, ..DeviceMetrics::default() };
                let alert_report = MetricReport { ram_usage: Some(value), ..Default::default() };
                self.send_alert(names, alert_addr, device, spack::LinkMetrics::default(), alert_report).await;
                report.ram_usage = None;
            }
        }
        if let (Some(value), Some(threshold)) = (report.packet_loss_pct, conditions.packet_loss) {
            if value >= threshold as i8 {
                let link = spack::LinkMetrics {
                    packet_loss: spack::LinkMetricSpec::InheritGlobal,
                    ..spack::LinkMetrics::default()
                };
                let alert_report = MetricReport { packet_loss_pct: Some(value), ..Default::default() };
                self.send_alert(names, alert_addr, DeviceMetrics::default(), link, alert_report).await;
                report.packet_loss_pct = None;
            }
        }
        if let (Some(value), Some(threshold)) = (report.latency_ms, conditions.latency_ms) {
            if value >= threshold as i16 {
                let link = spack::LinkMetrics {
                    latency: spack::LinkMetricSpec::InheritGlobal,
                    ..spack::LinkMetrics::default()
                };
                let alert_report = MetricReport { latency_ms: Some(value), ..Default::default() };
                self.send_alert(names, alert_addr, DeviceMetrics::default(), link, alert_report).await;
                report.latency_ms = None;
            }
        }
    }

    async fn send_alert(
        &self,
        names: &mut NameTable,
        alert_addr: SocketAddr,
        device: DeviceMetrics,
        link: spack::LinkMetrics,
        report: MetricReport,
    ) {
        let record = ntp_alert::AlertFlow {
            session_id: self.session_id,
            task_id: self.task_id.clone(),
            report,
        };
        if let Err(e) = ntp_alert::send_alert(alert_addr, &record, &device, &link, names).await {
            warn!(task = %self.task_id, error = %e, "failed to deliver alert");
        }
    }
}
