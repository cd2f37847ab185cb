//! The task catalogue handed to a freshly-registered agent. Per-device task
//! assignment is configuration/store-sourced (out of scope here); this is a
//! synthetic stand-in that hands every agent the same fixed task set.

use ntp_transport::TaskCatalogue;
use spack::{AlertConditions, DeviceMetrics, GlobalOptions, LinkMetricSpec, LinkMetrics, Mode, Target, Task, TransportKind};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub struct DemoCatalogue {
    tasks: BTreeMap<String, Task>,
}

impl DemoCatalogue {
    pub fn new() -> Self {
        let mut tasks = BTreeMap::new();
        tasks.insert(
            "ping-gateway".to_string(),
            Task {
                frequency_ms: 5_000,
                device_metrics: DeviceMetrics { cpu: true, ram: true, ..DeviceMetrics::default() },
                link_metrics: LinkMetrics {
                    latency: LinkMetricSpec::Overrides(GlobalOptions {
                        mode: Mode::Client,
                        target: Target::Address(Ipv4Addr::new(10, 0, 0, 1)),
                        transport: TransportKind::Udp,
                        duration_ms: None,
                        interval_ms: Some(1_000),
                        counter: None,
                    }),
                    ..LinkMetrics::default()
                },
                global_options: GlobalOptions::default(),
                alert_conditions: AlertConditions {
                    cpu_usage: Some(80),
                    ram_usage: Some(90),
                    latency_ms: Some(200),
                    ..AlertConditions::default()
                },
            },
        );
        Self { tasks }
    }
}

impl Default for DemoCatalogue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCatalogue for DemoCatalogue {
    fn task_collection(&self, _session_id: &[u8; 16]) -> BTreeMap<String, Task> {
        self.tasks.clone()
    }
}
