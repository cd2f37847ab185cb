//! Metric report packing: the shape of a `SEND_METRICS` body, driven by a
//! task's device/link-metric selections.

use crate::keymap::{id, SENTINEL_S16, SENTINEL_S8};
use crate::task::{unpack_interface_stats, DeviceMetrics, LinkMetricSpec, LinkMetrics, NameTable};
use crate::value::{field_by_id, Key, SpackError, Value};
use std::collections::BTreeMap;

pub type Result<T> = std::result::Result<T, SpackError>;

/// One sampled metric report, shaped by the owning task's device/link
/// selections. A metric present in the task's selection but not sampled
/// this tick is carried as `Some(None-ish sentinel)`, recovered as `None`
/// here by [`MetricReport::unpack`] — callers never see the raw sentinel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricReport {
    pub cpu_usage: Option<u8>,
    pub ram_usage: Option<u8>,
    pub interface_stats: Option<BTreeMap<String, u32>>,
    pub volume: Option<u32>,
    pub bandwidth_bps: Option<u32>,
    pub jitter_ms: Option<i16>,
    pub packet_loss_pct: Option<i8>,
    pub latency_ms: Option<i16>,
}

impl MetricReport {
    /// Packs only the fields selected by `device` / `link`; a field omitted
    /// at the task level is never written, even if present on `self`. A
    /// field selected but `None` on `self` is written as its sentinel.
    pub fn pack(&self, device: DeviceMetrics, link: &LinkMetrics, names: &mut NameTable) -> Value {
        let mut fields = Vec::new();
        if device.cpu {
            let v = self.cpu_usage.map(|v| v as i8).unwrap_or(SENTINEL_S8);
            fields.push((Key::Id(id::CPU_USAGE), Value::S8(v)));
        }
        if device.ram {
            let v = self.ram_usage.map(|v| v as i8).unwrap_or(SENTINEL_S8);
            fields.push((Key::Id(id::RAM_USAGE), Value::S8(v)));
        }
        if device.interface_stats {
            let stats = self.interface_stats.clone().unwrap_or_default();
            fields.push((
                Key::Id(id::INTERFACE_STATS),
                crate::task::pack_interface_stats(&stats, names),
            ));
        }
        if device.volume {
            fields.push((Key::Id(id::VOLUME), Value::pack_int(self.volume.unwrap_or(0))));
        }
        if link.bandwidth != LinkMetricSpec::Absent {
            fields.push((Key::Id(id::BANDWIDTH), Value::pack_int(self.bandwidth_bps.unwrap_or(0))));
        }
        if link.jitter != LinkMetricSpec::Absent {
            let v = self.jitter_ms.unwrap_or(SENTINEL_S16);
            fields.push((Key::Id(id::JITTER), Value::S16(v)));
        }
        if link.packet_loss != LinkMetricSpec::Absent {
            let v = self.packet_loss_pct.unwrap_or(SENTINEL_S8);
            fields.push((Key::Id(id::PACKET_LOSS), Value::S8(v)));
        }
        if link.latency != LinkMetricSpec::Absent {
            let v = self.latency_ms.unwrap_or(SENTINEL_S16);
            fields.push((Key::Id(id::LATENCY), Value::S16(v)));
        }
        Value::Object(fields)
    }

    pub fn unpack(value: &Value) -> Result<Self> {
        let fields = value.as_object()?;
        let cpu_usage = field_by_id(fields, id::CPU_USAGE)
            .map(|v| v.as_i32())
            .transpose()?
            .map(|v| v as i8)
            .filter(|v| *v != SENTINEL_S8)
            .map(|v| v as u8);
        let ram_usage = field_by_id(fields, id::RAM_USAGE)
            .map(|v| v.as_i32())
            .transpose()?
            .map(|v| v as i8)
            .filter(|v| *v != SENTINEL_S8)
            .map(|v| v as u8);
        let interface_stats = field_by_id(fields, id::INTERFACE_STATS)
            .map(unpack_interface_stats)
            .transpose()?;
        let volume = field_by_id(fields, id::VOLUME).map(|v| v.as_u32()).transpose()?;
        let bandwidth_bps = field_by_id(fields, id::BANDWIDTH).map(|v| v.as_u32()).transpose()?;
        let jitter_ms = field_by_id(fields, id::JITTER)
            .map(|v| v.as_i32())
            .transpose()?
            .map(|v| v as i16)
            .filter(|v| *v != SENTINEL_S16);
        let packet_loss_pct = field_by_id(fields, id::PACKET_LOSS)
            .map(|v| v.as_i32())
            .transpose()?
            .map(|v| v as i8)
            .filter(|v| *v != SENTINEL_S8);
        let latency_ms = field_by_id(fields, id::LATENCY)
            .map(|v| v.as_i32())
            .transpose()?
            .map(|v| v as i16)
            .filter(|v| *v != SENTINEL_S16);
        Ok(Self {
            cpu_usage,
            ram_usage,
            interface_stats,
            volume,
            bandwidth_bps,
            jitter_ms,
            packet_loss_pct,
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{LinkMetricSpec, NameTable};

    #[test]
    fn report_round_trips_for_the_fields_the_task_selects() {
        let device = DeviceMetrics {
            cpu: true,
            ram: false,
            interface_stats: false,
            volume: false,
        };
        let link = LinkMetrics {
            bandwidth: LinkMetricSpec::InheritGlobal,
            jitter: LinkMetricSpec::Absent,
            packet_loss: LinkMetricSpec::InheritGlobal,
            latency: LinkMetricSpec::Absent,
        };
        let report = MetricReport {
            cpu_usage: Some(42),
            bandwidth_bps: Some(1_000_000),
            packet_loss_pct: Some(3),
            ..Default::default()
        };
        let mut names = NameTable::new();
        let value = report.pack(device, &link, &mut names);
        let decoded = MetricReport::unpack(&value).unwrap();
        assert_eq!(decoded.cpu_usage, Some(42));
        assert_eq!(decoded.ram_usage, None);
        assert_eq!(decoded.bandwidth_bps, Some(1_000_000));
        assert_eq!(decoded.packet_loss_pct, Some(3));
        assert_eq!(decoded.jitter_ms, None);
    }

    #[test]
    fn selected_but_unsampled_field_round_trips_through_its_sentinel() {
        let device = DeviceMetrics::default();
        let link = LinkMetrics {
            bandwidth: LinkMetricSpec::Absent,
            jitter: LinkMetricSpec::InheritGlobal,
            packet_loss: LinkMetricSpec::InheritGlobal,
            latency: LinkMetricSpec::Absent,
        };
        let report = MetricReport::default();
        let mut names = NameTable::new();
        let value = report.pack(device, &link, &mut names);
        let fields = value.as_object().unwrap();
        assert_eq!(field_by_id(fields, id::JITTER), Some(&Value::S16(SENTINEL_S16)));
        assert_eq!(field_by_id(fields, id::PACKET_LOSS), Some(&Value::S8(SENTINEL_S8)));

        let decoded = MetricReport::unpack(&value).unwrap();
        assert_eq!(decoded.jitter_ms, None);
        assert_eq!(decoded.packet_loss_pct, None);
    }

    #[test]
    fn cpu_usage_selected_but_unsampled_round_trips_through_its_sentinel() {
        let device = DeviceMetrics { cpu: true, ..DeviceMetrics::default() };
        let link = LinkMetrics::default();
        let report = MetricReport::default();
        let mut names = NameTable::new();
        let value = report.pack(device, &link, &mut names);
        let fields = value.as_object().unwrap();
        assert_eq!(field_by_id(fields, id::CPU_USAGE), Some(&Value::S8(SENTINEL_S8)));
        let decoded = MetricReport::unpack(&value).unwrap();
        assert_eq!(decoded.cpu_usage, None);
    }
}
