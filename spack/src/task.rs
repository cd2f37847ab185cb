//! Task catalogue domain types and their SPACK packers/unpackers.

use crate::keymap::id;
use crate::value::{field_by_id, Key, SpackError, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub type Result<T> = std::result::Result<T, SpackError>;

/// A reusable interner for dynamic interface names, threaded through the
/// device-metrics packer by reference so repeated packs of the same device
/// don't re-allocate a fresh name list every call.
#[derive(Debug, Default, Clone)]
pub struct NameTable {
    names: Vec<String>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> usize {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            idx
        } else {
            self.names.push(name.to_string());
            self.names.len() - 1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceMetrics {
    pub cpu: bool,
    pub ram: bool,
    pub interface_stats: bool,
    pub volume: bool,
}

impl DeviceMetrics {
    fn bits(self) -> u8 {
        (self.cpu as u8) | ((self.ram as u8) << 1) | ((self.interface_stats as u8) << 2) | ((self.volume as u8) << 3)
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            cpu: bits & 0b0001 != 0,
            ram: bits & 0b0010 != 0,
            interface_stats: bits & 0b0100 != 0,
            volume: bits & 0b1000 != 0,
        }
    }

    fn pack(self) -> Option<Value> {
        let bits = self.bits();
        if bits == 0 {
            None
        } else {
            Some(Value::U8(bits))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    None,
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    None,
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    None,
    Address(Ipv4Addr),
    Device(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalOptions {
    pub mode: Mode,
    pub target: Target,
    pub duration_ms: Option<u32>,
    pub transport: TransportKind,
    pub interval_ms: Option<u32>,
    pub counter: Option<u32>,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            mode: Mode::None,
            target: Target::None,
            duration_ms: None,
            transport: TransportKind::None,
            interval_ms: None,
            counter: None,
        }
    }
}

fn mode_transport_byte(mode: Mode, transport: TransportKind) -> u8 {
    let mode_bits = match mode {
        Mode::None => 0b00,
        Mode::Client => 0b10,
        Mode::Server => 0b11,
    };
    let transport_bits = match transport {
        TransportKind::None => 0b00,
        TransportKind::Udp => 0b10,
        TransportKind::Tcp => 0b11,
    };
    mode_bits | (transport_bits << 2)
}

fn mode_from_bits(bits: u8) -> Result<Mode> {
    match bits & 0b11 {
        0b00 => Ok(Mode::None),
        0b10 => Ok(Mode::Client),
        0b11 => Ok(Mode::Server),
        _ => Err(SpackError::BadValueForKey("mode is not client/server")),
    }
}

fn transport_from_bits(bits: u8) -> Result<TransportKind> {
    match (bits >> 2) & 0b11 {
        0b00 => Ok(TransportKind::None),
        0b10 => Ok(TransportKind::Udp),
        0b11 => Ok(TransportKind::Tcp),
        _ => Err(SpackError::BadValueForKey("transport is not udp/tcp")),
    }
}

/// Parses `<d>d<h>h<m>m<s>s<ms>ms` into milliseconds. Every component is
/// optional; absent components contribute zero. Components must appear in
/// the order shown, each as a run of digits followed by its unit letters.
pub fn parse_duration_ms(text: &str) -> Result<u32> {
    let bytes = text.as_bytes();
    let mut total: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == digits_start {
            return Err(SpackError::BadValueForKey("duration component missing a number"));
        }
        let number: u64 = text[digits_start..i]
            .parse()
            .map_err(|_| SpackError::BadValueForKey("invalid duration component"))?;

        let unit_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let scale: u64 = match &text[unit_start..i] {
            "d" => 86_400_000,
            "h" => 3_600_000,
            "m" => 60_000,
            "s" => 1_000,
            "ms" => 1,
            _ => return Err(SpackError::BadValueForKey("unrecognised duration unit")),
        };
        total += number * scale;
    }
    u32::try_from(total).map_err(|_| SpackError::BadValueForKey("duration overflows u32 milliseconds"))
}

impl GlobalOptions {
    pub fn pack(&self) -> Value {
        let mut fields = vec![(
            Key::Id(id::MODE),
            Value::U8(mode_transport_byte(self.mode, self.transport)),
        )];
        match &self.target {
            Target::None => {}
            Target::Address(addr) => {
                fields.push((Key::Id(id::TARGET), Value::U32(u32::from(*addr))));
            }
            Target::Device(name) => {
                fields.push((
                    Key::Id(id::TARGET),
                    Value::Object(vec![(Key::Named(name.clone()), Value::U8(1))]),
                ));
            }
        }
        if let Some(ms) = self.duration_ms {
            fields.push((Key::Id(id::DURATION), Value::pack_int(ms)));
        }
        if let Some(ms) = self.interval_ms {
            fields.push((Key::Id(id::INTERVAL), Value::pack_int(ms)));
        }
        if let Some(counter) = self.counter {
            fields.push((Key::Id(id::COUNTER), Value::pack_int(counter)));
        }
        Value::Object(fields)
    }

    pub fn unpack(value: &Value) -> Result<Self> {
        let fields = value.as_object()?;
        let mode_transport = field_by_id(fields, id::MODE)
            .map(|v| v.as_u32())
            .transpose()?
            .unwrap_or(0) as u8;
        let mode = mode_from_bits(mode_transport)?;
        let transport = transport_from_bits(mode_transport)?;
        let target = match field_by_id(fields, id::TARGET) {
            None => Target::None,
            Some(Value::U32(raw)) => Target::Address(Ipv4Addr::from(*raw)),
            Some(Value::Object(obj)) => match obj.first() {
                Some((Key::Named(name), _)) => Target::Device(name.clone()),
                _ => return Err(SpackError::BadValueForKey("device target missing name")),
            },
            Some(_) => return Err(SpackError::BadValueForKey("target has unexpected type")),
        };
        let duration_ms = field_by_id(fields, id::DURATION).map(|v| v.as_u32()).transpose()?;
        let interval_ms = field_by_id(fields, id::INTERVAL).map(|v| v.as_u32()).transpose()?;
        let counter = field_by_id(fields, id::COUNTER).map(|v| v.as_u32()).transpose()?;
        Ok(Self {
            mode,
            target,
            duration_ms,
            transport,
            interval_ms,
            counter,
        })
    }
}

/// One link-metric sub-field: absent, inheriting every global option, or
/// carrying local overrides.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMetricSpec {
    Absent,
    InheritGlobal,
    Overrides(GlobalOptions),
}

impl LinkMetricSpec {
    fn pack(&self) -> Option<Value> {
        match self {
            LinkMetricSpec::Absent => None,
            LinkMetricSpec::InheritGlobal => Some(Value::U8(1)),
            LinkMetricSpec::Overrides(opts) => Some(opts.pack()),
        }
    }

    fn unpack(value: Option<&Value>) -> Result<Self> {
        match value {
            None => Ok(LinkMetricSpec::Absent),
            Some(Value::U8(1)) => Ok(LinkMetricSpec::InheritGlobal),
            Some(v @ Value::Object(_)) => Ok(LinkMetricSpec::Overrides(GlobalOptions::unpack(v)?)),
            Some(_) => Err(SpackError::BadValueForKey("link-metric spec has unexpected shape")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinkMetrics {
    pub bandwidth: LinkMetricSpec,
    pub jitter: LinkMetricSpec,
    pub packet_loss: LinkMetricSpec,
    pub latency: LinkMetricSpec,
}

impl Default for LinkMetricSpec {
    fn default() -> Self {
        LinkMetricSpec::Absent
    }
}

impl LinkMetrics {
    fn pack(&self) -> Option<Value> {
        let mut fields = Vec::new();
        for (key, spec) in [
            (id::BANDWIDTH, &self.bandwidth),
            (id::JITTER, &self.jitter),
            (id::PACKET_LOSS, &self.packet_loss),
            (id::LATENCY, &self.latency),
        ] {
            if let Some(value) = spec.pack() {
                fields.push((Key::Id(key), value));
            }
        }
        if fields.is_empty() {
            None
        } else {
            Some(Value::Object(fields))
        }
    }

    fn unpack(value: Option<&Value>) -> Result<Self> {
        let fields = match value {
            None => return Ok(Self::default()),
            Some(v) => v.as_object()?,
        };
        Ok(Self {
            bandwidth: LinkMetricSpec::unpack(field_by_id(fields, id::BANDWIDTH))?,
            jitter: LinkMetricSpec::unpack(field_by_id(fields, id::JITTER))?,
            packet_loss: LinkMetricSpec::unpack(field_by_id(fields, id::PACKET_LOSS))?,
            latency: LinkMetricSpec::unpack(field_by_id(fields, id::LATENCY))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AlertConditions {
    pub cpu_usage: Option<u8>,
    pub ram_usage: Option<u8>,
    pub packet_loss: Option<u8>,
    pub latency_ms: Option<u32>,
}

impl AlertConditions {
    fn pack(&self) -> Option<Value> {
        let mut fields = Vec::new();
        if self.cpu_usage.is_some() || self.ram_usage.is_some() {
            let packed = ((self.cpu_usage.unwrap_or(0) as u16) << 8) | self.ram_usage.unwrap_or(0) as u16;
            fields.push((Key::Id(id::ALERT_CONDITIONS), Value::U16(packed)));
        }
        if let Some(loss) = self.packet_loss {
            fields.push((Key::Id(id::PACKET_LOSS), Value::U8(loss)));
        }
        if let Some(latency) = self.latency_ms {
            fields.push((Key::Id(id::LATENCY), Value::pack_int(latency)));
        }
        if fields.is_empty() {
            None
        } else {
            Some(Value::Object(fields))
        }
    }

    fn unpack(value: Option<&Value>) -> Result<Self> {
        let fields = match value {
            None => return Ok(Self::default()),
            Some(v) => v.as_object()?,
        };
        let (cpu_usage, ram_usage) = match field_by_id(fields, id::ALERT_CONDITIONS) {
            Some(Value::U16(packed)) => (Some((*packed >> 8) as u8), Some((*packed & 0xFF) as u8)),
            Some(_) => return Err(SpackError::BadValueForKey("alert-conditions cpu/ram must be u16")),
            None => (None, None),
        };
        let packet_loss = field_by_id(fields, id::PACKET_LOSS).map(|v| v.as_u32()).transpose()?.map(|v| v as u8);
        let latency_ms = field_by_id(fields, id::LATENCY).map(|v| v.as_u32()).transpose()?;
        Ok(Self {
            cpu_usage,
            ram_usage,
            packet_loss,
            latency_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub frequency_ms: u32,
    pub device_metrics: DeviceMetrics,
    pub link_metrics: LinkMetrics,
    pub global_options: GlobalOptions,
    pub alert_conditions: AlertConditions,
}

impl Task {
    pub fn pack(&self) -> Value {
        let mut fields = vec![(Key::Id(id::FREQUENCY), Value::pack_int(self.frequency_ms))];
        if let Some(dm) = self.device_metrics.pack() {
            fields.push((Key::Id(id::DEVICE_METRICS), dm));
        }
        if let Some(lm) = self.link_metrics.pack() {
            fields.push((Key::Id(id::LINK_METRICS), lm));
        }
        fields.push((Key::Id(id::GLOBAL_OPTIONS), self.global_options.pack()));
        if let Some(ac) = self.alert_conditions.pack() {
            fields.push((Key::Id(id::ALERT_CONDITIONS), ac));
        }
        Value::Object(fields)
    }

    pub fn unpack(value: &Value) -> Result<Self> {
        let fields = value.as_object()?;
        let frequency_ms = field_by_id(fields, id::FREQUENCY)
            .ok_or(SpackError::BadValueForKey("task is missing frequency"))?
            .as_u32()?;
        let device_metrics = field_by_id(fields, id::DEVICE_METRICS)
            .map(|v| v.as_u32())
            .transpose()?
            .map(|bits| DeviceMetrics::from_bits(bits as u8))
            .unwrap_or_default();
        let link_metrics = LinkMetrics::unpack(field_by_id(fields, id::LINK_METRICS))?;
        let global_options = match field_by_id(fields, id::GLOBAL_OPTIONS) {
            Some(v) => GlobalOptions::unpack(v)?,
            None => GlobalOptions::default(),
        };
        let alert_conditions = AlertConditions::unpack(field_by_id(fields, id::ALERT_CONDITIONS))?;
        Ok(Self {
            frequency_ms,
            device_metrics,
            link_metrics,
            global_options,
            alert_conditions,
        })
    }

    /// A lazily-merged view: every link-metric spec is resolved against
    /// `global_options` right here so callers never see the raw
    /// absent/inherit/override distinction.
    pub fn view(&self) -> TaskView<'_> {
        TaskView { task: self }
    }
}

/// Read-only view over a [`Task`] that performs the link-metric /
/// global-options merge on access, per field, instead of eagerly
/// materialising every merged record up front.
pub struct TaskView<'a> {
    task: &'a Task,
}

impl<'a> TaskView<'a> {
    pub fn frequency_ms(&self) -> u32 {
        self.task.frequency_ms
    }

    pub fn device_metrics(&self) -> DeviceMetrics {
        self.task.device_metrics
    }

    /// Resolves one link-metric field: `Absent`/missing yields `None`;
    /// `InheritGlobal` yields a clone of the task's global options;
    /// `Overrides` yields the override record as-is (overrides are already
    /// complete records in this protocol, so no field-by-field merge is
    /// needed beyond substituting the whole record).
    fn resolve(&self, spec: &LinkMetricSpec) -> Option<GlobalOptions> {
        match spec {
            LinkMetricSpec::Absent => None,
            LinkMetricSpec::InheritGlobal => Some(self.task.global_options.clone()),
            LinkMetricSpec::Overrides(opts) => Some(opts.clone()),
        }
    }

    pub fn bandwidth(&self) -> Option<GlobalOptions> {
        self.resolve(&self.task.link_metrics.bandwidth)
    }

    pub fn jitter(&self) -> Option<GlobalOptions> {
        self.resolve(&self.task.link_metrics.jitter)
    }

    pub fn packet_loss(&self) -> Option<GlobalOptions> {
        self.resolve(&self.task.link_metrics.packet_loss)
    }

    pub fn latency(&self) -> Option<GlobalOptions> {
        self.resolve(&self.task.link_metrics.latency)
    }

    pub fn alert_conditions(&self) -> AlertConditions {
        self.task.alert_conditions
    }
}

/// Packs interface packets-per-second counters keyed by interface name,
/// interning each name into `names` as it is packed.
pub fn pack_interface_stats(stats: &BTreeMap<String, u32>, names: &mut NameTable) -> Value {
    let fields = stats
        .iter()
        .map(|(name, rate)| {
            names.intern(name);
            (Key::Named(name.clone()), Value::pack_int(*rate))
        })
        .collect();
    Value::Object(fields)
}

pub fn unpack_interface_stats(value: &Value) -> Result<BTreeMap<String, u32>> {
    let fields = value.as_object()?;
    let mut out = BTreeMap::new();
    for (key, value) in fields {
        match key {
            Key::Named(name) => {
                out.insert(name.clone(), value.as_u32()?);
            }
            Key::Id(_) => return Err(SpackError::MissingKeymap),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            frequency_ms: 5_000,
            device_metrics: DeviceMetrics {
                cpu: true,
                ram: false,
                interface_stats: true,
                volume: false,
            },
            link_metrics: LinkMetrics {
                bandwidth: LinkMetricSpec::InheritGlobal,
                jitter: LinkMetricSpec::Absent,
                packet_loss: LinkMetricSpec::Overrides(GlobalOptions {
                    mode: Mode::Client,
                    target: Target::Address(Ipv4Addr::new(10, 0, 0, 1)),
                    duration_ms: Some(60_000),
                    transport: TransportKind::Udp,
                    interval_ms: Some(1_000),
                    counter: Some(3),
                }),
                latency: LinkMetricSpec::Absent,
            },
            global_options: GlobalOptions {
                mode: Mode::Server,
                target: Target::Device("eth0".to_string()),
                duration_ms: Some(30_000),
                transport: TransportKind::Tcp,
                interval_ms: None,
                counter: None,
            },
            alert_conditions: AlertConditions {
                cpu_usage: Some(90),
                ram_usage: Some(80),
                packet_loss: Some(5),
                latency_ms: Some(200),
            },
        }
    }

    #[test]
    fn task_round_trips_through_spack_encode_decode() {
        let task = sample_task();
        let bytes = task.pack().encode().unwrap();
        let decoded_value = Value::decode(&bytes).unwrap();
        let decoded = Task::unpack(&decoded_value).unwrap();
        assert_eq!(task, decoded);
    }

    #[test]
    fn link_metrics_merge_with_global_options_on_view_access() {
        let task = sample_task();
        let view = task.view();
        let bandwidth = view.bandwidth().unwrap();
        assert_eq!(bandwidth, task.global_options);
        assert!(view.jitter().is_none());
        let packet_loss = view.packet_loss().unwrap();
        assert_eq!(packet_loss.mode, Mode::Client);
    }

    #[test]
    fn zero_device_metrics_bitfield_is_omitted_from_wire() {
        let mut task = sample_task();
        task.device_metrics = DeviceMetrics::default();
        let value = task.pack();
        let fields = value.as_object().unwrap();
        assert!(field_by_id(fields, id::DEVICE_METRICS).is_none());
    }

    #[test]
    fn duration_string_parses_every_component() {
        assert_eq!(parse_duration_ms("1d2h3m4s5ms").unwrap(), 93_784_005);
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
    }

    #[test]
    fn interface_stats_round_trip_with_dynamic_keys() {
        let mut names = NameTable::new();
        let mut stats = BTreeMap::new();
        stats.insert("eth0".to_string(), 1200u32);
        stats.insert("wlan0".to_string(), 45u32);
        let value = pack_interface_stats(&stats, &mut names);
        let decoded = unpack_interface_stats(&value).unwrap();
        assert_eq!(decoded, stats);
    }
}
