//! The `AlertFlow` record and its `"ATFW"`-framed wire format.
//!
//! Serialisation mirrors the NTP metric envelope: a fixed signature, then
//! length-prefixed fields, with the metric report itself SPACK-encoded in
//! the order given by the owning task's device-metric then link-metric
//! selections.

use ntp_buffer::{Reader, Writer};
use spack::MetricReport;
use thiserror::Error;

pub const SIGNATURE: &[u8; 4] = b"ATFW";
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("missing or mismatched ATFW signature")]
    BadSignature,
    #[error("unsupported AlertFlow version {0}")]
    BadVersion(u32),
    #[error("session-id is {0} bytes, expected 16")]
    BadSessionIdLength(usize),
    #[error("task-id is not valid utf-8")]
    InvalidUtf8,
    #[error(transparent)]
    Spack(#[from] spack::SpackError),
    #[error(transparent)]
    Buffer(#[from] ntp_buffer::BufferError),
}

pub type Result<T> = std::result::Result<T, RecordError>;

/// One threshold-violation alert, correlated to a device by session-id
/// rather than by source address.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertFlow {
    pub session_id: [u8; 16],
    pub task_id: String,
    pub report: MetricReport,
}

impl AlertFlow {
    pub fn encode(&self, device: &spack::DeviceMetrics, link: &spack::LinkMetrics, names: &mut spack::NameTable) -> Vec<u8> {
        let metric_value = self.report.pack(*device, link, names);
        let metric_blob = metric_value.encode().expect("packed metric report always encodes");

        let mut w = Writer::new();
        w.write_bytes(SIGNATURE);
        w.write_u32(PROTOCOL_VERSION);
        w.write_u32(self.session_id.len() as u32);
        w.write_bytes(&self.session_id);
        w.write_u32(self.task_id.len() as u32);
        w.write_bytes(self.task_id.as_bytes());
        w.write_u32(metric_blob.len() as u32);
        w.write_bytes(&metric_blob);
        w.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let signature = r.read(SIGNATURE.len())?;
        if signature != SIGNATURE.as_slice() {
            return Err(RecordError::BadSignature);
        }
        let version = r.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(RecordError::BadVersion(version));
        }

        let session_len = r.read_u32()? as usize;
        let session_bytes = r.read(session_len)?;
        if session_len != 16 {
            return Err(RecordError::BadSessionIdLength(session_len));
        }
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(session_bytes);

        let task_id_len = r.read_u32()? as usize;
        let task_id_bytes = r.read(task_id_len)?;
        let task_id = std::str::from_utf8(task_id_bytes)
            .map_err(|_| RecordError::InvalidUtf8)?
            .to_string();

        let blob_len = r.read_u32()? as usize;
        let metric_blob = r.read(blob_len)?;
        let value = spack::Value::decode(metric_blob)?;
        let report = MetricReport::unpack(&value)?;

        Ok(Self { session_id, task_id, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spack::{DeviceMetrics, LinkMetrics, NameTable};

    #[test]
    fn alert_flow_round_trips() {
        let device = DeviceMetrics { cpu: true, ram: false, interface_stats: false, volume: false };
        let link = LinkMetrics::default();
        let mut names = NameTable::new();

        let alert = AlertFlow {
            session_id: [7u8; 16],
            task_id: "ping-gateway".to_string(),
            report: MetricReport {
                cpu_usage: Some(90),
                ..Default::default()
            },
        };
        let bytes = alert.encode(&device, &link, &mut names);
        assert_eq!(&bytes[0..4], SIGNATURE);
        let decoded = AlertFlow::decode(&bytes).unwrap();
        assert_eq!(decoded, alert);
    }

    #[test]
    fn rejects_bad_signature() {
        let bytes = vec![b'X', b'X', b'X', b'X', 0, 0, 0, 1];
        assert_eq!(AlertFlow::decode(&bytes), Err(RecordError::BadSignature));
    }
}
