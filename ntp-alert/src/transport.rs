//! Reliable-stream transport for `AlertFlow` records.
//!
//! Kept behind a narrow trait so the protocol core doesn't hard-depend on
//! TCP; a `tokio::net::TcpStream` backs it in production, an in-memory
//! duplex backs tests.

use crate::record::AlertFlow;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Record(#[from] crate::record::RecordError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One side of the alert channel: frames and writes an `AlertFlow`, or
/// reads and decodes the next one.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send(&mut self, record: &AlertFlow, device: &spack::DeviceMetrics, link: &spack::LinkMetrics, names: &mut spack::NameTable) -> Result<()>;
    async fn recv(&mut self) -> Result<AlertFlow>;
}

/// Reads a length-prefixed frame (u32 length, then that many bytes) from
/// `stream`, then decodes it as an `AlertFlow`. Framing the record with its
/// own length lets the reader resynchronise after a short read without
/// rescanning for the `"ATFW"` signature mid-stream.
pub async fn read_record<R: tokio::io::AsyncRead + Unpin + Send>(stream: &mut R) -> Result<AlertFlow> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(AlertFlow::decode(&buf)?)
}

pub async fn write_record<W: tokio::io::AsyncWrite + Unpin + Send>(
    stream: &mut W,
    record: &AlertFlow,
    device: &spack::DeviceMetrics,
    link: &spack::LinkMetrics,
    names: &mut spack::NameTable,
) -> Result<()> {
    let bytes = record.encode(device, link, names);
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// A `TcpStream`-backed [`AlertTransport`].
pub struct TcpAlertTransport {
    stream: tokio::net::TcpStream,
}

impl TcpAlertTransport {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl AlertTransport for TcpAlertTransport {
    async fn send(&mut self, record: &AlertFlow, device: &spack::DeviceMetrics, link: &spack::LinkMetrics, names: &mut spack::NameTable) -> Result<()> {
        write_record(&mut self.stream, record, device, link, names).await
    }

    async fn recv(&mut self) -> Result<AlertFlow> {
        read_record(&mut self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spack::{DeviceMetrics, LinkMetrics, MetricReport, NameTable};
    use tokio::io::duplex;

    #[tokio::test]
    async fn record_round_trips_over_a_duplex_stream() {
        let (mut client, mut server) = duplex(4096);
        let device = DeviceMetrics { cpu: true, ram: false, interface_stats: false, volume: false };
        let link = LinkMetrics::default();
        let mut names = NameTable::new();

        let record = AlertFlow {
            session_id: [9u8; 16],
            task_id: "ping-gateway".to_string(),
            report: MetricReport { cpu_usage: Some(95), ..Default::default() },
        };

        write_record(&mut client, &record, &device, &link, &mut names).await.unwrap();
        let decoded = read_record(&mut server).await.unwrap();
        assert_eq!(decoded, record);
    }
}
