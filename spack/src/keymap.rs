//! The static key-map: the fixed vocabulary of field names shared by every
//! task record and metric report, and their dictionary identifiers.

/// Dictionary identifiers for the fixed field vocabulary. Assignment is
/// arbitrary but fixed for the lifetime of the wire format: both ends of a
/// session compile against the same table.
pub mod id {
    pub const FREQUENCY: u8 = 0;
    pub const DEVICE_METRICS: u8 = 1;
    pub const GLOBAL_OPTIONS: u8 = 2;
    pub const MODE: u8 = 3;
    pub const TARGET: u8 = 4;
    pub const DURATION: u8 = 5;
    pub const TRANSPORT: u8 = 6;
    pub const INTERVAL: u8 = 7;
    pub const COUNTER: u8 = 8;
    pub const LINK_METRICS: u8 = 9;
    pub const BANDWIDTH: u8 = 10;
    pub const JITTER: u8 = 11;
    pub const PACKET_LOSS: u8 = 12;
    pub const LATENCY: u8 = 13;
    pub const ALERT_CONDITIONS: u8 = 14;
    pub const CPU_USAGE: u8 = 15;
    pub const RAM_USAGE: u8 = 16;
    pub const INTERFACE_STATS: u8 = 17;
    pub const VOLUME: u8 = 18;
}

/// Sentinel meaning "field present but value intentionally omitted" in an
/// `s8`-packed metric field. The wire byte is `128`; as a signed `i8` that
/// reads back as `i8::MIN`.
pub const SENTINEL_S8: i8 = i8::MIN;

/// Sentinel meaning "field present but value intentionally omitted" in an
/// `s16`-packed metric field.
pub const SENTINEL_S16: i16 = i16::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_pairwise_distinct() {
        let ids = [
            id::FREQUENCY,
            id::DEVICE_METRICS,
            id::GLOBAL_OPTIONS,
            id::MODE,
            id::TARGET,
            id::DURATION,
            id::TRANSPORT,
            id::INTERVAL,
            id::COUNTER,
            id::LINK_METRICS,
            id::BANDWIDTH,
            id::JITTER,
            id::PACKET_LOSS,
            id::LATENCY,
            id::ALERT_CONDITIONS,
            id::CPU_USAGE,
            id::RAM_USAGE,
            id::INTERFACE_STATS,
            id::VOLUME,
        ];
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
        assert!(ids.iter().all(|id| *id != crate::value::NAMED_KEY));
    }
}
