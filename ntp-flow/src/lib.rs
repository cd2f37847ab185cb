//! Sliding-window flow control for one NTP session: admission, recovery
//! buffer, duplicate filter and retransmission-attempt tracking.
//!
//! This crate holds only the state machine; actually scheduling a timer's
//! firing is the owning event loop's job (see `ntp-transport`), so
//! everything here is synchronous and free of any async runtime.

use ntp_proto::DatagramType;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

pub const DEFAULT_WINDOW: usize = 3;
pub const MAX_RECOVERY: usize = 20;
pub const MAX_DUP_FILTER: usize = 5;
pub const DEFAULT_RETRANSMISSION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_RETRANSMISSIONS: u8 = 3;
pub const MAX_CONTIGUOUS_ERRORS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum FlowError {
    #[error("armed-timer window is full")]
    WindowFull,
    #[error("nothing queued to send")]
    NothingToSend,
    #[error("sequence {0} has exceeded the maximum retransmission attempts")]
    MaxRetransmissions(u32),
    #[error("duplicate sequence {0}")]
    Duplicate(u32),
    #[error("no recovery entry for sequence {0}")]
    NotInRecovery(u32),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// What `evaluate` decided about an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Accepted and, unless the datagram bypassed sequencing entirely,
    /// flow-control bookkeeping has been updated.
    Accepted,
    /// Caller must reply with a BODYLESS NACK asking for the carried
    /// sequence number.
    RequestRetransmission(u32),
}

/// The minimal fields `evaluate` needs from an inbound private header; kept
/// separate from `ntp_proto::PrivateHeader` so this crate doesn't need to
/// know the full datagram shape.
#[derive(Debug, Clone, Copy)]
pub struct InboundMeta {
    pub dtype: DatagramType,
    pub seq: u32,
    pub ack: u32,
}

/// Per-session sliding-window state. Generic over `T`, the serialized
/// datagram bytes stored for possible retransmission.
pub struct FlowControl<T> {
    window: usize,
    max_retransmissions: u8,
    last_seq: u32,
    last_ack: u32,
    recovery: VecDeque<(u32, T)>,
    dup_filter: VecDeque<u32>,
    pending_send: VecDeque<T>,
    /// sequence -> retransmission attempts armed so far
    timers: HashMap<u32, u8>,
}

impl<T: Clone> FlowControl<T> {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW, DEFAULT_MAX_RETRANSMISSIONS)
    }

    pub fn with_window(window: usize, max_retransmissions: u8) -> Self {
        Self {
            window,
            max_retransmissions,
            last_seq: 1,
            last_ack: 0,
            recovery: VecDeque::new(),
            dup_filter: VecDeque::new(),
            pending_send: VecDeque::new(),
            timers: HashMap::new(),
        }
    }

    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Sequence numbers with a retransmission timer currently armed, for an
    /// event loop to poll for expiry-driven resends.
    pub fn armed_sequences(&self) -> Vec<u32> {
        self.timers.keys().copied().collect()
    }

    /// Queues `dg` (if given), then pops the head of `pending_send` for
    /// transmission, provided the armed-timer window has room.
    pub fn controlled_send(&mut self, dg: Option<T>) -> Result<T> {
        if let Some(dg) = dg {
            self.pending_send.push_back(dg);
        }
        if self.timers.len() >= self.window {
            return Err(FlowError::WindowFull);
        }
        self.pending_send.pop_front().ok_or(FlowError::NothingToSend)
    }

    /// Records a just-transmitted datagram into the recovery buffer at the
    /// current `last_seq`, then advances `last_seq`. Returns the sequence
    /// number the datagram was sent under.
    pub fn ready_to_send(&mut self, dg: T) -> u32 {
        let seq = self.last_seq;
        self.recovery.push_back((seq, dg));
        if self.recovery.len() > MAX_RECOVERY {
            self.recovery.pop_front();
        }
        self.last_seq += 1;
        seq
    }

    /// Arms a retransmission timer for `seq`, bumping its attempt counter.
    /// Replaces any existing timer for the same sequence.
    pub fn start_timer(&mut self, seq: u32) -> Result<()> {
        let attempts = self.timers.entry(seq).or_insert(0);
        *attempts += 1;
        if *attempts > self.max_retransmissions {
            self.timers.remove(&seq);
            return Err(FlowError::MaxRetransmissions(seq));
        }
        Ok(())
    }

    pub fn cancel_timer(&mut self, seq: u32) {
        self.timers.remove(&seq);
    }

    /// Looks up the stored datagram bytes for a NACK'd sequence, for
    /// retransmission. Per §4.4, a miss is logged and dropped by the
    /// caller, not treated as a protocol error.
    pub fn recovery_entry(&self, seq: u32) -> Result<&T> {
        self.recovery
            .iter()
            .find(|(s, _)| *s == seq)
            .map(|(_, dg)| dg)
            .ok_or(FlowError::NotInRecovery(seq))
    }

    /// Evaluates an inbound datagram against the current window state.
    pub fn evaluate(&mut self, meta: InboundMeta) -> Result<Evaluation> {
        if matches!(meta.dtype, DatagramType::ConnectionRejected | DatagramType::Wake) {
            return Ok(Evaluation::Accepted);
        }
        if matches!(meta.dtype, DatagramType::Register) {
            self.reset(1);
            return Ok(Evaluation::Accepted);
        }
        if self.dup_filter.contains(&meta.seq) {
            return Err(FlowError::Duplicate(meta.seq));
        }
        if meta.seq > self.last_ack + 1 {
            return Ok(Evaluation::RequestRetransmission(self.last_ack + 1));
        }
        self.cancel_timer(meta.ack);
        self.recovery.retain(|(s, _)| *s != meta.ack);
        self.last_ack = meta.seq;
        self.dup_filter.push_back(meta.seq);
        if self.dup_filter.len() > MAX_DUP_FILTER {
            self.dup_filter.pop_front();
        }
        Ok(Evaluation::Accepted)
    }

    /// Clears all session-local state and restarts sequencing at `new_seq`.
    pub fn reset(&mut self, new_seq: u32) {
        self.recovery.clear();
        self.dup_filter.clear();
        self.pending_send.clear();
        self.timers.clear();
        self.last_seq = new_seq;
        self.last_ack = new_seq.saturating_sub(1);
    }
}

impl<T: Clone> Default for FlowControl<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks consecutive receive-side errors across a session; crossing
/// [`MAX_CONTIGUOUS_ERRORS`] forces a `CONNECTION_RESET` per §4.6.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContiguousErrors(u32);

impl ContiguousErrors {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn record_error(&mut self) -> bool {
        self.0 += 1;
        self.0 > MAX_CONTIGUOUS_ERRORS
    }

    pub fn record_success(&mut self) {
        self.0 = 0;
    }

    pub fn count(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(dtype: DatagramType, seq: u32, ack: u32) -> InboundMeta {
        InboundMeta { dtype, seq, ack }
    }

    #[test]
    fn send_path_admits_up_to_window_then_blocks() {
        let mut flow: FlowControl<Vec<u8>> = FlowControl::with_window(2, 3);
        let a = flow.controlled_send(Some(vec![1])).unwrap();
        flow.ready_to_send(a);
        flow.start_timer(1).unwrap();
        let b = flow.controlled_send(Some(vec![2])).unwrap();
        flow.ready_to_send(b);
        flow.start_timer(2).unwrap();

        assert_eq!(flow.controlled_send(Some(vec![3])), Err(FlowError::WindowFull));
    }

    #[test]
    fn empty_pending_queue_reports_nothing_to_send() {
        let mut flow: FlowControl<Vec<u8>> = FlowControl::new();
        assert_eq!(flow.controlled_send(None), Err(FlowError::NothingToSend));
    }

    #[test]
    fn recovery_buffer_drops_oldest_past_capacity() {
        let mut flow: FlowControl<u32> = FlowControl::new();
        for i in 0..(MAX_RECOVERY as u32 + 5) {
            flow.ready_to_send(i);
        }
        assert!(flow.recovery_entry(0).is_err());
        assert!(flow.recovery_entry(MAX_RECOVERY as u32 + 4).is_ok());
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let mut flow: FlowControl<()> = FlowControl::new();
        flow.evaluate(meta(DatagramType::Bodyless, 1, 0)).unwrap();
        assert_eq!(
            flow.evaluate(meta(DatagramType::Bodyless, 1, 0)),
            Err(FlowError::Duplicate(1))
        );
    }

    #[test]
    fn out_of_order_sequence_asks_for_retransmission() {
        let mut flow: FlowControl<()> = FlowControl::new();
        let result = flow.evaluate(meta(DatagramType::Bodyless, 5, 0)).unwrap();
        assert_eq!(result, Evaluation::RequestRetransmission(1));
    }

    #[test]
    fn register_resets_sequencing() {
        let mut flow: FlowControl<()> = FlowControl::new();
        flow.evaluate(meta(DatagramType::Bodyless, 1, 0)).unwrap();
        flow.evaluate(meta(DatagramType::Register, 1, 0)).unwrap();
        assert_eq!(flow.last_seq(), 1);
        assert_eq!(flow.last_ack(), 0);
    }

    #[test]
    fn max_retransmissions_is_enforced() {
        let mut flow: FlowControl<()> = FlowControl::new();
        flow.start_timer(1).unwrap();
        flow.start_timer(1).unwrap();
        flow.start_timer(1).unwrap();
        assert_eq!(flow.start_timer(1), Err(FlowError::MaxRetransmissions(1)));
    }

    #[test]
    fn contiguous_errors_forces_reset_past_threshold() {
        let mut errors = ContiguousErrors::new();
        for _ in 0..MAX_CONTIGUOUS_ERRORS {
            assert!(!errors.record_error());
        }
        assert!(errors.record_error());
        errors.record_success();
        assert_eq!(errors.count(), 0);
    }

    proptest::proptest! {
        #[test]
        fn in_order_sequences_are_always_accepted_and_advance_last_ack(count in 1u32..50) {
            let mut flow: FlowControl<()> = FlowControl::new();
            for seq in 1..=count {
                let result = flow.evaluate(meta(DatagramType::Bodyless, seq, 0)).unwrap();
                proptest::prop_assert_eq!(result, Evaluation::Accepted);
                proptest::prop_assert_eq!(flow.last_ack(), seq);
            }
        }

        #[test]
        fn resetting_always_clears_the_dup_filter(seq in 1u32..50, new_seq in 1u32..50) {
            let mut flow: FlowControl<()> = FlowControl::new();
            let _ = flow.evaluate(meta(DatagramType::Bodyless, seq, 0));
            flow.reset(new_seq);
            proptest::prop_assert_eq!(flow.last_seq(), new_seq);
            proptest::prop_assert_eq!(flow.armed_timers(), 0);
        }
    }
}
