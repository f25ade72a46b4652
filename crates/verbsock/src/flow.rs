//! Flush-based flow control.
//!
//! The receive ring has a fixed size and payload lands in it asynchronously, so
//! a sender must not run arbitrarily far ahead of its peer. The receiver sends a
//! zero-payload FLUSH back every `K` completed DATA messages. The sender may
//! have at most `K` DATA messages of at most `M` bytes outstanding; sending the
//! `K`th sets the awaiting-acknowledgment latch and nothing more is sent until
//! a FLUSH clears it. With `K * M <= capacity` the peer never holds more than
//! one ring's worth of unacknowledged payload.
//!
//! # Backpressure States
//!
//! - **Open**: no unacknowledged messages
//! - **Throttled**: some credit consumed, more available
//! - **Blocked**: latch set, waiting for a FLUSH

use serde::{Deserialize, Serialize};

/// Sender-side view of the flow-control window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControlState {
    /// Nothing outstanding.
    Open,
    /// Some messages outstanding, credit remains.
    Throttled,
    /// Waiting for an acknowledgment.
    Blocked,
}

/// Per-channel flow-control bookkeeping for both directions.
#[derive(Debug, Clone)]
pub struct FlowControl {
    interval: u32,
    max_message_size: usize,
    unacked: u32,
    awaiting_ack: bool,
    received_since_flush: u32,
}

impl FlowControl {
    /// `interval` is `K`, `max_message_size` is `M`. Both are clamped to at
    /// least 1; callers validate `K * M` against the ring capacity.
    pub fn new(interval: u32, max_message_size: usize) -> Self {
        Self {
            interval: interval.max(1),
            max_message_size: max_message_size.max(1),
            unacked: 0,
            awaiting_ack: false,
            received_since_flush: 0,
        }
    }

    /// Flush interval `K`.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Largest DATA message `M`.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// DATA messages that may be sent before the next FLUSH is required.
    pub fn send_credits(&self) -> u32 {
        if self.awaiting_ack {
            0
        } else {
            self.interval - self.unacked
        }
    }

    /// Accounts for one DATA message handed to the transport. Returns true if
    /// this message exhausted the window and set the latch.
    pub fn record_send(&mut self) -> bool {
        self.unacked = (self.unacked + 1).min(self.interval);
        if self.unacked == self.interval && !self.awaiting_ack {
            self.awaiting_ack = true;
            return true;
        }
        false
    }

    /// Handles an incoming FLUSH. Returns true if the latch was set.
    pub fn on_flush(&mut self) -> bool {
        let was_awaiting = self.awaiting_ack;
        self.awaiting_ack = false;
        self.unacked = self.unacked.saturating_sub(self.interval);
        was_awaiting
    }

    /// Accounts for one completed inbound DATA message. Returns true when a
    /// FLUSH is due.
    pub fn record_receive(&mut self) -> bool {
        self.received_since_flush += 1;
        if self.received_since_flush >= self.interval {
            self.received_since_flush = 0;
            return true;
        }
        false
    }

    /// Whether the sender waits for a FLUSH.
    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// DATA messages sent since the last FLUSH.
    pub fn unacked(&self) -> u32 {
        self.unacked
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlowControlState {
        if self.awaiting_ack {
            FlowControlState::Blocked
        } else if self.unacked > 0 {
            FlowControlState::Throttled
        } else {
            FlowControlState::Open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingBuffer;
    use proptest::prelude::*;

    #[test]
    fn test_new_clamps_zero() {
        let fc = FlowControl::new(0, 0);
        assert_eq!(fc.interval(), 1);
        assert_eq!(fc.max_message_size(), 1);
    }

    #[test]
    fn test_latch_set_on_kth_send() {
        let mut fc = FlowControl::new(3, 16);
        assert_eq!(fc.state(), FlowControlState::Open);
        assert!(!fc.record_send());
        assert!(!fc.record_send());
        assert_eq!(fc.state(), FlowControlState::Throttled);
        assert_eq!(fc.send_credits(), 1);
        assert!(fc.record_send());
        assert!(fc.is_awaiting_ack());
        assert_eq!(fc.send_credits(), 0);
        assert_eq!(fc.state(), FlowControlState::Blocked);
    }

    #[test]
    fn test_flush_clears_latch() {
        let mut fc = FlowControl::new(2, 16);
        fc.record_send();
        fc.record_send();
        assert!(fc.on_flush());
        assert!(!fc.is_awaiting_ack());
        assert_eq!(fc.send_credits(), 2);
        assert_eq!(fc.unacked(), 0);
        assert!(!fc.on_flush());
    }

    #[test]
    fn test_receiver_flushes_every_kth() {
        let mut fc = FlowControl::new(4, 16);
        let due: Vec<bool> = (0..8).map(|_| fc.record_receive()).collect();
        assert_eq!(due, vec![false, false, false, true, false, false, false, true]);
    }

    #[test]
    fn test_interval_one_acks_every_message() {
        let mut fc = FlowControl::new(1, 8);
        assert!(fc.record_send());
        assert!(fc.record_receive());
        assert!(fc.on_flush());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Send(usize),
        Deliver,
        Read(usize),
    }

    fn any_step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1usize..64).prop_map(Step::Send),
            Just(Step::Deliver),
            (0usize..96).prop_map(Step::Read),
        ]
    }

    proptest! {
        /// Models a sender and receiver sharing one connection: messages queue
        /// in flight, the receiver completes one only when `M` bytes are free,
        /// and FLUSHes flow back after every `K` completions. The receive ring
        /// must never be asked to hold more than its capacity.
        #[test]
        fn test_no_receive_overrun(k in 1u32..8, m in 1usize..16, steps in proptest::collection::vec(any_step(), 0..300)) {
            let capacity = k as usize * m;
            let mut sender = FlowControl::new(k, m);
            let mut receiver = FlowControl::new(k, m);
            let mut ring = RingBuffer::new(capacity).unwrap();
            let mut in_flight: std::collections::VecDeque<usize> = Default::default();
            let mut flushes = 0u32;

            for step in steps {
                match step {
                    Step::Send(len) => {
                        if sender.send_credits() > 0 {
                            in_flight.push_back(len.min(m));
                            sender.record_send();
                        }
                    }
                    Step::Deliver => {
                        if ring.free() >= m {
                            if let Some(len) = in_flight.pop_front() {
                                let n = ring.write(&vec![0u8; len]);
                                prop_assert_eq!(n, len);
                                if receiver.record_receive() {
                                    flushes += 1;
                                }
                            }
                        }
                        if flushes > 0 {
                            flushes -= 1;
                            sender.on_flush();
                        }
                    }
                    Step::Read(len) => {
                        let mut dst = vec![0u8; len];
                        ring.read_into(&mut dst);
                    }
                }
                prop_assert!(ring.occupied() <= capacity);
                prop_assert!(in_flight.len() <= k as usize);
            }
        }
    }
}
