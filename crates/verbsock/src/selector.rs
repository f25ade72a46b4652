//! Readiness flags and a minimal selector.
//!
//! Channels expose readiness through [`Selectable`]; evaluating it also drives
//! the transport's progress function, which is the only place asynchronous
//! completions run. The [`Selector`] here is a small polling loop over
//! registered channels, enough for tests and the demo binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;

/// Readiness bitmask, using the conventional selection-key bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReadyOps(u8);

impl ReadyOps {
    /// Unread bytes are buffered.
    pub const READ: Self = Self(1);
    /// The channel accepts writes.
    pub const WRITE: Self = Self(4);
    /// A connect is outstanding or ready to finish.
    pub const CONNECT: Self = Self(8);
    /// A connection request is waiting.
    pub const ACCEPT: Self = Self(16);

    /// No readiness bits.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Raw bitmask.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Whether any bit of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

impl std::ops::BitOr for ReadyOps {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ReadyOps {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for ReadyOps {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Something whose readiness can be polled.
pub trait Selectable: Send + Sync {
    /// Drives the transport once, then reports current readiness.
    fn ready_ops(&self) -> ReadyOps;

    /// Drives the transport once. Returns whether any completion ran.
    fn select(&self) -> Result<bool>;
}

/// Token identifying a registration.
pub type Token = usize;

struct Registration {
    channel: Arc<dyn Selectable>,
    interest: ReadyOps,
}

/// Polls a set of registered channels.
#[derive(Default)]
pub struct Selector {
    registrations: BTreeMap<Token, Registration>,
}

impl Selector {
    /// Creates a selector with no registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` under `token`, replacing an earlier registration.
    pub fn register(&mut self, token: Token, channel: Arc<dyn Selectable>, interest: ReadyOps) {
        self.registrations
            .insert(token, Registration { channel, interest });
    }

    /// Changes the interest set of an existing registration.
    pub fn set_interest(&mut self, token: Token, interest: ReadyOps) -> bool {
        match self.registrations.get_mut(&token) {
            Some(registration) => {
                registration.interest = interest;
                true
            }
            None => false,
        }
    }

    /// Removes a registration. Returns whether it existed.
    pub fn cancel(&mut self, token: Token) -> bool {
        self.registrations.remove(&token).is_some()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Returns every registration whose readiness intersects its interest,
    /// without blocking.
    pub fn select_now(&self) -> Vec<(Token, ReadyOps)> {
        self.registrations
            .iter()
            .filter_map(|(token, registration)| {
                let ready = registration.channel.ready_ops() & registration.interest;
                (!ready.is_empty()).then_some((*token, ready))
            })
            .collect()
    }

    /// Polls until at least one registration is ready or `max_rounds` polls
    /// found nothing.
    pub fn select(&self, max_rounds: usize) -> Vec<(Token, ReadyOps)> {
        for _ in 0..max_rounds.max(1) {
            let ready = self.select_now();
            if !ready.is_empty() {
                return ready;
            }
            std::thread::yield_now();
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

    struct Fixed {
        ops: AtomicU8,
        polls: AtomicUsize,
    }

    impl Fixed {
        fn new(ops: ReadyOps) -> Arc<Self> {
            Arc::new(Self {
                ops: AtomicU8::new(ops.bits()),
                polls: AtomicUsize::new(0),
            })
        }
    }

    impl Selectable for Fixed {
        fn ready_ops(&self) -> ReadyOps {
            self.polls.fetch_add(1, Ordering::Relaxed);
            ReadyOps(self.ops.load(Ordering::Relaxed))
        }

        fn select(&self) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_ready_ops_bits() {
        let ops = ReadyOps::READ | ReadyOps::WRITE;
        assert!(ops.contains(ReadyOps::READ));
        assert!(!ops.contains(ReadyOps::CONNECT));
        assert!(ops.intersects(ReadyOps::WRITE | ReadyOps::ACCEPT));
        assert_eq!(ops.bits(), 5);
        assert!(ReadyOps::empty().is_empty());
    }

    #[test]
    fn test_bitor_assign() {
        let mut ops = ReadyOps::empty();
        ops |= ReadyOps::CONNECT;
        assert_eq!(ops, ReadyOps::CONNECT);
    }

    #[test]
    fn test_select_filters_by_interest() {
        let mut selector = Selector::new();
        selector.register(1, Fixed::new(ReadyOps::WRITE), ReadyOps::READ);
        selector.register(2, Fixed::new(ReadyOps::READ | ReadyOps::WRITE), ReadyOps::READ);
        assert_eq!(selector.select_now(), vec![(2, ReadyOps::READ)]);

        assert!(selector.set_interest(1, ReadyOps::WRITE));
        assert_eq!(selector.select_now().len(), 2);
    }

    #[test]
    fn test_cancel() {
        let mut selector = Selector::new();
        selector.register(7, Fixed::new(ReadyOps::READ), ReadyOps::READ);
        assert_eq!(selector.len(), 1);
        assert!(selector.cancel(7));
        assert!(!selector.cancel(7));
        assert!(selector.is_empty());
        assert!(!selector.set_interest(7, ReadyOps::READ));
    }

    #[test]
    fn test_select_gives_up_after_rounds() {
        let idle = Fixed::new(ReadyOps::empty());
        let mut selector = Selector::new();
        selector.register(0, idle.clone(), ReadyOps::READ);
        assert!(selector.select(3).is_empty());
        assert_eq!(idle.polls.load(Ordering::Relaxed), 3);
    }
}
