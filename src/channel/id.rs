//! Opaque channel handles and per-channel message id allocation.

use crate::packet::{MqttError, MqttResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter so a channel keeps its id when it moves between
/// reactors. Zero is reserved for the reactor's waker token.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle naming one channel. Collaborators never touch the channel
/// itself, only this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the id.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(&self) -> mio::Token {
        mio::Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: mio::Token) -> Self {
        Self(token.0 as u64)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Hands out message ids 1..=65535 in send order, wrapping, and skipping any
/// id the caller reports as still in use.
#[derive(Debug, Clone)]
pub struct MessageIdAllocator {
    next: u16,
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl MessageIdAllocator {
    /// Create an allocator starting at id 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next free id.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::MessageIdsExhausted`] when all 65535 ids are in use.
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> MqttResult<u16> {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = if id == u16::MAX { 1 } else { id + 1 };
            if !in_use(id) {
                return Ok(id);
            }
        }
        Err(MqttError::MessageIdsExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_channel_ids_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert_ne!(a.as_u64(), 0);
        assert_eq!(ChannelId::from_token(a.token()), a);
    }

    #[test]
    fn test_allocate_wraps() {
        let mut ids = MessageIdAllocator::new();
        let mut last = 0;
        for _ in 0..65_535 {
            last = ids.allocate(|_| false).unwrap();
        }
        assert_eq!(last, 65_535);
        assert_eq!(ids.allocate(|_| false).unwrap(), 1);
    }

    #[test]
    fn test_allocate_skips_in_use() {
        let mut ids = MessageIdAllocator::new();
        let busy: HashSet<u16> = [1, 2, 4].into_iter().collect();
        assert_eq!(ids.allocate(|id| busy.contains(&id)).unwrap(), 3);
        assert_eq!(ids.allocate(|id| busy.contains(&id)).unwrap(), 5);
    }

    #[test]
    fn test_allocate_exhausted() {
        let mut ids = MessageIdAllocator::new();
        assert!(matches!(
            ids.allocate(|_| true),
            Err(MqttError::MessageIdsExhausted)
        ));
    }

    #[test]
    fn test_no_duplicates_while_outstanding() {
        // 65536 allocations with every id held until acknowledged: the last
        // one finds nothing free, then an acknowledgment frees exactly one id.
        let mut ids = MessageIdAllocator::new();
        let mut outstanding = HashSet::new();
        for _ in 0..65_535 {
            let id = ids.allocate(|id| outstanding.contains(&id)).unwrap();
            assert!(outstanding.insert(id));
        }
        assert!(ids.allocate(|id| outstanding.contains(&id)).is_err());

        outstanding.remove(&777);
        assert_eq!(ids.allocate(|id| outstanding.contains(&id)).unwrap(), 777);
    }
}
