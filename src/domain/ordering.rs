//! Stable event ordering for deterministic processing.

use crate::domain::DecodedEvent;
use serde::{Deserialize, Serialize};

/// Position of an event in chain order.
///
/// Ordering: block_number -> log_index. Log indices are unique within a
/// block, so two distinct events never share a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    /// Block number (primary sort).
    pub block_number: u64,
    /// Log index within the block (secondary sort).
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        EventPosition {
            block_number,
            log_index,
        }
    }

    /// Returns true if event_a should be applied before event_b.
    pub fn should_come_before(event_a: &DecodedEvent, event_b: &DecodedEvent) -> bool {
        event_a.position() < event_b.position()
    }
}

impl std::fmt::Display for EventPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// Sort events deterministically by (block_number, log_index).
pub fn sort_events_deterministic(events: &mut [DecodedEvent]) {
    events.sort_by_key(|event| event.position());
}

/// First position that appears more than once in an already sorted slice.
pub fn find_duplicate_position(events: &[DecodedEvent]) -> Option<EventPosition> {
    events
        .windows(2)
        .find(|pair| pair[0].position() == pair[1].position())
        .map(|pair| pair[0].position())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, DomainEvent, B256};

    fn make_event(block_number: u64, log_index: u64) -> DecodedEvent {
        DecodedEvent {
            emitter: Address::ZERO,
            block_number,
            log_index,
            tx_hash: B256::ZERO,
            event: DomainEvent::UserEModeSet {
                user: Address::ZERO,
                category_id: 0,
            },
        }
    }

    #[test]
    fn test_event_ordering_by_block() {
        let a = make_event(10, 5);
        let b = make_event(11, 0);
        assert!(EventPosition::should_come_before(&a, &b));
        assert!(!EventPosition::should_come_before(&b, &a));
    }

    #[test]
    fn test_event_ordering_same_block_by_log_index() {
        let a = make_event(10, 1);
        let b = make_event(10, 2);
        assert!(EventPosition::should_come_before(&a, &b));
    }

    #[test]
    fn test_sort_events_deterministic() {
        let mut events = vec![make_event(12, 0), make_event(10, 3), make_event(10, 1)];
        sort_events_deterministic(&mut events);
        let positions: Vec<_> = events.iter().map(|e| e.position()).collect();
        assert_eq!(
            positions,
            vec![
                EventPosition::new(10, 1),
                EventPosition::new(10, 3),
                EventPosition::new(12, 0)
            ]
        );
    }

    #[test]
    fn test_find_duplicate_position() {
        let events = vec![make_event(10, 1), make_event(10, 1), make_event(11, 0)];
        assert_eq!(
            find_duplicate_position(&events),
            Some(EventPosition::new(10, 1))
        );
        assert_eq!(find_duplicate_position(&events[1..]), None);
    }
}
