use std::time::Duration;

use tokio::time::Instant;

use crate::core::event::CanonicalEvent;

/// One buffered element of a group. Leg-matching groups label each element
/// with its leg kind; fragment groups leave the label empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub label: Option<String>,
    pub event: CanonicalEvent,
}

/// Fragments sharing one correlation key, awaiting completion or eviction.
#[derive(Debug, Clone)]
pub struct CorrelationGroup {
    key: String,
    created: Instant,
    deadline: Instant,
    seq: u64,
    fragments: Vec<Fragment>,
}

impl CorrelationGroup {
    pub(crate) fn new(key: &str, created: Instant, ttl: Duration, seq: u64) -> Self {
        Self {
            key: key.to_string(),
            created,
            deadline: created + ttl,
            seq,
            fragments: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Creation time plus TTL. Later fragments do not move it.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn index_key(&self) -> (Instant, u64) {
        (self.deadline, self.seq)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Appends an unlabeled fragment.
    pub fn push(&mut self, event: CanonicalEvent) {
        self.fragments.push(Fragment { label: None, event });
    }

    /// Stores a leg, replacing a previous leg of the same kind in place.
    /// Returns the replaced event.
    pub fn upsert_leg(&mut self, kind: &str, event: CanonicalEvent) -> Option<CanonicalEvent> {
        match self
            .fragments
            .iter_mut()
            .find(|f| f.label.as_deref() == Some(kind))
        {
            Some(existing) => Some(std::mem::replace(&mut existing.event, event)),
            None => {
                self.fragments.push(Fragment {
                    label: Some(kind.to_string()),
                    event,
                });
                None
            }
        }
    }

    pub fn leg(&self, kind: &str) -> Option<&CanonicalEvent> {
        self.fragments
            .iter()
            .find(|f| f.label.as_deref() == Some(kind))
            .map(|f| &f.event)
    }

    pub fn has_legs(&self, legs: &[String]) -> bool {
        legs.iter().all(|kind| self.leg(kind).is_some())
    }
}
