//! Fragment completion.
//!
//! Fragments share a content-derived key (hash of the key fields). They are
//! appended as they arrive; the fragment carrying a false `*partial` marker
//! closes the group, which is then ordered by the configured time field and
//! merged first-wins.

use chrono_tz::Tz;

use crate::configs::FragmentPolicy;
use crate::core::event::{CanonicalEvent, OPT_PARTIAL};
use crate::utils::{correlation_key, parse_timestamp};

use super::cache::{CacheUpdate, GroupAction, PartialCache};
use super::group::Fragment;

#[derive(Debug, Clone)]
pub struct FragmentMerger {
    policy: FragmentPolicy,
    timezone: Tz,
}

impl FragmentMerger {
    pub fn new(policy: FragmentPolicy, timezone: Tz) -> Self {
        Self { policy, timezone }
    }

    /// Hash of the key fields. The first key field is required; the others
    /// count as empty when missing.
    pub fn key(&self, event: &CanonicalEvent) -> Option<String> {
        let (first, rest) = self.policy.key_fields.split_first()?;
        let head = event.field_str(first).filter(|v| !v.is_empty())?;
        let mut parts = vec![head];
        parts.extend(rest.iter().map(|f| event.field_str(f).unwrap_or_default()));
        Some(correlation_key(&parts))
    }

    /// Appends a fragment; returns the merged event when it was the final one.
    /// `None` when the event has no usable key.
    pub fn offer(
        &self,
        cache: &PartialCache,
        event: CanonicalEvent,
    ) -> Option<CacheUpdate<Option<CanonicalEvent>>> {
        let key = self.key(&event)?;
        let is_final = event.partial_marker() == Some(false);
        Some(cache.update(&key, |group| {
            group.push(event);
            if is_final {
                (self.merge(group.fragments()), GroupAction::Remove)
            } else {
                (None, GroupAction::Keep)
            }
        }))
    }

    /// Stable sort by the order field (the fallback field for elements that
    /// lack it), then a first-wins merge. Tenant, id and time come from the
    /// first element after sorting; the fragment marker is dropped.
    pub fn merge(&self, fragments: &[Fragment]) -> Option<CanonicalEvent> {
        let mut events: Vec<&CanonicalEvent> = fragments.iter().map(|f| &f.event).collect();
        events.sort_by_cached_key(|ev| {
            ev.fields
                .get(&self.policy.order_field)
                .and_then(|v| parse_timestamp(v, self.timezone))
                .or_else(|| {
                    ev.fields
                        .get(&self.policy.order_fallback_field)
                        .and_then(|v| parse_timestamp(v, self.timezone))
                })
        });

        let (first, rest) = events.split_first()?;
        let mut merged = (*first).clone();
        for ev in rest {
            for (name, value) in &ev.fields {
                merged.fields.entry(name.clone()).or_insert_with(|| value.clone());
            }
            for (name, value) in &ev.opts {
                merged.opts.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        merged.opts.remove(OPT_PARTIAL);
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn fragment(answer: &str, usage: i64, partial: bool) -> CanonicalEvent {
        CanonicalEvent::new("cgrates.org", format!("frag-{answer}"))
            .with_field("OriginID", "orig-1")
            .with_field("OriginHost", "host-a")
            .with_field("AnswerTime", answer)
            .with_field("Usage", usage)
            .with_opt(OPT_PARTIAL, partial)
    }

    #[test]
    fn merges_in_time_order_on_final_fragment() {
        let merger = FragmentMerger::new(FragmentPolicy::default(), Tz::UTC);
        let cache = PartialCache::new(Duration::from_secs(5));
        let t1 = "2024-03-01T10:00:10Z";
        let t2 = "2024-03-01T10:00:05Z";
        let t3 = "2024-03-01T10:00:20Z";

        let a = merger.offer(&cache, fragment(t1, 10, true)).expect("keyed");
        assert!(a.result.is_none());
        let b = merger.offer(&cache, fragment(t3, 30, true)).expect("keyed");
        assert!(b.result.is_none());
        assert_eq!(cache.len(), 1);

        let merged = merger
            .offer(&cache, fragment(t2, 20, false).with_field("Final", "yes"))
            .expect("keyed")
            .result
            .expect("final fragment completes the group");
        assert!(cache.is_empty());
        assert_eq!(merged.id, format!("frag-{t2}"));
        assert_eq!(merged.fields.get("Usage"), Some(&json!(20)));
        assert_eq!(merged.fields.get("Final"), Some(&json!("yes")));
        assert!(!merged.opts.contains_key(OPT_PARTIAL));
    }

    #[test]
    fn falls_back_to_setup_time() {
        let merger = FragmentMerger::new(FragmentPolicy::default(), Tz::UTC);
        let late = CanonicalEvent::new("t", "late")
            .with_field("AnswerTime", "2024-03-01T10:00:30Z")
            .with_field("Usage", 1);
        let early = CanonicalEvent::new("t", "early")
            .with_field("SetupTime", "2024-03-01T10:00:00Z")
            .with_field("Usage", 2);
        let frags = vec![
            Fragment { label: None, event: late },
            Fragment { label: None, event: early },
        ];
        let merged = merger.merge(&frags).expect("merged");
        assert_eq!(merged.id, "early");
        assert_eq!(merged.fields.get("Usage"), Some(&json!(2)));
    }

    #[test]
    fn keyless_fragments_are_ignored() {
        let merger = FragmentMerger::new(FragmentPolicy::default(), Tz::UTC);
        let cache = PartialCache::new(Duration::from_secs(5));
        let ev = CanonicalEvent::new("t", "1").with_opt(OPT_PARTIAL, true);
        assert!(merger.offer(&cache, ev).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn a_lone_final_fragment_forwards_alone() {
        let merger = FragmentMerger::new(FragmentPolicy::default(), Tz::UTC);
        let cache = PartialCache::new(Duration::from_secs(5));
        let merged = merger
            .offer(&cache, fragment("2024-03-01T10:00:00Z", 5, false))
            .expect("keyed")
            .result
            .expect("forwarded");
        assert_eq!(merged.fields.get("Usage"), Some(&json!(5)));
        assert!(cache.is_empty());
    }
}
