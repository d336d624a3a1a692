//! Leg-matching completion.
//!
//! One group per session key. Each leg is stored under its kind; a repeated
//! kind replaces the stored leg. Once every required kind is present the
//! group is merged into one export record and removed. Legs classified as
//! failed calls skip the cache entirely.

use crate::configs::LegMatchingPolicy;
use crate::core::event::{CanonicalEvent, OPT_PARTIAL};
use crate::errors::ProcessError;

use super::cache::{CacheUpdate, GroupAction, PartialCache};
use super::group::Fragment;

#[derive(Debug, Clone)]
pub struct LegMatcher {
    policy: LegMatchingPolicy,
    legs: Vec<String>,
}

impl LegMatcher {
    pub fn new(policy: LegMatchingPolicy) -> Self {
        let legs = policy.legs.legs();
        Self { policy, legs }
    }

    /// Required leg kinds in merge order.
    pub fn legs(&self) -> &[String] {
        &self.legs
    }

    /// Session key: the key fields joined with `:`. `None` if one is missing.
    pub fn key(&self, event: &CanonicalEvent) -> Option<String> {
        let parts: Option<Vec<String>> = self
            .policy
            .key_fields
            .iter()
            .map(|f| event.field_str(f).filter(|v| !v.is_empty()))
            .collect();
        parts.map(|p| p.join(":"))
    }

    pub fn is_failed_call(&self, event: &CanonicalEvent) -> bool {
        self.policy.failed_call.as_ref().is_some_and(|rule| {
            event
                .path_str(&rule.path)
                .is_some_and(|value| value.starts_with(&rule.prefix))
        })
    }

    pub fn leg_kind(&self, event: &CanonicalEvent) -> Option<String> {
        event.field_str(&self.policy.leg_field)
    }

    /// Buffers one leg. Returns the merged record when the group completes.
    pub fn offer(
        &self,
        cache: &PartialCache,
        reader_id: &str,
        event: CanonicalEvent,
    ) -> Result<CacheUpdate<Option<CanonicalEvent>>, ProcessError> {
        let key = self.key(&event).ok_or_else(|| {
            ProcessError::Correlation(format!(
                "missing session key fields {:?}",
                self.policy.key_fields
            ))
        })?;
        let kind = self.leg_kind(&event).unwrap_or_default();
        if !self.legs.contains(&kind) {
            return Err(ProcessError::UnsupportedLeg { kind, key });
        }

        Ok(cache.update(&key, |group| {
            if group.upsert_leg(&kind, event).is_some() {
                tracing::warn!(
                    reader = reader_id,
                    key = %key,
                    "Overwriting the {kind} leg for record <{key}>"
                );
            }
            if group.has_legs(&self.legs) {
                (self.merge(group.fragments()), GroupAction::Remove)
            } else {
                (None, GroupAction::Keep)
            }
        }))
    }

    /// Combines the stored legs in configured leg order. Fields are a
    /// first-wins union; every leg's fields are also kept as `<LEG>.<field>`.
    /// Tenant, id, time and options come from the first present leg.
    pub fn merge(&self, fragments: &[Fragment]) -> Option<CanonicalEvent> {
        let ordered: Vec<(&str, &CanonicalEvent)> = self
            .legs
            .iter()
            .filter_map(|kind| {
                fragments
                    .iter()
                    .find(|f| f.label.as_deref() == Some(kind.as_str()))
                    .map(|f| (kind.as_str(), &f.event))
            })
            .collect();
        let (_, first) = ordered.first()?;

        let mut merged = CanonicalEvent {
            fields: Default::default(),
            opts: Default::default(),
            ..(*first).clone()
        };
        for (kind, leg) in &ordered {
            for (name, value) in &leg.fields {
                merged.fields.entry(name.clone()).or_insert_with(|| value.clone());
                merged.fields.insert(format!("{kind}.{name}"), value.clone());
            }
            for (name, value) in &leg.opts {
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
    use crate::configs::{FailedCallRule, LegRequirement};
    use crate::core::event::OPT_FILE_NAME;
    use serde_json::json;
    use std::time::Duration;

    fn matcher(legs: LegRequirement) -> LegMatcher {
        LegMatcher::new(LegMatchingPolicy {
            legs,
            leg_field: "Method".into(),
            key_fields: vec!["OriginID".into()],
            failed_call: Some(FailedCallRule {
                path: format!("*opts.{OPT_FILE_NAME}"),
                prefix: "missed_calls".into(),
            }),
        })
    }

    fn leg(method: &str, origin: &str) -> CanonicalEvent {
        CanonicalEvent::new("cgrates.org", format!("{method}-{origin}"))
            .with_field("Method", method)
            .with_field("OriginID", origin)
    }

    #[test]
    fn completes_once_every_leg_arrived() {
        let m = matcher(LegRequirement::AckOptional);
        let cache = PartialCache::new(Duration::from_secs(5));

        let invite = leg("INVITE", "callA").with_field("Account", "1001");
        let first = m.offer(&cache, "flat", invite).expect("offer invite");
        assert!(first.result.is_none());
        assert!(cache.contains("callA"));

        let bye = leg("BYE", "callA").with_field("Usage", 60);
        let merged = m.offer(&cache, "flat", bye).expect("offer bye").result.expect("merged");
        assert!(cache.is_empty());
        assert_eq!(merged.id, "INVITE-callA");
        assert_eq!(merged.fields.get("Method"), Some(&json!("INVITE")));
        assert_eq!(merged.fields.get("Account"), Some(&json!("1001")));
        assert_eq!(merged.fields.get("Usage"), Some(&json!(60)));
        assert_eq!(merged.fields.get("BYE.Method"), Some(&json!("BYE")));
        assert_eq!(merged.fields.get("INVITE.Account"), Some(&json!("1001")));
    }

    #[test]
    fn ack_mandatory_waits_for_three_legs() {
        let m = matcher(LegRequirement::AckMandatory);
        let cache = PartialCache::new(Duration::from_secs(5));
        assert!(m.offer(&cache, "flat", leg("INVITE", "c")).expect("offer").result.is_none());
        assert!(m.offer(&cache, "flat", leg("BYE", "c")).expect("offer").result.is_none());
        assert!(m.offer(&cache, "flat", leg("ACK", "c")).expect("offer").result.is_some());
    }

    #[test]
    fn unknown_legs_and_missing_keys_are_errors() {
        let m = matcher(LegRequirement::AckOptional);
        let cache = PartialCache::new(Duration::from_secs(5));
        assert!(matches!(
            m.offer(&cache, "flat", leg("REFER", "callA")),
            Err(ProcessError::UnsupportedLeg { kind, .. }) if kind == "REFER"
        ));
        let keyless = CanonicalEvent::new("t", "1").with_field("Method", "INVITE");
        assert!(matches!(m.offer(&cache, "flat", keyless), Err(ProcessError::Correlation(_))));
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_calls_are_recognized_by_file_prefix() {
        let m = matcher(LegRequirement::AckOptional);
        let failed = leg("INVITE", "x").with_opt(OPT_FILE_NAME, "missed_calls_0001.log");
        assert!(m.is_failed_call(&failed));
        let normal = leg("INVITE", "x").with_opt(OPT_FILE_NAME, "acc_0001.log");
        assert!(!m.is_failed_call(&normal));
    }
}
