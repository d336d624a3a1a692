//! Partial-record correlation through a reader's [`Correlator`]: leg
//! matching within and past the TTL, fragment ordering on the final
//! fragment, and eviction that happens at most once per group.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use lib_ingest::configs::{
    CompletionPolicy, EvictionAction, FragmentPolicy, LegMatchingPolicy, LegRequirement, SourceDefaults,
};
use lib_ingest::core::event::OPT_PARTIAL;
use lib_ingest::correlation::{Correlation, Correlator, GroupAction};
use lib_ingest::{CanonicalEvent, ReaderEvent, SourceDescriptor};

const TTL: Duration = Duration::from_secs(2);

fn leg_reader(action: EvictionAction) -> SourceDescriptor {
    let mut desc = SourceDescriptor::new("flat", "*flatstore");
    desc.partial.policy = CompletionPolicy::LegMatching(LegMatchingPolicy {
        legs: LegRequirement::AckOptional,
        leg_field: "Method".into(),
        key_fields: vec!["OriginID".into()],
        failed_call: None,
    });
    desc.partial.ttl = TTL;
    desc.partial.action = action;
    desc
}

fn fragment_reader() -> SourceDescriptor {
    let mut desc = SourceDescriptor::new("partials", "*file_csv");
    desc.partial.policy = CompletionPolicy::FinalFragment(FragmentPolicy::default());
    desc.partial.ttl = TTL;
    desc
}

fn correlator(desc: SourceDescriptor) -> (Arc<Correlator>, mpsc::Receiver<ReaderEvent>) {
    let (tx, rx) = mpsc::channel(8);
    let correlator = Correlator::for_source(Arc::new(desc), &SourceDefaults::default(), Duration::from_millis(100), tx)
        .expect("reader has a completion policy");
    (Arc::new(correlator), rx)
}

fn leg(method: &str, call: &str) -> CanonicalEvent {
    CanonicalEvent::new("cgrates.org", format!("{method}-{call}"))
        .with_field("Method", method)
        .with_field("OriginID", call)
        .with_field("Account", "1001")
}

#[tokio::test(start_paused = true)]
async fn legs_within_ttl_merge_into_one_record() {
    let (c, mut events) = correlator(leg_reader(EvictionAction::PostEvent));

    assert_eq!(c.offer(leg("INVITE", "callA")).await.expect("offer"), Correlation::Buffered);
    tokio::time::advance(TTL / 2).await;
    let merged = match c.offer(leg("BYE", "callA")).await.expect("offer") {
        Correlation::Forward(ev) => ev,
        other => panic!("expected a merged record, got {other:?}"),
    };

    assert_eq!(merged.fields.get("INVITE.Method"), Some(&json!("INVITE")));
    assert_eq!(merged.fields.get("BYE.Method"), Some(&json!("BYE")));
    assert_eq!(merged.id, "INVITE-callA");
    assert_eq!(c.pending(), 0);

    tokio::time::advance(TTL * 2).await;
    assert_eq!(c.sweep().await, 0);
    assert_eq!(c.evictions(), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn lone_leg_is_evicted_once_after_ttl() {
    let (c, mut events) = correlator(leg_reader(EvictionAction::Discard));

    assert_eq!(c.offer(leg("INVITE", "callB")).await.expect("offer"), Correlation::Buffered);
    tokio::time::advance(TTL - Duration::from_millis(1)).await;
    assert_eq!(c.sweep().await, 0);

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(c.sweep().await, 1);
    assert_eq!(c.sweep().await, 0);
    assert_eq!(c.evictions(), 1);
    assert_eq!(c.pending(), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn late_leg_starts_a_new_group_after_lazy_eviction() {
    let (c, mut events) = correlator(leg_reader(EvictionAction::PostEvent));

    c.offer(leg("INVITE", "callC")).await.expect("offer");
    tokio::time::advance(TTL + Duration::from_millis(1)).await;

    // The expired group is found on access and evicted before the new leg lands.
    assert_eq!(c.offer(leg("BYE", "callC")).await.expect("offer"), Correlation::Buffered);
    let evicted = events.try_recv().expect("expired group posted");
    assert_eq!(evicted.event.fields.get("INVITE.Method"), Some(&json!("INVITE")));
    assert!(evicted.event.fields.get("BYE.Method").is_none());
    assert!(evicted.raw.is_none());
    assert_eq!(c.evictions(), 1);
    assert_eq!(c.pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_sweeps_evict_a_group_once() {
    let (c, mut events) = correlator(leg_reader(EvictionAction::PostEvent));
    for call in ["c1", "c2", "c3"] {
        c.offer(leg("INVITE", call)).await.expect("offer");
    }
    tokio::time::advance(TTL + Duration::from_millis(1)).await;

    let sweeps: Vec<_> = (0..4)
        .map(|_| {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.sweep().await })
        })
        .collect();
    let mut taken = 0;
    for sweep in sweeps {
        taken += sweep.await.expect("sweep task");
    }

    assert_eq!(taken, 3);
    assert_eq!(c.evictions(), 3);
    let mut posted = 0;
    while events.try_recv().is_ok() {
        posted += 1;
    }
    assert_eq!(posted, 3);
}

#[tokio::test(start_paused = true)]
async fn empty_group_eviction_has_no_effect() {
    let (c, mut events) = correlator(leg_reader(EvictionAction::PostEvent));
    c.cache().update("empty", |_| ((), GroupAction::Keep));
    tokio::time::advance(TTL + Duration::from_millis(1)).await;

    assert_eq!(c.sweep().await, 1);
    assert_eq!(c.evictions(), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn expired_legs_are_dumped_to_the_spool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut desc = leg_reader(EvictionAction::DumpToFile);
    desc.partial.ttl = Duration::from_millis(30);
    desc.partial.dump_path = Some(dir.path().to_path_buf());
    let (c, _events) = correlator(desc);

    c.offer(leg("INVITE", "callD")).await.expect("offer");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(c.sweep().await, 1);

    let dumps: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read spool")
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    assert_eq!(dumps.len(), 1);
    assert_eq!(dumps[0].extension().and_then(|e| e.to_str()), Some("tmp"));
    let line = std::fs::read_to_string(&dumps[0]).expect("dump contents");
    // Field values in field-name order: Account, Method, OriginID.
    assert_eq!(line, "1001,INVITE,callD\n");
}

fn fragment(answer: &str, cost: &str, partial: bool) -> CanonicalEvent {
    CanonicalEvent::new("cgrates.org", format!("frag-{cost}"))
        .with_field("OriginID", "orig-1")
        .with_field("OriginHost", "host-a")
        .with_field("AnswerTime", answer)
        .with_field("Cost", cost)
        .with_field(format!("Seen{cost}"), true)
        .with_opt(OPT_PARTIAL, partial)
}

#[tokio::test(start_paused = true)]
async fn final_fragment_merges_in_time_order() {
    let (c, _events) = correlator(fragment_reader());
    let t1 = "2024-03-01T10:00:10Z";
    let t2 = "2024-03-01T10:00:05Z";
    let t3 = "2024-03-01T10:00:20Z";

    assert_eq!(c.offer(fragment(t1, "1", true)).await.expect("offer"), Correlation::Buffered);
    assert_eq!(c.offer(fragment(t3, "3", true)).await.expect("offer"), Correlation::Buffered);
    let merged = match c.offer(fragment(t2, "2", false)).await.expect("offer") {
        Correlation::Forward(ev) => ev,
        other => panic!("expected the merged record, got {other:?}"),
    };

    // t2 sorts first, so its values win every overlap.
    assert_eq!(merged.id, "frag-2");
    assert_eq!(merged.fields.get("Cost"), Some(&json!("2")));
    assert_eq!(merged.fields.get("AnswerTime"), Some(&json!(t2)));
    for seen in ["Seen1", "Seen2", "Seen3"] {
        assert_eq!(merged.fields.get(seen), Some(&json!(true)), "{seen}");
    }
    assert!(!merged.opts.contains_key(OPT_PARTIAL));
    assert_eq!(c.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn events_without_marker_bypass_fragment_buffering() {
    let (c, _events) = correlator(fragment_reader());
    let complete = CanonicalEvent::new("cgrates.org", "whole").with_field("OriginID", "orig-2");
    assert_eq!(c.classify(&complete), lib_ingest::core::Disposition::Complete);
    let marked = complete.clone().with_opt(OPT_PARTIAL, true);
    assert_eq!(c.classify(&marked), lib_ingest::core::Disposition::Partial);
}
