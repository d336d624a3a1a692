//! Every exit path of a processing unit returns its admission token:
//! decode, filter, mapping and post failures as well as success.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lib_ingest::records::FieldTemplate;
use lib_ingest::{SourceAdapter, SourceDescriptor};
use project_tests::{loop_harness, ChannelAdapter, LoopHarness};

fn reader() -> SourceDescriptor {
    let mut desc = SourceDescriptor::new("json", "*file_json");
    desc.fields = vec![FieldTemplate::variable("Account", "~*req.Account").mandatory()];
    desc.concurrent_requests = 3;
    desc
}

async fn run_all(desc: SourceDescriptor, payloads: &[&str]) -> (LoopHarness, Arc<ChannelAdapter>) {
    let (adapter, feed) = ChannelAdapter::new();
    let h = loop_harness(desc, adapter.clone() as Arc<dyn SourceAdapter>, 16);
    for payload in payloads {
        feed.push(payload);
    }
    drop(feed);
    h.ingest.clone().run(CancellationToken::new()).await;
    h.ingest.drain().await;
    (h, adapter)
}

fn assert_balanced(h: &LoopHarness) {
    let pool = h.ingest.pool();
    assert_eq!(pool.in_flight(), 0);
    assert_eq!(pool.acquired(), pool.released());
}

#[tokio::test]
async fn decode_failures_return_tokens() {
    let (h, adapter) = run_all(reader(), &["not json", "[1,2]", r#"{"Account":"1001"}"#]).await;
    assert_balanced(&h);
    assert_eq!(
        adapter.rejected(),
        vec![("m0".to_string(), true), ("m1".to_string(), true)]
    );
    assert_eq!(adapter.acked(), vec!["m2".to_string()]);
    assert_eq!(h.ingest.failed(), 2);
}

#[tokio::test]
async fn filter_errors_and_filtered_records_return_tokens() {
    let mut desc = reader();
    desc.filters = vec!["FLTR_UNKNOWN".into()];
    let (h, adapter) = run_all(desc, &[r#"{"Account":"1001"}"#]).await;
    assert_balanced(&h);
    assert_eq!(adapter.rejected().len(), 1);

    let mut desc = reader();
    desc.filters = vec!["*string:~*req.Tenant:cgrates.org".into()];
    let (mut h, adapter) = run_all(desc, &[r#"{"Tenant":"other.org","Account":"1001"}"#]).await;
    assert_balanced(&h);
    // A record that does not pass is done with, not failed.
    assert_eq!(adapter.acked(), vec!["m0".to_string()]);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn mapping_failures_return_tokens() {
    let (h, adapter) = run_all(reader(), &[r#"{"Tenant":"cgrates.org"}"#, r#"{"Destination":"1002"}"#]).await;
    assert_balanced(&h);
    assert_eq!(adapter.rejected().len(), 2);
    assert!(adapter.acked().is_empty());
}

#[tokio::test]
async fn post_failures_return_tokens() {
    let (adapter, feed) = ChannelAdapter::new();
    let h = loop_harness(reader(), adapter.clone() as Arc<dyn SourceAdapter>, 16);
    let LoopHarness { ingest, events, errors } = h;
    drop(events);

    feed.push(r#"{"Account":"1001"}"#);
    feed.push(r#"{"Account":"1002"}"#);
    drop(feed);
    ingest.clone().run(CancellationToken::new()).await;
    ingest.drain().await;
    drop(errors);

    assert_eq!(ingest.pool().in_flight(), 0);
    assert_eq!(ingest.pool().acquired(), ingest.pool().released());
    assert_eq!(
        adapter.rejected(),
        vec![("m0".to_string(), true), ("m1".to_string(), true)]
    );
    assert_eq!(ingest.forwarded(), 0);
}
