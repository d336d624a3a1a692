//! Admission control across a running ingestion loop: no more processing
//! units than the configured limit are ever in flight, and every token taken
//! is returned.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use lib_ingest::records::FieldTemplate;
use lib_ingest::{AdmissionPool, SourceAdapter, SourceDescriptor};
use project_tests::{loop_harness, ChannelAdapter};

fn json_reader(limit: usize) -> SourceDescriptor {
    let mut desc = SourceDescriptor::new("json", "*file_json");
    desc.fields = vec![FieldTemplate::variable("OriginID", "~*req.OriginID")];
    desc.concurrent_requests = limit;
    desc
}

struct Outcome {
    peak_units: usize,
    peak_tokens: usize,
    acquired: u64,
    released: u64,
    acked: usize,
}

async fn run_batch(limit: usize, messages: usize, ack_delay: Duration) -> Outcome {
    let (adapter, feed) = ChannelAdapter::with_ack_delay(ack_delay);
    let mut h = loop_harness(json_reader(limit), adapter.clone() as Arc<dyn SourceAdapter>, messages + 1);
    for i in 0..messages {
        feed.push(&format!(r#"{{"OriginID":"call-{i}"}}"#));
    }
    drop(feed);

    h.ingest.clone().run(CancellationToken::new()).await;
    h.ingest.drain().await;
    let mut forwarded = 0;
    while h.events.try_recv().is_ok() {
        forwarded += 1;
    }
    assert_eq!(forwarded, messages);

    let pool: &AdmissionPool = h.ingest.pool();
    Outcome {
        peak_units: adapter.peak_ack(),
        peak_tokens: pool.peak(),
        acquired: pool.acquired(),
        released: pool.released(),
        acked: adapter.acked().len(),
    }
}

#[tokio::test(start_paused = true)]
async fn saturated_loop_runs_exactly_limit_units() {
    let out = run_batch(2, 10, Duration::from_millis(20)).await;
    assert_eq!(out.peak_units, 2);
    assert_eq!(out.peak_tokens, 2);
    assert_eq!(out.acked, 10);
    // One token per message plus the one held while the stream reported its end.
    assert_eq!(out.acquired, 11);
    assert_eq!(out.released, 11);
}

#[tokio::test(start_paused = true)]
async fn single_token_serializes_processing() {
    let out = run_batch(1, 5, Duration::from_millis(10)).await;
    assert_eq!(out.peak_units, 1);
    assert_eq!(out.acked, 5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn in_flight_units_never_exceed_the_limit(limit in 1usize..6, messages in 1usize..25, delay_ms in 0u64..3) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("runtime");
        let out = rt.block_on(run_batch(limit, messages, Duration::from_millis(delay_ms)));

        prop_assert!(out.peak_units <= limit);
        prop_assert!(out.peak_tokens <= limit);
        prop_assert_eq!(out.acquired, out.released);
        prop_assert_eq!(out.acked, messages);
    }
}
