//! End-to-end runs over real spool directories: a configuration file is
//! loaded, the registry starts the built-in directory readers, and events
//! reach the charging backend through flag-driven post-processing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lib_ingest::core::BackendCall;
use lib_ingest::core::event::{OPT_FILE_NAME, OPT_READER_ID};
use lib_ingest::{load_config, DefaultReaderFactory, ErsConfig, ReaderService};
use project_tests::{eventually, RecordingBackend};

const WAIT: Duration = Duration::from_secs(3);

/// Drops a file into a spool directory in one step so a polling reader never
/// sees it half written.
fn drop_file(dir: &Path, name: &str, contents: &str) {
    let staging = dir.join(format!(".{name}.part"));
    std::fs::write(&staging, contents).expect("write staging file");
    std::fs::rename(&staging, dir.join(name)).expect("publish file");
}

fn write_config(dir: &Path, doc: serde_json::Value) -> ErsConfig {
    let path = dir.join("ers.json");
    std::fs::write(&path, doc.to_string()).expect("write config");
    load_config(&path).expect("config loads")
}

struct Running {
    svc: Arc<ReaderService>,
    backend: Arc<RecordingBackend>,
    shutdown: CancellationToken,
    serving: tokio::task::JoinHandle<Result<(), lib_ingest::ServiceError>>,
    _reload: mpsc::Sender<ErsConfig>,
}

async fn serve(cfg: &ErsConfig) -> Running {
    let backend = RecordingBackend::new();
    let svc = Arc::new(
        ReaderService::new(cfg, Arc::new(DefaultReaderFactory), backend.clone()).expect("service"),
    );
    svc.start(cfg).await.expect("start");
    let shutdown = CancellationToken::new();
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let serving = tokio::spawn({
        let svc = Arc::clone(&svc);
        let shutdown = shutdown.clone();
        async move { svc.serve(shutdown, reload_rx).await }
    });
    Running {
        svc,
        backend,
        shutdown,
        serving,
        _reload: reload_tx,
    }
}

impl Running {
    async fn stop(self) -> Arc<RecordingBackend> {
        self.shutdown.cancel();
        self.serving.await.expect("serve task").expect("clean shutdown");
        self.backend
    }
}

#[tokio::test]
async fn json_file_becomes_one_cdr() {
    let work = tempfile::tempdir().expect("tempdir");
    let spool = work.path().join("in");
    std::fs::create_dir(&spool).expect("spool");
    let cfg = write_config(
        work.path(),
        json!({
            "ers": {
                "readers": [{
                    "id": "json",
                    "type": "*file_json",
                    "run_mode": "watch",
                    "run_delay": "20ms",
                    "source_path": spool,
                    "flags": ["*cdrs"],
                    "fields": [
                        { "tag": "OriginID", "path": "*cgreq.OriginID", "type": "*variable", "value": "~*req.OriginID" }
                    ]
                }]
            }
        }),
    );
    let running = serve(&cfg).await;

    drop_file(&spool, "cdr_0001.json", r#"{"OriginID":"X1"}"#);
    let calls = running.backend.wait_for(1, WAIT).await;
    assert!(eventually(WAIT, || !spool.join("cdr_0001.json").exists()).await);
    let backend = running.stop().await;

    assert_eq!(calls.len(), 1);
    let BackendCall::ProcessCdr { event } = &calls[0] else {
        panic!("expected a CDR, got {:?}", calls[0]);
    };
    assert_eq!(event.tenant, "cgrates.org");
    assert_eq!(event.fields.len(), 1);
    assert_eq!(event.fields.get("OriginID"), Some(&json!("X1")));
    assert_eq!(event.opts.get(OPT_READER_ID), Some(&json!("json")));
    assert_eq!(event.opts.get(OPT_FILE_NAME), Some(&json!("cdr_0001.json")));
    assert_eq!(backend.calls().len(), 1);
}

fn flatstore_config(work: &Path, spool: &Path, ttl: &str) -> ErsConfig {
    write_config(
        work,
        json!({
            "sweep_interval": "20ms",
            "readers": [{
                "id": "flat",
                "type": "*flatstore",
                "run_mode": "on_demand",
                "source_path": spool,
                "flags": ["*cdrs"],
                "fields": [
                    { "tag": "Method", "path": "*cgreq.Method", "value": "~*req.0" },
                    { "tag": "OriginID", "path": "*cgreq.OriginID", "value": "~*req.1" },
                    { "tag": "Account", "path": "*cgreq.Account", "value": "~*req.2" }
                ],
                "partial": {
                    "policy": { "kind": "leg_matching", "legs": "ack_optional" },
                    "ttl": ttl,
                    "action": "discard"
                }
            }]
        }),
    )
}

#[tokio::test]
async fn flatstore_legs_merge_into_one_record() {
    let work = tempfile::tempdir().expect("tempdir");
    let spool = work.path().join("in");
    std::fs::create_dir(&spool).expect("spool");
    let cfg = flatstore_config(work.path(), &spool, "5s");
    let running = serve(&cfg).await;

    drop_file(&spool, "calls.log", "INVITE|callA|1001\nBYE|callA|1001\n");
    assert_eq!(running.svc.run_reader("flat").await.expect("manual run"), 2);
    let calls = running.backend.wait_for(1, WAIT).await;
    let backend = running.stop().await;

    assert_eq!(calls.len(), 1);
    let BackendCall::ProcessCdr { event } = &calls[0] else {
        panic!("expected a CDR, got {:?}", calls[0]);
    };
    assert_eq!(event.fields.get("INVITE.Method"), Some(&json!("INVITE")));
    assert_eq!(event.fields.get("BYE.Method"), Some(&json!("BYE")));
    assert_eq!(event.fields.get("OriginID"), Some(&json!("callA")));
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn lone_leg_is_discarded_after_ttl() {
    let work = tempfile::tempdir().expect("tempdir");
    let spool = work.path().join("in");
    std::fs::create_dir(&spool).expect("spool");
    let cfg = flatstore_config(work.path(), &spool, "100ms");
    let running = serve(&cfg).await;

    drop_file(&spool, "calls.log", "INVITE|callB|1001\n");
    assert_eq!(running.svc.run_reader("flat").await.expect("manual run"), 1);

    let handle = running.svc.handle("flat").await.expect("flat registered");
    let correlator = Arc::clone(handle.ingest().correlator().expect("leg matching reader"));
    assert!(eventually(WAIT, || correlator.evictions() == 1).await);
    assert_eq!(correlator.pending(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let backend = running.stop().await;
    assert!(backend.calls().is_empty());
}
