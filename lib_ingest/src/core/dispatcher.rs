//! # Post-Processing Dispatcher
//!
//! Turns one dispatched [`ReaderEvent`] into calls on the downstream
//! [`ChargingBackend`], as selected by the reader's flags. The work happens
//! in a fixed order:
//!
//! 1. `*log` logs the event.
//! 2. The request type (highest-priority request flag) runs its lifecycle
//!    call. No request flag at all is an error.
//! 3. `*cdrs` sends the event for CDR processing, `*export` to the reader's
//!    exporters.
//! 4. The undecoded record goes to the success or failure exporters.
//! 5. `*ers_stats` / `*ers_thresholds` receive the processing-time report.
//!
//! `*dryrun` logs the event and makes no downstream call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::event::{CanonicalEvent, FieldMap, ReaderEvent};
use super::flags::{FlagKind, FlagSet, RequestType};
use crate::errors::{BackendError, DispatchError};

/// Prefix of rating errors returned for message debits.
pub const RALS_ERROR_PREFIX: &str = "RALS_ERROR";
/// Value of the `Source` field in processing-time reports.
pub const REPORT_SOURCE: &str = "ERs";

/// Session subsystem switches derived from the reader's modifier flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionArgs {
    /// `Some(ids)` when the subsystem is enabled, optionally restricted to profiles.
    pub attributes: Option<Vec<String>>,
    pub thresholds: Option<Vec<String>>,
    pub stats: Option<Vec<String>>,
    pub resources: bool,
    pub accounts: bool,
    pub routes: bool,
    pub routes_ignore_errors: bool,
    pub routes_event_cost: bool,
    /// Cost ceiling for route selection, e.g. `*event_cost`.
    pub routes_max_cost: Option<String>,
    pub force_duration: bool,
}

impl SessionArgs {
    pub fn from_flags(flags: &FlagSet) -> Self {
        Self {
            attributes: flags.ids_if_set(FlagKind::Attributes),
            thresholds: flags.ids_if_set(FlagKind::Thresholds),
            stats: flags.ids_if_set(FlagKind::Stats),
            resources: flags.has(FlagKind::Resources),
            accounts: flags.has(FlagKind::Accounts),
            routes: flags.has(FlagKind::Routes),
            routes_ignore_errors: flags.has(FlagKind::RoutesIgnoreErrors),
            routes_event_cost: flags.has(FlagKind::RoutesEventCost),
            routes_max_cost: flags.ids(FlagKind::RoutesMaxCost).first().cloned(),
            force_duration: flags.has(FlagKind::ForceDuration),
        }
    }
}

/// One call into the downstream collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Authorize { args: SessionArgs, event: CanonicalEvent },
    InitiateSession { args: SessionArgs, event: CanonicalEvent },
    UpdateSession { args: SessionArgs, event: CanonicalEvent },
    TerminateSession { args: SessionArgs, event: CanonicalEvent },
    ProcessMessage { args: SessionArgs, event: CanonicalEvent },
    ProcessEvent { flags: Vec<String>, event: CanonicalEvent },
    ProcessCdr { event: CanonicalEvent },
    Export { exporter_ids: Vec<String>, event: CanonicalEvent },
    /// Undecoded record of a source message.
    ExportRaw {
        exporter_ids: Vec<String>,
        tenant: String,
        id: String,
        fields: FieldMap,
    },
    ProcessStats { ids: Vec<String>, event: CanonicalEvent },
    ProcessThresholds { ids: Vec<String>, event: CanonicalEvent },
}

impl BackendCall {
    pub fn name(&self) -> &'static str {
        match self {
            BackendCall::Authorize { .. } => "AuthorizeEvent",
            BackendCall::InitiateSession { .. } => "InitiateSession",
            BackendCall::UpdateSession { .. } => "UpdateSession",
            BackendCall::TerminateSession { .. } => "TerminateSession",
            BackendCall::ProcessMessage { .. } => "ProcessMessage",
            BackendCall::ProcessEvent { .. } => "ProcessEvent",
            BackendCall::ProcessCdr { .. } => "ProcessCDR",
            BackendCall::Export { .. } => "ProcessExport",
            BackendCall::ExportRaw { .. } => "ProcessExportRaw",
            BackendCall::ProcessStats { .. } => "ProcessStatsEvent",
            BackendCall::ProcessThresholds { .. } => "ProcessThresholdsEvent",
        }
    }
}

/// Reply of a downstream call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendReply {
    /// Usage granted by a message debit.
    pub max_usage: Option<Duration>,
}

/// The rating/session/export collaborator behind post-processing.
#[async_trait]
pub trait ChargingBackend: Send + Sync {
    async fn call(&self, call: BackendCall) -> Result<BackendReply, BackendError>;
}

/// The step whose call failed, with its error.
type StepResult = Result<(), (FlagKind, DispatchError)>;

/// Flag-driven post-processing of dispatched events.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn ChargingBackend>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn ChargingBackend>) -> Self {
        Self { backend }
    }

    /// Runs every applicable step for `ev`. The returned error is the
    /// outcome of the request; raw export and reporting failures are logged.
    /// Reports carry the error state of the step that failed.
    pub async fn dispatch(&self, ev: ReaderEvent) -> Result<(), DispatchError> {
        let started = Utc::now();
        let flags = FlagSet::parse(&ev.source.flags)?;
        let (state, result) = match flags.request_type() {
            Some(request) => match self.process(&flags, request, &ev).await {
                Ok(()) => ("OK".to_string(), Ok(())),
                Err((step, e)) => (step.error_state(), Err(e)),
            },
            None => (
                "ERR_UNSUPPORTED_REQUEST".to_string(),
                Err(DispatchError::UnsupportedRequestType(flags.names())),
            ),
        };

        if !flags.is_dry_run() {
            self.export_raw(&ev, result.is_ok()).await;
            self.report(&flags, &ev.event, started, &state).await;
        }
        result
    }

    async fn process(&self, flags: &FlagSet, request: RequestType, ev: &ReaderEvent) -> StepResult {
        let mut event = ev.event.clone();
        if flags.has(FlagKind::Log) || request == RequestType::DryRun {
            info!(reader = %ev.reader_id(), request = request.as_str(), event = ?event, "reader event");
        }

        let args = SessionArgs::from_flags(flags);
        let step = request.flag();
        let failed = |e: BackendError| (step, DispatchError::from(e));
        match request {
            RequestType::DryRun => return Ok(()),
            RequestType::Authorize => {
                self.call(BackendCall::Authorize { args, event: event.clone() }).await.map_err(failed)?;
            }
            RequestType::Initiate => {
                self.call(BackendCall::InitiateSession { args, event: event.clone() }).await.map_err(failed)?;
            }
            RequestType::Update => {
                self.call(BackendCall::UpdateSession { args, event: event.clone() }).await.map_err(failed)?;
            }
            RequestType::Terminate => {
                self.call(BackendCall::TerminateSession { args, event: event.clone() }).await.map_err(failed)?;
            }
            RequestType::Message => {
                let debit = args.accounts;
                let reply = self.call(BackendCall::ProcessMessage { args, event: event.clone() }).await;
                match reply {
                    Err(e) if e.reason.starts_with(RALS_ERROR_PREFIX) => {
                        debug!(reader = %ev.reader_id(), id = %event.id, error = %e, "rating failed, zeroing usage");
                        event.fields.insert("Usage".into(), Value::from(0));
                    }
                    Err(e) => return Err(failed(e)),
                    Ok(reply) => {
                        if let (true, Some(usage)) = (debit, reply.max_usage) {
                            let nanos = i64::try_from(usage.as_nanos()).unwrap_or(i64::MAX);
                            event.fields.insert("Usage".into(), Value::from(nanos));
                        }
                    }
                }
            }
            RequestType::Event => {
                let names = flags.names();
                self.call(BackendCall::ProcessEvent { flags: names, event: event.clone() })
                    .await
                    .map_err(failed)?;
            }
            RequestType::Cdrs | RequestType::None | RequestType::Export => {}
        }

        if flags.has(FlagKind::Cdrs) {
            self.call(BackendCall::ProcessCdr { event: event.clone() })
                .await
                .map_err(|e| (FlagKind::Cdrs, DispatchError::from(e)))?;
        }
        if flags.has(FlagKind::Export) {
            let exporter_ids = ev.source.exporters.export_ids.clone();
            self.call(BackendCall::Export { exporter_ids, event })
                .await
                .map_err(|e| (FlagKind::Export, DispatchError::from(e)))?;
        }
        Ok(())
    }

    async fn call(&self, call: BackendCall) -> Result<BackendReply, BackendError> {
        let name = call.name();
        let reply = self.backend.call(call).await;
        if let Err(e) = &reply {
            debug!(call = name, error = %e, "downstream call failed");
        }
        reply
    }

    async fn export_raw(&self, ev: &ReaderEvent, succeeded: bool) {
        let Some(raw) = &ev.raw else {
            return;
        };
        let exporters = &ev.source.exporters;
        let exporter_ids = if succeeded { &exporters.success_ids } else { &exporters.failed_ids };
        if exporter_ids.is_empty() {
            return;
        }
        let call = BackendCall::ExportRaw {
            exporter_ids: exporter_ids.clone(),
            tenant: ev.event.tenant.clone(),
            id: ev.event.id.clone(),
            fields: raw.clone(),
        };
        if let Err(e) = self.call(call).await {
            warn!(reader = %ev.reader_id(), id = %ev.event.id, error = %e, "failed to export raw event");
        }
    }

    async fn report(&self, flags: &FlagSet, event: &CanonicalEvent, started: DateTime<Utc>, state: &str) {
        let stats = flags.ids_if_set(FlagKind::ErsStats);
        let thresholds = flags.ids_if_set(FlagKind::ErsThresholds);
        if stats.is_none() && thresholds.is_none() {
            return;
        }
        let report = processing_report(event, state, started, Utc::now());

        if let Some(ids) = stats {
            let call = BackendCall::ProcessStats { ids, event: report.clone() };
            if let Err(e) = self.call(call).await {
                warn!(id = %event.id, error = %e, "failed to report processing time to stats");
            }
        }
        if let Some(ids) = thresholds {
            let call = BackendCall::ProcessThresholds { ids, event: report };
            if let Err(e) = self.call(call).await {
                warn!(id = %event.id, error = %e, "failed to report processing time to thresholds");
            }
        }
    }
}

/// The event enriched with the outcome and timing of its processing.
pub fn processing_report(
    event: &CanonicalEvent,
    state: &str,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
) -> CanonicalEvent {
    let elapsed = (ended - started).num_nanoseconds().unwrap_or(i64::MAX).max(0);
    let mut report = event.clone();
    report.fields.insert("ReplyState".into(), Value::from(state));
    report.fields.insert("StartTime".into(), Value::from(started.to_rfc3339()));
    report.fields.insert("EndTime".into(), Value::from(ended.to_rfc3339()));
    report.fields.insert("ProcessingTime".into(), Value::from(elapsed));
    report.fields.insert("Source".into(), Value::from(REPORT_SOURCE));
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::SourceDescriptor;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<BackendCall>>,
        fail: Option<(&'static str, String)>,
        grant: Option<Duration>,
    }

    #[async_trait]
    impl ChargingBackend for Recorder {
        async fn call(&self, call: BackendCall) -> Result<BackendReply, BackendError> {
            let name = call.name();
            self.calls.lock().push(call);
            match &self.fail {
                Some((failing, reason)) if *failing == name => Err(BackendError {
                    call: name,
                    reason: reason.clone(),
                }),
                _ => Ok(BackendReply { max_usage: self.grant }),
            }
        }
    }

    fn event(flags: &[&str]) -> ReaderEvent {
        let mut desc = SourceDescriptor::new("r1", "*file_json");
        desc.flags = flags.iter().map(|f| f.to_string()).collect();
        desc.exporters.export_ids = vec!["ee1".into()];
        desc.exporters.success_ids = vec!["ok".into()];
        desc.exporters.failed_ids = vec!["bad".into()];
        ReaderEvent {
            source: Arc::new(desc),
            event: CanonicalEvent::new("cgrates.org", "e1").with_field("Usage", 10),
            raw: Some(FieldMap::from([("Usage".to_string(), json!("10"))])),
        }
    }

    fn names(rec: &Recorder) -> Vec<&'static str> {
        rec.calls.lock().iter().map(BackendCall::name).collect()
    }

    #[tokio::test]
    async fn cdrs_and_export_run_after_the_request() {
        let rec = Arc::new(Recorder::default());
        let d = Dispatcher::new(rec.clone());
        d.dispatch(event(&["*initiate", "*cdrs", "*export", "*attributes:ATTR1"]))
            .await
            .expect("dispatch");
        assert_eq!(
            names(&rec),
            ["InitiateSession", "ProcessCDR", "ProcessExport", "ProcessExportRaw"]
        );
        let calls = rec.calls.lock();
        let BackendCall::InitiateSession { args, .. } = &calls[0] else {
            panic!("expected a session call");
        };
        assert_eq!(args.attributes.as_deref(), Some(&["ATTR1".to_string()][..]));
        assert!(matches!(&calls[3], BackendCall::ExportRaw { exporter_ids, .. } if exporter_ids == &["ok"]));
    }

    #[tokio::test]
    async fn missing_request_type_is_an_error() {
        let rec = Arc::new(Recorder::default());
        let d = Dispatcher::new(rec.clone());
        let err = d.dispatch(event(&["*log"])).await.expect_err("no request type");
        assert!(matches!(err, DispatchError::UnsupportedRequestType(_)));
        assert_eq!(names(&rec), ["ProcessExportRaw"]);
        let calls = rec.calls.lock();
        assert!(matches!(&calls[0], BackendCall::ExportRaw { exporter_ids, .. } if exporter_ids == &["bad"]));
    }

    #[tokio::test]
    async fn dry_run_makes_no_calls() {
        let rec = Arc::new(Recorder::default());
        let d = Dispatcher::new(rec.clone());
        d.dispatch(event(&["*dryrun", "*cdrs", "*ers_stats:S1"])).await.expect("dispatch");
        assert!(rec.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn message_debit_reflects_granted_usage() {
        let rec = Arc::new(Recorder {
            grant: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let d = Dispatcher::new(rec.clone());
        d.dispatch(event(&["*message", "*accounts", "*cdrs"])).await.expect("dispatch");
        let calls = rec.calls.lock();
        let BackendCall::ProcessCdr { event } = &calls[1] else {
            panic!("expected the CDR call second");
        };
        assert_eq!(event.fields.get("Usage"), Some(&json!(5_000_000_000i64)));
    }

    #[tokio::test]
    async fn rating_errors_zero_the_usage() {
        let rec = Arc::new(Recorder {
            fail: Some(("ProcessMessage", "RALS_ERROR:INSUFFICIENT_CREDIT".into())),
            ..Default::default()
        });
        let d = Dispatcher::new(rec.clone());
        d.dispatch(event(&["*message", "*accounts", "*cdrs"])).await.expect("dispatch");
        let calls = rec.calls.lock();
        let BackendCall::ProcessCdr { event } = &calls[1] else {
            panic!("expected the CDR call second");
        };
        assert_eq!(event.fields.get("Usage"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn failed_requests_are_reported_with_their_state() {
        let rec = Arc::new(Recorder {
            fail: Some(("AuthorizeEvent", "SERVER_ERROR".into())),
            ..Default::default()
        });
        let d = Dispatcher::new(rec.clone());
        let err = d
            .dispatch(event(&["*authorize", "*cdrs", "*ers_stats:S1", "*ers_thresholds"]))
            .await
            .expect_err("authorize fails");
        assert!(matches!(err, DispatchError::Backend(_)));
        assert_eq!(
            names(&rec),
            ["AuthorizeEvent", "ProcessExportRaw", "ProcessStatsEvent", "ProcessThresholdsEvent"]
        );
        let calls = rec.calls.lock();
        let BackendCall::ProcessStats { ids, event } = &calls[2] else {
            panic!("expected a stats report");
        };
        assert_eq!(ids, &["S1"]);
        assert_eq!(event.fields.get("ReplyState"), Some(&json!("ERR_AUTHORIZE")));
        assert_eq!(event.fields.get("Source"), Some(&json!("ERs")));
        assert!(event.fields.contains_key("ProcessingTime"));
    }

    #[tokio::test]
    async fn failed_cdr_step_reports_its_own_state() {
        let rec = Arc::new(Recorder {
            fail: Some(("ProcessCDR", "SERVER_ERROR".into())),
            ..Default::default()
        });
        let d = Dispatcher::new(rec.clone());
        let err = d
            .dispatch(event(&["*message", "*cdrs", "*ers_stats"]))
            .await
            .expect_err("cdrs fails");
        assert!(matches!(err, DispatchError::Backend(_)));
        assert_eq!(
            names(&rec),
            ["ProcessMessage", "ProcessCDR", "ProcessExportRaw", "ProcessStatsEvent"]
        );
        let calls = rec.calls.lock();
        let BackendCall::ProcessStats { event, .. } = &calls[3] else {
            panic!("expected a stats report");
        };
        assert_eq!(event.fields.get("ReplyState"), Some(&json!("ERR_CDRS")));
    }

    #[tokio::test]
    async fn failed_export_step_reports_its_own_state() {
        let rec = Arc::new(Recorder {
            fail: Some(("ProcessExport", "EXPORTER_DOWN".into())),
            ..Default::default()
        });
        let d = Dispatcher::new(rec.clone());
        d.dispatch(event(&["*cdrs", "*export", "*ers_thresholds"]))
            .await
            .expect_err("export fails");
        let calls = rec.calls.lock();
        let Some(BackendCall::ProcessThresholds { event, .. }) = calls.last() else {
            panic!("expected a thresholds report");
        };
        assert_eq!(event.fields.get("ReplyState"), Some(&json!("ERR_EXPORT")));
    }

    #[tokio::test]
    async fn routes_max_cost_reaches_session_calls() {
        let rec = Arc::new(Recorder::default());
        let d = Dispatcher::new(rec.clone());
        d.dispatch(event(&["*authorize", "*routes", "*routes_maxcost:*event_cost"]))
            .await
            .expect("dispatch");
        let calls = rec.calls.lock();
        let BackendCall::Authorize { args, .. } = &calls[0] else {
            panic!("expected an authorize call");
        };
        assert!(args.routes);
        assert_eq!(args.routes_max_cost.as_deref(), Some("*event_cost"));
    }
}
