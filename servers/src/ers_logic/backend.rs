use async_trait::async_trait;
use lib_ingest::core::{BackendCall, BackendReply, ChargingBackend};
use lib_ingest::errors::BackendError;
use tracing::info;

/// Downstream stand-in that logs every call and accepts it.
///
/// The rating and session subsystems live in other processes; this backend
/// lets the reader service run on its own, e.g. to validate reader
/// configurations against real input.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingBackend;

#[async_trait]
impl ChargingBackend for LoggingBackend {
    async fn call(&self, call: BackendCall) -> Result<BackendReply, BackendError> {
        match &call {
            BackendCall::ExportRaw { exporter_ids, id, fields, .. } => {
                info!(call = call.name(), id = %id, exporters = ?exporter_ids, fields = fields.len(), "downstream call");
            }
            BackendCall::Export { exporter_ids, event } => {
                info!(call = call.name(), id = %event.id, exporters = ?exporter_ids, "downstream call");
            }
            BackendCall::ProcessStats { ids, event } | BackendCall::ProcessThresholds { ids, event } => {
                info!(call = call.name(), id = %event.id, profiles = ?ids, "downstream call");
            }
            BackendCall::Authorize { event, .. }
            | BackendCall::InitiateSession { event, .. }
            | BackendCall::UpdateSession { event, .. }
            | BackendCall::TerminateSession { event, .. }
            | BackendCall::ProcessMessage { event, .. }
            | BackendCall::ProcessEvent { event, .. }
            | BackendCall::ProcessCdr { event } => {
                info!(call = call.name(), id = %event.id, tenant = %event.tenant, fields = event.fields.len(), "downstream call");
            }
        }
        Ok(BackendReply::default())
    }
}
