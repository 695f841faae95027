use catechesis::workflows::{GuardianNotice, GuardianNotifier, NotifyError};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Messaging adapters live outside this service; notices are logged so an
/// operator can follow them until one is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TracingNotifier;

impl GuardianNotifier for TracingNotifier {
    fn notify(&self, notice: GuardianNotice) -> Result<(), NotifyError> {
        info!(
            guardian = %notice.guardian_id,
            enrollment = %notice.enrollment_id,
            kind = notice.kind.label(),
            details = ?notice.details,
            "guardian notice"
        );
        Ok(())
    }
}
