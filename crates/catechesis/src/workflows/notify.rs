use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ids::{EnrollmentId, ProfileId};
use crate::workflows::enrollment::Transition;

/// Outbound guardian messaging hook (chat adapters, SMS gateways).
pub trait GuardianNotifier: Send + Sync {
    fn notify(&self, notice: GuardianNotice) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    ExtractionReady,
    ManualEntryRequired,
    PaymentValidated,
    PaymentRejected,
    EnrollmentActivated,
}

impl NoticeKind {
    pub const fn label(self) -> &'static str {
        match self {
            NoticeKind::ExtractionReady => "extraction_ready",
            NoticeKind::ManualEntryRequired => "manual_entry_required",
            NoticeKind::PaymentValidated => "payment_validated",
            NoticeKind::PaymentRejected => "payment_rejected",
            NoticeKind::EnrollmentActivated => "enrollment_activated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianNotice {
    pub guardian_id: ProfileId,
    pub enrollment_id: EnrollmentId,
    pub kind: NoticeKind,
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Send one notice per guardian. Runs after commit, so failures are logged and
/// swallowed.
pub(crate) fn dispatch<N>(
    notifier: &N,
    guardians: &[ProfileId],
    enrollment_id: EnrollmentId,
    kind: NoticeKind,
    details: &BTreeMap<String, String>,
) where
    N: GuardianNotifier + ?Sized,
{
    for guardian in guardians {
        let notice = GuardianNotice {
            guardian_id: *guardian,
            enrollment_id,
            kind,
            details: details.clone(),
        };
        if let Err(err) = notifier.notify(notice) {
            warn!(%guardian, %enrollment_id, kind = kind.label(), error = %err, "guardian notification failed");
        }
    }
}

pub(crate) fn details<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Details of an `EnrollmentActivated` notice.
pub(crate) fn activation_details(transition: &Transition) -> BTreeMap<String, String> {
    details([
        ("number", transition.number.clone().unwrap_or_default()),
        ("amount_paid", transition.amount_paid.to_string()),
    ])
}
