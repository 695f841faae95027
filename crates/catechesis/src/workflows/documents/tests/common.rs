pub(super) use crate::workflows::testing::*;

use crate::extraction::DocumentKind;
use crate::ids::DocumentId;

/// Upload without waiting for extraction.
pub(super) async fn upload_now(harness: &Harness, kind: DocumentKind, bytes: &[u8]) -> DocumentId {
    let enrollment = harness.enroll().await;
    harness
        .pipeline
        .documents
        .upload(harness.guardian, enrollment.id, kind, bytes)
        .await
        .expect("document accepted")
        .document_id
}
