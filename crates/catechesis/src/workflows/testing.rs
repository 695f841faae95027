//! Shared fixtures for workflow tests: a pipeline over temporary stores, a
//! scripted recognition engine and a notifier that keeps what it was sent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request};
use axum::response::Response;
use chrono::NaiveDate;
use serde_json::Value;
use tempfile::TempDir;

use crate::access::{AuditTrail, NewProfile, Role};
use crate::config::AppConfig;
use crate::extraction::{
    DocumentKind, ExtractionService, RecognitionEngine, RecognitionFailure, RecognizedPage,
};
use crate::ids::{DocumentId, EnrollmentId, ProfileId};
use crate::objects::FsObjectStore;
use crate::stores::StoreSet;
use crate::workflows::documents::{ConfirmRequest, DocumentView};
use crate::workflows::enrollment::{EnrollmentView, NewEnrollment};
use crate::workflows::notify::{GuardianNotice, GuardianNotifier, NoticeKind, NotifyError};
use crate::workflows::{Pipeline, ACTOR_HEADER};

pub(crate) const TOTAL_DUE: i64 = 15_000;

/// Hands out queued pages; an empty queue reads as a permanent failure.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    pages: Mutex<VecDeque<Result<RecognizedPage, RecognitionFailure>>>,
    content_types: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub(crate) fn push(&self, page: RecognizedPage) {
        self.pages.lock().expect("engine script poisoned").push_back(Ok(page));
    }

    pub(crate) fn push_failure(&self, failure: RecognitionFailure) {
        self.pages
            .lock()
            .expect("engine script poisoned")
            .push_back(Err(failure));
    }

    /// Content types the engine was called with, oldest first.
    pub(crate) fn content_types(&self) -> Vec<String> {
        self.content_types.lock().expect("engine script poisoned").clone()
    }
}

#[async_trait]
impl RecognitionEngine for ScriptedEngine {
    async fn recognize(
        &self,
        _kind: DocumentKind,
        content_type: &mime::Mime,
        _bytes: &[u8],
    ) -> Result<RecognizedPage, RecognitionFailure> {
        self.content_types
            .lock()
            .expect("engine script poisoned")
            .push(content_type.to_string());
        self.pages
            .lock()
            .expect("engine script poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(RecognitionFailure::Permanent("nothing scripted".into())))
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<GuardianNotice>>,
}

impl RecordingNotifier {
    pub(crate) fn sent(&self) -> Vec<GuardianNotice> {
        self.sent.lock().expect("notifier poisoned").clone()
    }

    pub(crate) fn of_kind(&self, kind: NoticeKind) -> Vec<GuardianNotice> {
        self.sent()
            .into_iter()
            .filter(|notice| notice.kind == kind)
            .collect()
    }
}

impl GuardianNotifier for RecordingNotifier {
    fn notify(&self, notice: GuardianNotice) -> Result<(), NotifyError> {
        self.sent.lock().expect("notifier poisoned").push(notice);
        Ok(())
    }
}

pub(crate) type TestPipeline = Pipeline<FsObjectStore, RecordingNotifier>;

pub(crate) struct Harness {
    pub dir: TempDir,
    pub config: AppConfig,
    pub pipeline: TestPipeline,
    pub engine: Arc<ScriptedEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub objects: Arc<FsObjectStore>,
    pub admin: ProfileId,
    pub guardian: ProfileId,
    pub front_desk: ProfileId,
    pub treasurer: ProfileId,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = AppConfig::in_dir(dir.path().join("data"));
        let stores = StoreSet::open(&config.storage).await.expect("stores open");
        let engine = Arc::new(ScriptedEngine::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let objects = Arc::new(FsObjectStore::new(&config.objects));
        let extraction = ExtractionService::new(engine.clone(), &config.extraction);
        let pipeline = Pipeline::new(stores, &config, objects.clone(), extraction, notifier.clone());

        let admin = pipeline
            .profiles
            .bootstrap_administrator("Père Antoine")
            .await
            .expect("administrator bootstrapped")
            .id;
        let guardian = create_profile(&pipeline, admin, "Awa Diallo", Role::Guardian).await;
        let front_desk = create_profile(&pipeline, admin, "Secrétariat", Role::FrontDesk).await;
        let treasurer = create_profile(&pipeline, admin, "Trésorier", Role::Treasurer).await;

        Self {
            dir,
            config,
            pipeline,
            engine,
            notifier,
            objects,
            admin,
            guardian,
            front_desk,
            treasurer,
        }
    }

    pub(crate) fn trail(&self) -> AuditTrail {
        AuditTrail::new(self.pipeline.stores.enrollment().clone())
    }

    pub(crate) async fn another_guardian(&self, name: &str) -> ProfileId {
        create_profile(&self.pipeline, self.admin, name, Role::Guardian).await
    }

    /// Draft enrollment created by the default guardian for themselves.
    pub(crate) async fn enroll(&self) -> EnrollmentView {
        self.pipeline
            .enrollments
            .create(self.guardian, amadou(2025))
            .await
            .expect("enrollment created")
    }

    pub(crate) async fn upload(
        &self,
        enrollment: EnrollmentId,
        kind: DocumentKind,
        page: RecognizedPage,
    ) -> DocumentView {
        self.engine.push(page);
        let receipt = self
            .pipeline
            .documents
            .upload(self.guardian, enrollment, kind, PDF_BYTES)
            .await
            .expect("document accepted");
        self.settled(receipt.document_id).await
    }

    /// Poll until the background extraction has finished.
    pub(crate) async fn settled(&self, document: DocumentId) -> DocumentView {
        for _ in 0..200 {
            let view = self
                .pipeline
                .documents
                .get_extraction(self.guardian, document)
                .await
                .expect("document readable");
            if view.document.extraction_status.is_settled() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("extraction of {document} never settled");
    }

    /// Birth record and baptism record uploaded and confirmed: the enrollment
    /// leaves `draft`.
    pub(crate) async fn complete_documents(&self, enrollment: EnrollmentId) {
        self.complete_documents_for(enrollment, "Amadou", "2015-03-12")
            .await;
    }

    pub(crate) async fn complete_documents_for(
        &self,
        enrollment: EnrollmentId,
        given_names: &str,
        birth_date: &str,
    ) {
        let birth = self
            .upload(enrollment, DocumentKind::BirthRecord, birth_page(0.92))
            .await;
        self.pipeline
            .documents
            .confirm(
                self.guardian,
                birth.document.id,
                confirm_fields(&[
                    ("last_name", "DIALLO"),
                    ("given_names", given_names),
                    ("birth_date", birth_date),
                    ("birth_place", "Thiès"),
                ]),
            )
            .await
            .expect("birth record confirmed");

        let baptism = self
            .upload(enrollment, DocumentKind::BaptismRecord, baptism_page(0.9))
            .await;
        self.pipeline
            .documents
            .confirm(self.guardian, baptism.document.id, confirm_baptism())
            .await
            .expect("baptism record confirmed");
    }
}

async fn create_profile(
    pipeline: &TestPipeline,
    admin: ProfileId,
    name: &str,
    role: Role,
) -> ProfileId {
    pipeline
        .profiles
        .create(
            admin,
            NewProfile {
                display_name: name.to_string(),
                role,
                channel_identity: None,
                access_code: None,
            },
        )
        .await
        .expect("profile created")
        .id
}

pub(crate) fn amadou(year: i32) -> NewEnrollment {
    NewEnrollment {
        guardian_id: None,
        year,
        last_name: "Diallo".to_string(),
        first_name: "Amadou".to_string(),
        birth_date: birth_date(),
        birth_place: None,
        level: "Première communion".to_string(),
        total_due: TOTAL_DUE,
        allow_homonym: false,
    }
}

pub(crate) fn birth_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 3, 12).expect("valid date")
}

pub(crate) fn birth_page(confidence: f32) -> RecognizedPage {
    RecognizedPage::from_lines(
        [
            "EXTRAIT D'ACTE DE NAISSANCE",
            "Nom : DIALLO",
            "Prénoms : Amadou",
            "Né le 12/03/2015",
            "Lieu de naissance : Thiès",
        ],
        confidence,
    )
}

pub(crate) fn baptism_page(confidence: f32) -> RecognizedPage {
    RecognizedPage::from_lines(
        [
            "CERTIFICAT DE BAPTÊME",
            "Baptisé le 20/04/2015",
            "Paroisse : Saint Joseph de Médina",
            "Célébrant : Abbé Ndiaye",
        ],
        confidence,
    )
}

pub(crate) fn wave_page(confidence: f32) -> RecognizedPage {
    RecognizedPage::from_lines(
        [
            "Wave",
            "Vous avez envoyé 15 000 F à Paroisse Ste Thérèse",
            "ID de transaction : tx8f3k29",
            "Date : 02/10/2025 14h32",
        ],
        confidence,
    )
    .with_colour([29, 196, 255])
}

pub(crate) fn blurry_page() -> RecognizedPage {
    RecognizedPage::from_lines(["Montant : 15 000 F", "ID de transaction : ??"], 0.4)
}

pub(crate) fn confirm_fields(pairs: &[(&str, &str)]) -> ConfirmRequest {
    ConfirmRequest {
        fields: pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

pub(crate) fn confirm_birth() -> ConfirmRequest {
    confirm_fields(&[
        ("last_name", "DIALLO"),
        ("given_names", "Amadou"),
        ("birth_date", "2015-03-12"),
        ("birth_place", "Thiès"),
    ])
}

pub(crate) fn confirm_baptism() -> ConfirmRequest {
    confirm_fields(&[
        ("baptism_date", "20/04/2015"),
        ("parish", "Saint Joseph de Médina"),
        ("officiant", "Abbé Ndiaye"),
    ])
}

pub(crate) const PDF_BYTES: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n%%EOF";

pub(crate) const PNG_BYTES: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
];

pub(crate) fn json_request(
    method: &str,
    uri: &str,
    actor: Option<ProfileId>,
    body: &Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(actor) = actor {
        builder = builder.header(ACTOR_HEADER, actor.to_string());
    }
    builder
        .body(Body::from(serde_json::to_vec(body).expect("json body")))
        .expect("request builds")
}

pub(crate) fn get_request(uri: &str, actor: Option<ProfileId>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(actor) = actor {
        builder = builder.header(ACTOR_HEADER, actor.to_string());
    }
    builder.body(Body::empty()).expect("request builds")
}

pub(crate) async fn read_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("json body")
}
