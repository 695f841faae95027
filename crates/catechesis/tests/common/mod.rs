#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use catechesis::access::{NewProfile, Role};
use catechesis::config::AppConfig;
use catechesis::extraction::{
    DocumentKind, ExtractionService, RecognitionEngine, RecognitionFailure, RecognizedPage,
};
use catechesis::ids::{DocumentId, EnrollmentId, ProfileId};
use catechesis::objects::FsObjectStore;
use catechesis::stores::StoreSet;
use catechesis::workflows::documents::{ConfirmRequest, DocumentView};
use catechesis::workflows::enrollment::NewEnrollment;
use catechesis::workflows::{GuardianNotice, GuardianNotifier, NoticeKind, NotifyError, Pipeline};
use chrono::NaiveDate;
use tempfile::TempDir;

pub const TOTAL_DUE: i64 = 15_000;

/// Answers every document kind with the same clean scan.
pub struct FixtureEngine;

#[async_trait]
impl RecognitionEngine for FixtureEngine {
    async fn recognize(
        &self,
        kind: DocumentKind,
        _content_type: &mime::Mime,
        _bytes: &[u8],
    ) -> Result<RecognizedPage, RecognitionFailure> {
        let lines: &[&str] = match kind {
            DocumentKind::BirthRecord => &[
                "EXTRAIT D'ACTE DE NAISSANCE",
                "Nom : DIALLO",
                "Prénoms : Amadou",
                "Né le 12/03/2015",
                "Lieu de naissance : Thiès",
            ],
            DocumentKind::BaptismRecord => &[
                "CERTIFICAT DE BAPTÊME",
                "Baptisé le 20/04/2015",
                "Paroisse : Saint Joseph de Médina",
                "Célébrant : Abbé Ndiaye",
            ],
            DocumentKind::TransferAttestation => &["ATTESTATION DE TRANSFERT"],
            DocumentKind::PaymentProof => {
                return Ok(RecognizedPage::from_lines(
                    [
                        "Wave",
                        "Vous avez envoyé 15 000 F à Paroisse Ste Thérèse",
                        "ID de transaction : tx8f3k29",
                        "Date : 02/10/2025 14h32",
                    ],
                    0.9,
                )
                .with_colour([29, 196, 255]))
            }
        };
        Ok(RecognizedPage::from_lines(lines.iter().copied(), 0.92))
    }
}

#[derive(Default)]
pub struct Outbox {
    sent: Mutex<Vec<GuardianNotice>>,
}

impl Outbox {
    pub fn of_kind(&self, kind: NoticeKind) -> Vec<GuardianNotice> {
        self.sent
            .lock()
            .expect("outbox poisoned")
            .iter()
            .filter(|notice| notice.kind == kind)
            .cloned()
            .collect()
    }
}

impl GuardianNotifier for Outbox {
    fn notify(&self, notice: GuardianNotice) -> Result<(), NotifyError> {
        self.sent.lock().expect("outbox poisoned").push(notice);
        Ok(())
    }
}

pub struct Parish {
    pub dir: TempDir,
    pub config: AppConfig,
    pub pipeline: Arc<Pipeline<FsObjectStore, Outbox>>,
    pub outbox: Arc<Outbox>,
    pub admin: ProfileId,
    pub treasurer: ProfileId,
    pub front_desk: ProfileId,
}

impl Parish {
    pub async fn open() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = AppConfig::in_dir(dir.path().join("data"));
        let stores = StoreSet::open(&config.storage).await.expect("stores open");
        let outbox = Arc::new(Outbox::default());
        let objects = Arc::new(FsObjectStore::new(&config.objects));
        let extraction = ExtractionService::new(Arc::new(FixtureEngine), &config.extraction);
        let pipeline = Pipeline::new(stores, &config, objects, extraction, outbox.clone());

        let admin = pipeline
            .profiles
            .bootstrap_administrator("Père Antoine")
            .await
            .expect("administrator")
            .id;
        let mut parish = Self {
            dir,
            config,
            pipeline: Arc::new(pipeline),
            outbox,
            admin,
            treasurer: admin,
            front_desk: admin,
        };
        parish.treasurer = parish.profile("Trésorier", Role::Treasurer).await;
        parish.front_desk = parish.profile("Secrétariat", Role::FrontDesk).await;
        parish
    }

    pub async fn profile(&self, name: &str, role: Role) -> ProfileId {
        self.pipeline
            .profiles
            .create(
                self.admin,
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
}

pub fn child(first_name: &str, year: i32) -> NewEnrollment {
    NewEnrollment {
        guardian_id: None,
        year,
        last_name: "Diallo".to_string(),
        first_name: first_name.to_string(),
        birth_date: NaiveDate::from_ymd_opt(2015, 3, 12).expect("valid date"),
        birth_place: None,
        level: "Première communion".to_string(),
        total_due: TOTAL_DUE,
        allow_homonym: false,
    }
}

pub fn fields(pairs: &[(&str, &str)]) -> ConfirmRequest {
    ConfirmRequest {
        fields: pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

pub const PDF_BYTES: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n%%EOF";

/// Upload a scan and wait for its extraction to settle.
pub async fn upload(
    pipeline: &Pipeline<FsObjectStore, Outbox>,
    actor: ProfileId,
    enrollment: EnrollmentId,
    kind: DocumentKind,
) -> DocumentView {
    let receipt = pipeline
        .documents
        .upload(actor, enrollment, kind, PDF_BYTES)
        .await
        .expect("upload accepted");
    settled(pipeline, actor, receipt.document_id).await
}

pub async fn settled(
    pipeline: &Pipeline<FsObjectStore, Outbox>,
    actor: ProfileId,
    document: DocumentId,
) -> DocumentView {
    for _ in 0..300 {
        let view = pipeline
            .documents
            .get_extraction(actor, document)
            .await
            .expect("document readable");
        if view.document.extraction_status.is_settled() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("extraction of {document} never settled");
}

/// Confirm a birth record and a baptism record for `first_name`.
pub async fn complete_documents(
    pipeline: &Pipeline<FsObjectStore, Outbox>,
    actor: ProfileId,
    enrollment: EnrollmentId,
    first_name: &str,
) {
    let birth = upload(pipeline, actor, enrollment, DocumentKind::BirthRecord).await;
    pipeline
        .documents
        .confirm(
            actor,
            birth.document.id,
            fields(&[
                ("last_name", "DIALLO"),
                ("given_names", first_name),
                ("birth_date", "2015-03-12"),
            ]),
        )
        .await
        .expect("birth record confirmed");

    let baptism = upload(pipeline, actor, enrollment, DocumentKind::BaptismRecord).await;
    pipeline
        .documents
        .confirm(
            actor,
            baptism.document.id,
            fields(&[
                ("baptism_date", "20/04/2015"),
                ("parish", "Saint Joseph de Médina"),
                ("officiant", "Abbé Ndiaye"),
            ]),
        )
        .await
        .expect("baptism record confirmed");
}
