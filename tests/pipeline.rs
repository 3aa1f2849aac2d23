use async_trait::async_trait;
use curriculum_import::cluster::{ClusterSettings, SingletonPolicy};
use curriculum_import::config::PipelineSettings;
use curriculum_import::embedding::{
    EmbeddingCache, EmbeddingClient, EmbeddingClientError, HashingEmbeddingClient,
};
use curriculum_import::extract::ExtractionError;
use curriculum_import::import::{ImportError, ImportPipeline, StageFailure, UploadRequest};
use curriculum_import::model::{Checkpoint, ImportHints, ImportId, ImportStatus, PipelineStage};
use curriculum_import::parser::{
    ExtractionClient, ExtractionClientError, ExtractionRequest, ParseError,
};
use curriculum_import::retry::RetryPolicy;
use curriculum_import::store::{ImportStore, MemoryStore};
use futures_util::{pin_mut, stream::StreamExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Extraction fake returning one canned response, optionally waiting on a gate first.
struct CannedExtraction {
    response: String,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl CannedExtraction {
    fn new(response: String) -> Arc<Self> {
        Arc::new(Self {
            response,
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    fn gated(response: String, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            response,
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionClient for CannedExtraction {
    fn model(&self) -> &str {
        "canned-extractor"
    }

    async fn extract(
        &self,
        _request: &ExtractionRequest,
    ) -> Result<String, ExtractionClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.response.clone())
    }
}

/// Embedding fake with fixed vectors per description and a set of descriptions that fail.
struct TableEmbedding {
    vectors: HashMap<String, Vec<f32>>,
    failing: HashSet<String>,
    fallback: HashingEmbeddingClient,
    calls: Mutex<Vec<String>>,
}

impl TableEmbedding {
    fn new(vectors: HashMap<String, Vec<f32>>, failing: HashSet<String>) -> Arc<Self> {
        Arc::new(Self {
            vectors,
            failing,
            fallback: HashingEmbeddingClient::new("table", 10),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn hashing() -> Arc<Self> {
        Self::new(HashMap::new(), HashSet::new())
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl EmbeddingClient for TableEmbedding {
    fn model(&self) -> &str {
        "table"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        self.calls.lock().unwrap().push(text.to_string());
        if self.failing.contains(text) {
            return Err(EmbeddingClientError::Rejected(format!("cannot embed {text}")));
        }
        match self.vectors.get(text) {
            Some(vector) => Ok(vector.clone()),
            None => self.fallback.embed(text).await,
        }
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        retry: RetryPolicy {
            max_attempts: 2,
            timeout: Duration::from_secs(5),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..PipelineSettings::default()
    }
}

fn build(
    extraction: Arc<dyn ExtractionClient>,
    embedding: Arc<dyn EmbeddingClient>,
    settings: PipelineSettings,
) -> (Arc<ImportPipeline>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pipeline = ImportPipeline::new(
        store.clone(),
        extraction,
        embedding,
        Arc::new(EmbeddingCache::new(256)),
        settings,
    );
    (Arc::new(pipeline), store)
}

fn outcomes_json(outcomes: &[(&str, &str)]) -> String {
    let records: Vec<_> = outcomes
        .iter()
        .map(|(code, description)| {
            json!({
                "subject": "Science",
                "grade": "5",
                "code": code,
                "description": description,
                "domain": "Life Systems",
            })
        })
        .collect();
    json!({ "outcomes": records }).to_string()
}

fn five_outcomes() -> Vec<(&'static str, &'static str)> {
    vec![
        ("B1.1", "assess the impacts of human activities on habitats"),
        ("B1.2", "evaluate the effectiveness of conservation programs"),
        ("B2.1", "analyse food chains in local ecosystems"),
        ("B2.2", "describe how organisms depend on their habitat"),
        ("B2.3", "explain how energy flows through an ecosystem"),
    ]
}

const TWO_PAGE_DOCUMENT: &str = "Grade 5 Science\nStrand B: Life Systems\n\n\
B1.1 assess the impacts of human activities on habitats\n\
B1.2 evaluate the effectiveness of conservation programs\n\u{000C}\
B2.1 analyse food chains in local ecosystems\n\
B2.2 describe how organisms depend on their habitat\n\
B2.3 explain how energy flows through an ecosystem\n";

fn upload(file_name: &str, bytes: &[u8]) -> UploadRequest {
    UploadRequest {
        file_name: file_name.to_string(),
        mime_type: None,
        declared_size: Some(bytes.len() as u64),
        bytes: bytes.to_vec(),
        hints: ImportHints::new(Some("5".into()), Some("Science".into())),
    }
}

async fn wait_for_calls(extraction: &CannedExtraction, calls: usize) {
    while extraction.calls() < calls {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn plain_text_document_yields_every_outcome() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, _) = build(extraction.clone(), TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    assert_eq!(import.status, ImportStatus::Uploading);

    let extracted = pipeline.advance(import.id).await.expect("extract");
    assert_eq!(extracted.stage, Some(PipelineStage::Extraction));
    assert_eq!(extracted.import.status, ImportStatus::Processing);
    assert!(
        extracted
            .import
            .raw_text
            .as_deref()
            .is_some_and(|text| text.contains("B2.3 explain"))
    );

    let parsed = pipeline.advance(import.id).await.expect("parse");
    assert_eq!(parsed.import.checkpoint, Checkpoint::Parsed);
    assert_eq!(parsed.import.total_outcomes, 5);
    assert_eq!(parsed.import.processed_outcomes, 0);

    let finished = pipeline.run(import.id).await.expect("run");
    assert_eq!(finished.import.status, ImportStatus::ReadyForReview);
    assert_eq!(finished.import.processed_outcomes, 5);
    assert!(finished.import.processed_at.is_some());

    let review = pipeline.get_import(import.id).await.expect("review");
    assert_eq!(review.outcomes.len(), 5);
    assert_eq!(extraction.calls(), 1);
}

#[tokio::test]
async fn unsupported_format_fails_without_parsing() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, _) = build(extraction.clone(), TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("syllabus.xyz", b"some bytes"))
        .await
        .expect("upload");
    assert_eq!(import.source_format, "xyz");

    let report = pipeline.run(import.id).await.expect("run");

    assert_eq!(report.import.status, ImportStatus::Failed);
    assert!(matches!(
        report.failure,
        Some(StageFailure::Extraction(ExtractionError::UnsupportedFormat(_)))
    ));
    assert_eq!(extraction.calls(), 0);
    let entry = &report.import.error_log[0];
    assert_eq!(entry.stage, PipelineStage::Extraction);
    assert!(entry.fatal);
    assert!(report.import.completed_at.is_some());
}

fn scenario_c_vectors() -> (Vec<(String, String)>, HashMap<String, Vec<f32>>) {
    let mut outcomes = Vec::new();
    let mut vectors = HashMap::new();
    for i in 0..6 {
        let description = format!("interpret data from a simple experiment, variant {i}");
        let mut vector = vec![0.0; 10];
        vector[0] = 1.0;
        vector[1] = 0.05 * i as f32;
        vectors.insert(description.clone(), vector);
        outcomes.push((format!("D{i}"), description));
    }
    for i in 0..4 {
        let description = format!("unrelated expectation {i}");
        let mut vector = vec![0.0; 10];
        vector[2 + i] = 1.0;
        vectors.insert(description.clone(), vector);
        outcomes.push((format!("U{i}"), description));
    }
    (outcomes, vectors)
}

async fn cluster_scenario(singletons: SingletonPolicy) -> curriculum_import::import::ImportReview {
    let (outcomes, vectors) = scenario_c_vectors();
    let borrowed: Vec<(&str, &str)> = outcomes
        .iter()
        .map(|(code, description)| (code.as_str(), description.as_str()))
        .collect();
    let extraction = CannedExtraction::new(outcomes_json(&borrowed));
    let settings = PipelineSettings {
        cluster: ClusterSettings {
            similarity_threshold: 0.8,
            singletons,
        },
        ..settings()
    };
    let (pipeline, _) = build(
        extraction,
        TableEmbedding::new(vectors, HashSet::new()),
        settings,
    );
    let import = pipeline
        .upload(upload("cluster.txt", b"ten outcomes"))
        .await
        .expect("upload");
    pipeline.run(import.id).await.expect("run");
    pipeline.get_import(import.id).await.expect("review")
}

#[tokio::test]
async fn near_duplicates_form_one_cluster() {
    let review = cluster_scenario(SingletonPolicy::Exclude).await;

    assert_eq!(review.clusters.len(), 1);
    assert_eq!(review.clusters[0].outcome_ids.len(), 6);
    assert!(review.clusters[0].confidence > 0.8);
    assert_eq!(review.clusters[0].suggested_label.as_deref(), Some("Life Systems"));
    assert_eq!(review.unclustered.len(), 4);
    assert!(!review.degraded);
}

#[tokio::test]
async fn singleton_policy_reports_zero_confidence_clusters() {
    let review = cluster_scenario(SingletonPolicy::Include).await;

    assert_eq!(review.clusters.len(), 5);
    assert!(review.unclustered.is_empty());
    let singletons: Vec<_> = review
        .clusters
        .iter()
        .filter(|cluster| cluster.outcome_ids.len() == 1)
        .collect();
    assert_eq!(singletons.len(), 4);
    assert!(singletons.iter().all(|cluster| cluster.confidence == 0.0));
}

#[tokio::test]
async fn clustering_is_repeatable() {
    let first = cluster_scenario(SingletonPolicy::Include).await;
    let second = cluster_scenario(SingletonPolicy::Include).await;

    let codes = |review: &curriculum_import::import::ImportReview| -> Vec<Vec<String>> {
        let by_id: HashMap<_, _> = review
            .outcomes
            .iter()
            .map(|outcome| (outcome.id, outcome.code.clone()))
            .collect();
        review
            .clusters
            .iter()
            .map(|cluster| cluster.outcome_ids.iter().map(|id| by_id[id].clone()).collect())
            .collect()
    };
    assert_eq!(codes(&first), codes(&second));
    let confidences = |review: &curriculum_import::import::ImportReview| -> Vec<f32> {
        review.clusters.iter().map(|cluster| cluster.confidence).collect()
    };
    assert_eq!(confidences(&first), confidences(&second));
}

#[tokio::test]
async fn confirming_while_processing_is_rejected() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, store) = build(extraction, TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    pipeline.advance(import.id).await.expect("extract");

    let error = pipeline.confirm(import.id).await.unwrap_err();

    assert!(matches!(
        error,
        ImportError::InvalidStateTransition(transition)
            if transition.from == ImportStatus::Processing && transition.to == ImportStatus::Confirmed
    ));
    let stored = store.get_import(import.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, ImportStatus::Processing);
}

#[tokio::test]
async fn concurrent_advance_is_rejected() {
    let gate = Arc::new(Notify::new());
    let extraction = CannedExtraction::gated(outcomes_json(&five_outcomes()), gate.clone());
    let (pipeline, _) = build(extraction.clone(), TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    pipeline.advance(import.id).await.expect("extract");

    let first = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.advance(import.id).await })
    };
    wait_for_calls(&extraction, 1).await;
    assert!(pipeline.is_running(import.id));

    let second = pipeline.advance(import.id).await;
    assert!(matches!(second, Err(ImportError::AlreadyRunning(id)) if id == import.id));

    gate.notify_one();
    let report = first.await.expect("join").expect("first advance");
    assert_eq!(report.stage, Some(PipelineStage::Parsing));
    assert_eq!(extraction.calls(), 1);
}

#[tokio::test]
async fn counters_never_exceed_total() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, _) = build(extraction, TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");

    let stream = pipeline.stages(import.id);
    pin_mut!(stream);
    let mut stages = Vec::new();
    while let Some(report) = stream.next().await {
        let report = report.expect("stage");
        assert!(report.import.processed_outcomes <= report.import.total_outcomes);
        stages.push(report.stage.expect("stage ran"));
    }

    assert_eq!(
        stages,
        vec![
            PipelineStage::Extraction,
            PipelineStage::Parsing,
            PipelineStage::Embedding,
            PipelineStage::Clustering
        ]
    );
}

#[tokio::test]
async fn cancelling_idle_import_fails_it() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, _) = build(extraction.clone(), TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");

    let cancelled = pipeline.cancel(import.id).await.expect("cancel");

    assert_eq!(cancelled.status, ImportStatus::Failed);
    assert_eq!(cancelled.error_log.len(), 1);
    assert_eq!(cancelled.error_log[0].stage, PipelineStage::Extraction);
    let rerun = pipeline.run(import.id).await.expect("run");
    assert!(!rerun.ran());
    assert_eq!(extraction.calls(), 0);
    assert!(matches!(
        pipeline.cancel(import.id).await,
        Err(ImportError::InvalidStateTransition(_))
    ));
}

#[tokio::test]
async fn cancellation_lands_at_next_stage_boundary() {
    let gate = Arc::new(Notify::new());
    let extraction = CannedExtraction::gated(outcomes_json(&five_outcomes()), gate.clone());
    let embedding = TableEmbedding::hashing();
    let (pipeline, _) = build(extraction.clone(), embedding.clone(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");

    let run = pipeline.spawn(import.id);
    wait_for_calls(&extraction, 1).await;
    let cancel = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.cancel(import.id).await })
    };
    while !pipeline
        .get_import(import.id)
        .await
        .expect("review")
        .import
        .cancel_requested
    {
        tokio::task::yield_now().await;
    }
    gate.notify_one();

    let report = run.await.expect("join").expect("run");
    assert!(matches!(report.failure, Some(StageFailure::Cancelled)));
    assert_eq!(report.import.status, ImportStatus::Failed);
    assert_eq!(report.import.checkpoint, Checkpoint::Parsed);
    assert_eq!(embedding.calls(), 0);

    let cancelled = cancel.await.expect("join").expect("cancel");
    assert_eq!(cancelled.status, ImportStatus::Failed);
}

#[tokio::test]
async fn run_resumes_from_last_checkpoint() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, _) = build(extraction.clone(), TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    pipeline.advance(import.id).await.expect("extract");
    pipeline.advance(import.id).await.expect("parse");

    let report = pipeline.run(import.id).await.expect("resume");

    assert_eq!(report.stage, Some(PipelineStage::Clustering));
    assert_eq!(report.import.status, ImportStatus::ReadyForReview);
    assert_eq!(extraction.calls(), 1);
}

#[tokio::test]
async fn repeated_codes_supersede_and_reuse_vectors() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let embedding = TableEmbedding::hashing();
    let (pipeline, store) = build(extraction, embedding.clone(), settings());

    let first = pipeline
        .upload(upload("first.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    pipeline.run(first.id).await.expect("first run");
    let before = store
        .find_outcome_by_code("B2.1")
        .await
        .expect("find")
        .expect("exists");

    let second = pipeline
        .upload(upload("second.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    pipeline.run(second.id).await.expect("second run");
    let after = store
        .find_outcome_by_code("b2.1")
        .await
        .expect("find")
        .expect("exists");

    assert_eq!(before.id, after.id);
    assert_eq!(after.import_id, Some(second.id));
    assert_eq!(embedding.calls(), 5);
    let metrics = pipeline.metrics();
    assert_eq!(metrics.embeddings_generated, 5);
    assert_eq!(metrics.embedding_cache_hits, 5);
    assert_eq!(metrics.imports_ready, 2);
}

#[tokio::test]
async fn embedding_failures_are_recorded_and_degrade_clustering() {
    let outcomes = five_outcomes();
    let failing: HashSet<String> = outcomes[..3]
        .iter()
        .map(|(_, description)| description.to_string())
        .collect();
    let extraction = CannedExtraction::new(outcomes_json(&outcomes));
    let (pipeline, _) = build(
        extraction,
        TableEmbedding::new(HashMap::new(), failing),
        settings(),
    );
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");

    let report = pipeline.run(import.id).await.expect("run");

    assert_eq!(report.import.status, ImportStatus::ReadyForReview);
    assert_eq!(report.import.processed_outcomes, 5);
    assert!(report.import.clustering_degraded);
    let warnings: Vec<_> = report
        .import
        .error_log
        .iter()
        .filter(|entry| !entry.fatal)
        .collect();
    assert_eq!(
        warnings
            .iter()
            .filter(|entry| entry.stage == PipelineStage::Embedding)
            .count(),
        3
    );
    assert!(warnings.iter().any(|entry| entry.message.starts_with("ClusteringDegraded")));
    let review = pipeline.get_import(import.id).await.expect("review");
    assert!(review.degraded);
    assert_eq!(pipeline.metrics().embedding_failures, 3);
}

#[tokio::test]
async fn parse_failure_records_last_response() {
    let extraction = CannedExtraction::new("I could not find any outcomes.".into());
    let (pipeline, _) = build(extraction.clone(), TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");

    let report = pipeline.run(import.id).await.expect("run");

    assert_eq!(report.import.status, ImportStatus::Failed);
    assert!(matches!(
        report.failure,
        Some(StageFailure::Parse(ParseError::ParseFailed { attempts: 2, .. }))
    ));
    assert_eq!(extraction.calls(), 2);
    let entry = report.import.fatal_errors().next().expect("fatal entry");
    assert_eq!(entry.stage, PipelineStage::Parsing);
    assert!(entry.message.contains("I could not find any outcomes."));
}

#[tokio::test]
async fn confirm_and_resubmit_follow_the_lifecycle() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, store) = build(extraction, TableEmbedding::hashing(), settings());
    let ready = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    pipeline.run(ready.id).await.expect("run");

    assert!(matches!(
        pipeline.resubmit(ready.id).await,
        Err(ImportError::InvalidStateTransition(_))
    ));
    let confirmed = pipeline.confirm(ready.id).await.expect("confirm");
    assert_eq!(confirmed.status, ImportStatus::Confirmed);
    assert!(confirmed.completed_at.is_some());
    assert!(matches!(
        pipeline.confirm(ready.id).await,
        Err(ImportError::InvalidStateTransition(_))
    ));
    assert!(matches!(
        pipeline.cancel(ready.id).await,
        Err(ImportError::InvalidStateTransition(_))
    ));
    let stored = store.get_import(ready.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, ImportStatus::Confirmed);
    assert!(!stored.cancel_requested);

    let broken = pipeline
        .upload(upload("notes.xyz", b"bytes kept for retry"))
        .await
        .expect("upload");
    pipeline.run(broken.id).await.expect("run");
    let retried = pipeline.resubmit(broken.id).await.expect("resubmit");

    assert_ne!(retried.id, broken.id);
    assert_eq!(retried.status, ImportStatus::Uploading);
    assert_eq!(retried.file_name, "notes.xyz");
    assert_eq!(
        store.document(retried.id).await.expect("doc").as_deref(),
        Some(&b"bytes kept for retry"[..])
    );
    assert_eq!(pipeline.metrics().imports_confirmed, 1);
}

#[tokio::test]
async fn confirm_with_pending_cancellation_fails_the_import() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let (pipeline, store) = build(extraction, TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");
    pipeline.run(import.id).await.expect("run");
    store
        .request_cancellation(import.id)
        .await
        .expect("flag cancellation");

    let error = pipeline.confirm(import.id).await.unwrap_err();

    assert!(matches!(
        error,
        ImportError::InvalidStateTransition(transition)
            if transition.from == ImportStatus::Failed && transition.to == ImportStatus::Confirmed
    ));
    let stored = store.get_import(import.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, ImportStatus::Failed);
    assert!(stored.completed_at.is_some());
    let entry = stored.fatal_errors().next().expect("fatal entry");
    assert_eq!(entry.stage, PipelineStage::Review);
    assert_eq!(entry.message, "Import cancelled");
    assert_eq!(pipeline.metrics().imports_confirmed, 0);
}

#[tokio::test]
async fn delete_waits_for_no_active_run() {
    let gate = Arc::new(Notify::new());
    let extraction = CannedExtraction::gated(outcomes_json(&five_outcomes()), gate.clone());
    let (pipeline, store) = build(extraction.clone(), TableEmbedding::hashing(), settings());
    let import = pipeline
        .upload(upload("science.txt", TWO_PAGE_DOCUMENT.as_bytes()))
        .await
        .expect("upload");

    let run = pipeline.spawn(import.id);
    wait_for_calls(&extraction, 1).await;
    assert!(matches!(
        pipeline.delete(import.id).await,
        Err(ImportError::AlreadyRunning(_))
    ));
    gate.notify_one();
    run.await.expect("join").expect("run");

    let outcome = store
        .find_outcome_by_code("B1.1")
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(outcome.import_id, Some(import.id));
    pipeline.delete(import.id).await.expect("delete");
    assert!(matches!(
        pipeline.get_import(import.id).await,
        Err(ImportError::NotFound(_))
    ));
    let kept = store
        .find_outcome_by_code("B1.1")
        .await
        .expect("find")
        .expect("outcome survives");
    assert_eq!(kept.id, outcome.id);
    assert_eq!(kept.import_id, None);
    assert!(matches!(
        pipeline.delete(ImportId::new()).await,
        Err(ImportError::NotFound(_))
    ));
}

#[tokio::test]
async fn uploads_are_validated_at_intake() {
    let extraction = CannedExtraction::new(outcomes_json(&five_outcomes()));
    let settings = PipelineSettings {
        max_upload_bytes: 16,
        ..settings()
    };
    let (pipeline, _) = build(extraction, TableEmbedding::hashing(), settings);

    let empty = pipeline.upload(upload("empty.txt", b"")).await;
    assert!(matches!(empty, Err(ImportError::InvalidUpload(_))));

    let large = pipeline
        .upload(upload("large.txt", b"this is well over sixteen bytes"))
        .await;
    assert!(matches!(large, Err(ImportError::InvalidUpload(_))));

    let mut mismatched = upload("small.txt", b"tiny");
    mismatched.declared_size = Some(99);
    assert!(matches!(
        pipeline.upload(mismatched).await,
        Err(ImportError::InvalidUpload(_))
    ));

    let mut by_mime = upload("noextension", b"tiny");
    by_mime.mime_type = Some("text/plain".into());
    let import = pipeline.upload(by_mime).await.expect("upload");
    assert_eq!(import.source_format, "text/plain");
    assert_eq!(pipeline.metrics().imports_created, 1);
}

#[tokio::test]
async fn unknown_import_is_not_found() {
    let (pipeline, _) = build(
        CannedExtraction::new(outcomes_json(&five_outcomes())),
        TableEmbedding::hashing(),
        settings(),
    );
    let missing = ImportId::new();
    assert!(matches!(
        pipeline.advance(missing).await,
        Err(ImportError::NotFound(id)) if id == missing
    ));
    assert!(matches!(
        pipeline.confirm(missing).await,
        Err(ImportError::NotFound(_))
    ));
}
