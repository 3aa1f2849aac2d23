use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use curriculum_import::{
    config,
    embedding::{EmbeddingCache, embedding_client_from_config},
    extract::SourceFormat,
    import::{ImportPipeline, StepReport, UploadRequest},
    logging,
    model::{ImportHints, ImportId},
    parser::OllamaExtractionClient,
    store::MemoryStore,
};
use futures_util::{pin_mut, stream::StreamExt};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "curriculum-import",
    about = "Extract, embed, and cluster learning outcomes from curriculum documents"
)]
struct Cli {
    /// Grade hint passed to outcome extraction.
    #[arg(long)]
    grade: Option<String>,
    /// Subject hint passed to outcome extraction.
    #[arg(long)]
    subject: Option<String>,
    /// Confirm every import that reaches review.
    #[arg(long)]
    confirm: bool,
    /// Documents or directories to import.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    logging::init_tracing();
    let config = config::init_config().context("loading configuration")?;

    let extraction = Arc::new(OllamaExtractionClient::new(
        config.ollama_url.clone(),
        config.extraction_model.clone(),
    )?);
    let embedding = embedding_client_from_config(config)?;
    let cache = Arc::new(EmbeddingCache::new(config.embedding_cache_capacity));
    let pipeline = Arc::new(ImportPipeline::new(
        Arc::new(MemoryStore::new()),
        extraction,
        embedding,
        cache,
        config.pipeline_settings(),
    ));

    let files = collect_files(&cli.paths)?;
    if files.is_empty() {
        bail!("no PDF, DOC, DOCX, or TXT documents found");
    }

    let hints = ImportHints::new(cli.grade, cli.subject);
    let mut runs = Vec::with_capacity(files.len());
    for path in files {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let import = pipeline
            .upload(UploadRequest {
                file_name,
                mime_type: None,
                declared_size: Some(bytes.len() as u64),
                bytes,
                hints: hints.clone(),
            })
            .await
            .with_context(|| format!("uploading {}", path.display()))?;
        runs.push((path, import.id, tokio::spawn(drive(Arc::clone(&pipeline), import.id))));
    }

    let mut failed = 0;
    for (path, id, handle) in runs {
        let report = handle.await.context("import task panicked")??;
        if let Some(failure) = &report.failure {
            failed += 1;
            eprintln!("{}: {failure}", path.display());
            continue;
        }
        if cli.confirm {
            pipeline.confirm(id).await?;
        }
        let review = pipeline.get_import(id).await?;
        println!("{}", serde_json::to_string_pretty(&review)?);
    }

    tracing::info!(metrics = ?pipeline.metrics(), "Import run complete");
    if failed > 0 {
        bail!("{failed} import(s) failed");
    }
    Ok(())
}

/// Drive one import to rest, logging each stage as it commits.
async fn drive(
    pipeline: Arc<ImportPipeline>,
    id: ImportId,
) -> Result<StepReport, curriculum_import::import::ImportError> {
    let stream = pipeline.stages(id);
    pin_mut!(stream);
    let mut last = None;
    while let Some(report) = stream.next().await {
        let report = report?;
        tracing::info!(
            import_id = %id,
            stage = ?report.stage,
            status = %report.import.status,
            "Stage finished"
        );
        last = Some(report);
    }
    match last {
        Some(report) => Ok(report),
        None => pipeline.run(id).await,
    }
}

fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("{} does not exist", path.display());
        }
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", path.display()))?;
            if entry.file_type().is_file() && is_supported(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    Ok(files)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(SourceFormat::from_declared)
        .is_some()
}
