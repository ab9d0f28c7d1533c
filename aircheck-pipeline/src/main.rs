//! aircheck - radio broadcast fact-check pipeline
//!
//! One subcommand per pipeline stage plus the operator undo/redo
//! commands. Each stage invocation runs one worker loop against the
//! shared store; scale horizontally by running more processes.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use aircheck_common::config::PipelineConfig;
use aircheck_pipeline::clipper::FfmpegClipper;
use aircheck_pipeline::escalation::EscalationPolicy;
use aircheck_pipeline::inference::{GeminiClient, InferenceClient};
use aircheck_pipeline::kb::KnowledgeBase;
use aircheck_pipeline::stages::{
    AnalysisStage, ClippingStage, DetectionStage, EmbeddingStage, ReviewStage, reset_snippets,
    undo_clipping, undo_detection,
};
use aircheck_pipeline::storage::{LocalStorage, ObjectStorage};
use aircheck_pipeline::store::SqliteTaskStore;
use aircheck_pipeline::worker::{PollIntervals, RunSummary, StageWorker, WorkerOptions, run_worker};

#[derive(Parser)]
#[command(name = "aircheck", version, about = "Radio broadcast fact-check pipeline")]
struct Cli {
    /// Config file path (overrides AIRCHECK_CONFIG and the default location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by stage subcommands that support targeted runs.
#[derive(Args)]
struct StageArgs {
    /// Process exactly these items instead of claiming from the queue
    #[arg(long = "id")]
    ids: Vec<Uuid>,

    /// Stop after this many items
    #[arg(long)]
    limit: Option<u64>,

    /// Process at most one item, then exit
    #[arg(long)]
    once: bool,
}

#[derive(Args)]
struct BatchArgs {
    /// Stop after this many items
    #[arg(long)]
    limit: Option<u64>,

    /// Process at most one item, then exit
    #[arg(long)]
    once: bool,
}

#[derive(Args)]
struct IdArgs {
    #[arg(long = "id", required = true)]
    ids: Vec<Uuid>,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe audio files and flag claims (stage 1)
    Detect(StageArgs),
    /// Cut clips for flagged regions (stage 2)
    Clip(BatchArgs),
    /// Deep-analyze snippets (stage 3)
    Analyze {
        #[command(flatten)]
        stage: StageArgs,
        /// Send every result straight to Processed, bypassing review
        #[arg(long)]
        skip_review: bool,
    },
    /// Review high-confidence analyses (stage 4)
    Review(StageArgs),
    /// Embed processed snippets (stage 5)
    Embed(BatchArgs),
    /// Reset audio files to New and delete their detection output
    UndoDetect(IdArgs),
    /// Delete the snippets a stage-1 response produced and reset it
    UndoClip(IdArgs),
    /// Clear snippet analyses and reset them to New
    ResetSnippets(IdArgs),
    /// Re-run detection over an existing transcription
    RedoDetection(IdArgs),
    /// Regenerate a stage-1 response's transcription from its recording
    RegenTranscript(IdArgs),
}

impl StageArgs {
    fn worker_options(&self) -> WorkerOptions {
        worker_options(&self.ids, self.limit, self.once)
    }
}

impl BatchArgs {
    fn worker_options(&self) -> WorkerOptions {
        worker_options(&[], self.limit, self.once)
    }
}

fn worker_options(ids: &[Uuid], limit: Option<u64>, once: bool) -> WorkerOptions {
    WorkerOptions {
        ids: ids.to_vec(),
        limit: if once { Some(1) } else { limit },
        // --once also stops at an empty queue instead of polling.
        repeat: !once,
    }
}

/// Everything a stage needs, assembled once per invocation.
struct Pipeline {
    store: Arc<SqliteTaskStore>,
    storage: Arc<dyn ObjectStorage>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn build(config: PipelineConfig) -> Result<Self> {
        let store = Arc::new(SqliteTaskStore::connect(&config.database_path).await?);
        let storage: Arc<dyn ObjectStorage> =
            Arc::new(LocalStorage::new(config.storage_root.clone()));

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing current item rollback");
                signal_cancel.cancel();
            }
        });

        Ok(Self {
            store,
            storage,
            config,
            cancel,
        })
    }

    fn inference(&self) -> Result<Arc<dyn InferenceClient>> {
        self.config.require_api_key()?;
        let client = GeminiClient::new(
            Some(&self.config.api_base_url),
            self.config.api_key.clone(),
            Duration::from_secs(self.config.tuning.inference_timeout_secs),
        )?;
        Ok(Arc::new(client))
    }

    fn policy(&self) -> EscalationPolicy {
        EscalationPolicy::new(self.config.tuning.max_transient_retries)
    }

    fn intervals(&self) -> PollIntervals {
        PollIntervals {
            busy: Duration::from_secs(self.config.tuning.busy_poll_secs),
            idle: Duration::from_secs(self.config.tuning.idle_poll_secs),
        }
    }

    fn knowledge_base(&self, inference: Arc<dyn InferenceClient>) -> Arc<KnowledgeBase> {
        Arc::new(KnowledgeBase::new(
            self.store.clone(),
            inference,
            self.config.models.embedding.clone(),
            self.config.tuning.kb_min_confidence,
            self.config.tuning.kb_duplicate_threshold,
            self.config.tuning.kb_retrieval_threshold,
        ))
    }

    async fn run_stage<W: StageWorker>(&self, worker: &W, options: WorkerOptions) -> Result<()> {
        let summary = run_worker(worker, &options, self.intervals(), &self.cancel).await?;
        report(&summary);
        Ok(())
    }
}

fn report(summary: &RunSummary) {
    info!(
        processed = summary.processed,
        errored = summary.errored,
        missing = summary.missing,
        "Run complete"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aircheck=info,aircheck_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;
    info!(
        database = %config.database_path.display(),
        storage = %config.storage_root.display(),
        "Starting aircheck {}",
        env!("CARGO_PKG_VERSION")
    );

    let pipeline = Pipeline::build(config).await?;

    match cli.command {
        Command::Detect(args) => {
            let stage = DetectionStage::new(
                pipeline.store.clone(),
                pipeline.storage.clone(),
                pipeline.inference()?,
                pipeline.policy(),
                pipeline.config.models.clone(),
            );
            pipeline.run_stage(&stage, args.worker_options()).await?;
        }
        Command::Clip(args) => {
            let stage = ClippingStage::new(
                pipeline.store.clone(),
                pipeline.storage.clone(),
                Arc::new(FfmpegClipper),
                pipeline.config.tuning.clip_context_before_secs,
                pipeline.config.tuning.clip_context_after_secs,
            );
            pipeline.run_stage(&stage, args.worker_options()).await?;
        }
        Command::Analyze { stage: args, skip_review } => {
            let stage = AnalysisStage::new(
                pipeline.store.clone(),
                pipeline.storage.clone(),
                pipeline.inference()?,
                pipeline.policy(),
                pipeline.config.models.clone(),
                pipeline.config.tuning.review_confidence_threshold,
                skip_review,
            );
            pipeline.run_stage(&stage, args.worker_options()).await?;
        }
        Command::Review(args) => {
            let inference = pipeline.inference()?;
            let kb = pipeline.knowledge_base(inference.clone());
            let stage = ReviewStage::new(
                pipeline.store.clone(),
                inference,
                kb,
                pipeline.policy(),
                pipeline.config.models.clone(),
            );
            pipeline.run_stage(&stage, args.worker_options()).await?;
        }
        Command::Embed(args) => {
            let stage = EmbeddingStage::new(
                pipeline.store.clone(),
                pipeline.inference()?,
                pipeline.config.models.embedding.clone(),
            );
            pipeline.run_stage(&stage, args.worker_options()).await?;
        }
        Command::UndoDetect(args) => {
            let reset = undo_detection(pipeline.store.as_ref(), &args.ids).await?;
            info!(reset, "Undo complete");
        }
        Command::UndoClip(args) => {
            let reset = undo_clipping(
                pipeline.store.as_ref(),
                pipeline.storage.as_ref(),
                &args.ids,
            )
            .await?;
            info!(reset, "Undo complete");
        }
        Command::ResetSnippets(args) => {
            let reset = reset_snippets(pipeline.store.as_ref(), &args.ids).await?;
            info!(reset, "Reset complete");
        }
        Command::RedoDetection(args) => {
            let stage = DetectionStage::new(
                pipeline.store.clone(),
                pipeline.storage.clone(),
                pipeline.inference()?,
                pipeline.policy(),
                pipeline.config.models.clone(),
            );
            let redone = stage.redo_detection(&args.ids).await?;
            info!(redone, "Redo complete");
        }
        Command::RegenTranscript(args) => {
            let stage = DetectionStage::new(
                pipeline.store.clone(),
                pipeline.storage.clone(),
                pipeline.inference()?,
                pipeline.policy(),
                pipeline.config.models.clone(),
            );
            let regenerated = stage.regenerate_transcript(&args.ids).await?;
            info!(regenerated, "Regeneration complete");
        }
    }

    Ok(())
}
