//! GovSynth - synthetic agent-governance evaluation pipeline
//!
//! A CLI tool that drives an LLM through three stages per run (scenario,
//! governance trace, judge evaluation) with bounded concurrency and
//! retries, then aggregates the judgements into corpus statistics.
//!
//! Exit codes:
//!   0 - Success (every item succeeded or was skipped)
//!   1 - Fatal error (config, template, store, API key, etc.)
//!   2 - At least one item failed; re-run with --runs <ids> --overwrite

mod analysis;
mod cli;
mod config;
mod llm;
mod models;
mod pipeline;
mod prompt;
mod report;
mod store;
mod validate;

use anyhow::{bail, Context, Result};
use cli::{Args, Command, OutputFormat, StatsArgs};
use config::{Config, CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use llm::{AuditSink, Invoker, ModelClient};
use models::{ArtifactKind, BatchStats, CorpusSummary, WorkItem};
use pipeline::StageContext;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use store::RunStore;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Audit log file name at the store root.
const AUDIT_FILE: &str = "audit.jsonl";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig(ref init) = args.command {
        return handle_init_config(init.force);
    }

    // Initialize logging
    init_logging(&args);

    info!("GovSynth v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .govsynth.toml.
fn handle_init_config(force: bool) -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() && !force {
        eprintln!(
            "⚠️  {} already exists. Pass --force to overwrite it or edit it manually.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the model, classes, prompts, and concurrency.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
///
/// `RUST_LOG` takes precedence over `--verbose`/`--quiet` when set.
fn init_logging(args: &Args) {
    let level = args.log_level().to_string().to_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,govsynth={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: failed to set tracing subscriber: {}", e);
    }
}

/// Dispatch a command. Returns the process exit code (0 or 2).
async fn run(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;

    let store = open_store(&config)?;

    let exit_code = match &args.command {
        Command::Scenario(stage) => {
            let pipeline = Pipeline::new(config, store, args.quiet)?;
            let template = pipeline.load_template(ArtifactKind::Scenario)?;
            let stats = match stage.runs.as_deref() {
                Some(runs) => {
                    let items = pipeline.pending_items(ArtifactKind::Scenario, Some(runs))?;
                    pipeline
                        .run_stage(ArtifactKind::Scenario, template, items, stage.overwrite)
                        .await?
                }
                None => pipeline.run_scenarios(template).await?,
            };
            exit_code_for(&[stats])
        }
        Command::Governance(stage) => {
            let pipeline = Pipeline::new(config, store, args.quiet)?;
            let template = pipeline.load_template(ArtifactKind::Governance)?;
            let items = pipeline.pending_items(ArtifactKind::Governance, stage.runs.as_deref())?;
            let stats = pipeline
                .run_stage(ArtifactKind::Governance, template, items, stage.overwrite)
                .await?;
            exit_code_for(&[stats])
        }
        Command::Evaluate(stage) => {
            let pipeline = Pipeline::new(config, store, args.quiet)?;
            let template = pipeline.load_template(ArtifactKind::Evaluation)?;
            let items = pipeline.pending_items(ArtifactKind::Evaluation, stage.runs.as_deref())?;
            let stats = pipeline
                .run_stage(ArtifactKind::Evaluation, template, items, stage.overwrite)
                .await?;
            summarize(&pipeline.store)?;
            exit_code_for(&[stats])
        }
        Command::Run(_) => {
            let pipeline = Pipeline::new(config, store, args.quiet)?;

            // Fail on a broken template before any run is allocated.
            let scenario = pipeline.load_template(ArtifactKind::Scenario)?;
            let governance = pipeline.load_template(ArtifactKind::Governance)?;
            let evaluation = pipeline.load_template(ArtifactKind::Evaluation)?;

            let mut all = vec![pipeline.run_scenarios(scenario).await?];

            let items = pipeline.pending_items(ArtifactKind::Governance, None)?;
            all.push(
                pipeline
                    .run_stage(ArtifactKind::Governance, governance, items, false)
                    .await?,
            );

            let items = pipeline.pending_items(ArtifactKind::Evaluation, None)?;
            all.push(
                pipeline
                    .run_stage(ArtifactKind::Evaluation, evaluation, items, false)
                    .await?,
            );

            summarize(&pipeline.store)?;
            exit_code_for(&all)
        }
        Command::Summarize => {
            summarize(&store)?;
            0
        }
        Command::Stats(stats) => {
            print_stats(&store, stats)?;
            0
        }
        Command::InitConfig(init) => {
            handle_init_config(init.force)?;
            0
        }
    };

    println!("\n⏱️  Finished in {:.1}s", start_time.elapsed().as_secs_f64());
    Ok(exit_code)
}

fn exit_code_for(stats: &[BatchStats]) -> i32 {
    if stats.iter().any(|s| s.failures() > 0) {
        2
    } else {
        0
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default()? {
        Some(config) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        None => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<RunStore>> {
    let store = RunStore::open(&config.general.root).with_context(|| {
        format!(
            "Data root {} is not a writable directory",
            config.general.root.display()
        )
    })?;
    Ok(Arc::new(store))
}

/// Aggregate the corpus and persist `evaluation_summary.json`.
fn summarize(store: &RunStore) -> Result<CorpusSummary> {
    println!("\n📝 Aggregating evaluations...");

    let summary = analysis::aggregate(store).context("Failed to read runs")?;
    let path = store.write_summary(&summary).context("Failed to write summary")?;

    println!("\n📊 Corpus Summary:");
    for line in analysis::generate_summary_text(&summary).lines() {
        println!("   {}", line);
    }
    println!("\n✅ Summary saved to: {}", path.display());

    Ok(summary)
}

/// Handle the stats command.
fn print_stats(store: &RunStore, args: &StatsArgs) -> Result<()> {
    let summary = analysis::aggregate(store).context("Failed to read runs")?;

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&summary)?,
        OutputFormat::Markdown => report::generate_markdown_report(&summary, store.root()),
    };

    match args.output {
        Some(ref path) => {
            report::write_report(&output, path)?;
            println!("✅ Report saved to: {}", path.display());
        }
        None => println!("{}", output),
    }

    Ok(())
}

/// Shared state for the model-invoking commands.
struct Pipeline {
    config: Config,
    store: Arc<RunStore>,
    client: Arc<dyn ModelClient>,
    audit: Option<Arc<AuditSink>>,
    quiet: bool,
}

impl Pipeline {
    fn new(config: Config, store: Arc<RunStore>, quiet: bool) -> Result<Self> {
        let client = llm::build_client(&config.model)?;

        let audit = if config.general.audit {
            let sink = AuditSink::new(store.root().join(AUDIT_FILE));
            info!("Auditing model attempts to {}", sink.path().display());
            Some(Arc::new(sink))
        } else {
            None
        };

        println!("🤖 Model provider: {}", client.name());
        println!("   Model: {}", config.model.name);
        println!("   Endpoint: {}", config.model.effective_endpoint());
        println!(
            "   Timeout: {}s | Attempts: {}",
            config.model.timeout_seconds, config.model.max_attempts
        );

        Ok(Self {
            config,
            store,
            client,
            audit,
            quiet,
        })
    }

    /// Read a stage template and check its placeholders.
    fn load_template(&self, kind: ArtifactKind) -> Result<String> {
        let path = self.config.prompts.path_for(kind);
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} prompt: {}", kind, path.display()))?;

        let available = pipeline::available_variables(kind);
        prompt::check_variables(&path.display().to_string(), &template, &available)?;

        debug!(stage = %kind, path = %path.display(), "Loaded prompt template");
        Ok(template)
    }

    fn invoker(&self, kind: ArtifactKind) -> Arc<Invoker> {
        let mut invoker = Invoker::new(
            Arc::clone(&self.client),
            self.config.model_for(kind),
            self.config.model.retry_policy(),
        );
        if let Some(ref sink) = self.audit {
            invoker = invoker.with_audit(Arc::clone(sink));
        }
        Arc::new(invoker)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }

    /// Allocate fresh runs for every configured class and generate scenarios.
    async fn run_scenarios(&self, template: String) -> Result<BatchStats> {
        let classes: Vec<String> = self
            .config
            .scenario
            .classes
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if classes.is_empty() {
            bail!("No scenario classes configured");
        }

        let tags: Vec<String> = classes
            .iter()
            .flat_map(|c| std::iter::repeat(c.clone()).take(self.config.scenario.count))
            .collect();

        let manifests = self
            .store
            .allocate_runs(&tags)
            .context("Failed to allocate runs")?;
        info!("Allocated {} runs", manifests.len());

        let items = manifests
            .into_iter()
            .map(|m| WorkItem::new(m.run_id, m.class_tag, ArtifactKind::Scenario))
            .collect();

        self.run_stage(ArtifactKind::Scenario, template, items, false)
            .await
    }

    /// Work items for a downstream stage.
    ///
    /// Without an explicit run list only runs whose prerequisites exist are
    /// selected. Explicitly requested runs are always included so a missing
    /// prerequisite is reported as that item's failure.
    fn pending_items(&self, kind: ArtifactKind, runs: Option<&[String]>) -> Result<Vec<WorkItem>> {
        let run_ids: Vec<String> = match runs {
            Some(ids) => {
                let mut seen = BTreeSet::new();
                ids.iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| seen.insert(id.clone()))
                    .collect()
            }
            None => self
                .store
                .list_run_ids()?
                .into_iter()
                .filter(|id| {
                    kind.prerequisites()
                        .iter()
                        .all(|prerequisite| self.store.exists(id, *prerequisite))
                })
                .collect(),
        };

        let items = run_ids
            .into_iter()
            .map(|run_id| {
                let class_tag = match self.store.manifest(&run_id) {
                    Ok(Some(manifest)) => manifest.class_tag,
                    _ => analysis::UNKNOWN_CLASS.to_string(),
                };
                WorkItem::new(run_id, class_tag, kind)
            })
            .collect();

        Ok(items)
    }

    /// Run one stage over `items` and print its summary.
    async fn run_stage(
        &self,
        kind: ArtifactKind,
        template: String,
        items: Vec<WorkItem>,
        overwrite: bool,
    ) -> Result<BatchStats> {
        let limit = self.config.concurrency_for(kind);
        println!(
            "\n🔬 Running {} stage: {} items, concurrency {}",
            kind,
            items.len(),
            limit
        );

        let ctx = Arc::new(
            StageContext::new(kind, Arc::clone(&self.store), self.invoker(kind), template)
                .with_overwrite(overwrite),
        );

        let progress = self.progress_bar(items.len());
        let results = pipeline::run_batch_with_progress(
            items,
            limit,
            move |item| pipeline::execute(Arc::clone(&ctx), item),
            progress,
        )
        .await?;

        let stats = BatchStats::from_results(&results);
        print_stage_summary(kind, &stats);
        Ok(stats)
    }
}

fn print_stage_summary(kind: ArtifactKind, stats: &BatchStats) {
    println!("\n📊 {} stage summary:", kind);
    println!(
        "   ✅ Success: {} | ⏭️  Skipped: {} | ❌ Failed: {}",
        stats.success,
        stats.skipped,
        stats.failures()
    );

    if stats.failures() > 0 {
        println!(
            "   - Transient: {} | Permanent: {} | Validation: {} | Storage: {}",
            stats.transient, stats.permanent, stats.validation, stats.storage
        );
        let ids = stats.failed_runs.join(",");
        println!("   Failed runs: {}", ids);
        let command = match kind {
            ArtifactKind::Scenario => "scenario",
            ArtifactKind::Governance => "governance",
            ArtifactKind::Evaluation => "evaluate",
        };
        println!("   Retry with: govsynth {} --runs {} --overwrite", command, ids);
    }
}
