//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use postforge_core::draft::slugify;
use postforge_core::{
    BatchReport, Collaborators, Pipeline, ProgressReporter, PublishScheduler, StageFailure,
    TaxonomySource,
};
use postforge_matcher::TfIdfMatcher;
use postforge_providers::{
    DuckDuckGoSearch, FluxImageGenerator, OpenRouterClient, PageFetcher, image_host,
};
use postforge_shared::{
    AppConfig, BatchRequest, Candidate, DraftStatus, SchedulerConfig, TargetLocator,
    config_file_path, expand_home, init_config, load_config, save_config_to, validate_api_keys,
};
use postforge_storage::{Storage, TargetRegistry};
use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PostForge: keyword batches in, scheduled articles out.
#[derive(Parser)]
#[command(
    name = "postforge",
    version,
    about = "Turn keyword batches into researched, illustrated, scheduled blog drafts.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Generate drafts for a batch of keywords.
    Submit {
        /// Keywords to write about.
        keywords: Vec<String>,

        /// Read additional keywords from a file, one per line.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Search region country code.
        #[arg(long, default_value = "us")]
        country: String,

        /// Article language code.
        #[arg(long, default_value = "en")]
        language: String,

        /// Who asked for this batch (kept on drafts and failure records).
        #[arg(long)]
        requester: Option<String>,

        /// Publish into this registered target instead of the active one.
        #[arg(long)]
        target: Option<String>,

        /// Collection inside the target store.
        #[arg(long)]
        collection: Option<String>,
    },

    /// Publish scheduler.
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },

    /// List drafts.
    Drafts {
        /// Only drafts with this status: pending or published.
        #[arg(long)]
        status: Option<DraftStatus>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List keywords left for manual review.
    Failures {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Manage categories and tags in a target store.
    Taxonomy {
        #[command(subcommand)]
        action: TaxonomyAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Scheduler subcommands.
#[derive(Subcommand)]
pub(crate) enum SchedulerAction {
    /// Tick on the configured interval until interrupted.
    Run,
    /// Publish whatever is due right now, once.
    Tick,
}

/// Taxonomy subcommands.
#[derive(Subcommand)]
pub(crate) enum TaxonomyAction {
    /// Add or update a category.
    AddCategory(LabelArgs),
    /// Add or update a tag.
    AddTag(LabelArgs),
}

#[derive(clap::Args)]
pub(crate) struct LabelArgs {
    /// Display name.
    name: String,

    /// Free-text description used for matching.
    #[arg(short, long, default_value = "")]
    description: String,

    /// Stable id (defaults to the slugified name).
    #[arg(long)]
    id: Option<String>,

    /// Target store (defaults to the active target).
    #[arg(long)]
    target: Option<String>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Make a registered target the active one.
    UseTarget {
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "postforge=info",
        1 => "postforge=debug",
        _ => "postforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Submit {
            keywords,
            file,
            country,
            language,
            requester,
            target,
            collection,
        } => {
            let mut request = BatchRequest::new(collect_keywords(keywords, file.as_deref())?);
            request.country = country;
            request.language = language;
            request.requester = requester;
            cmd_submit(request, target.as_deref(), collection).await
        }
        Command::Scheduler { action } => match action {
            SchedulerAction::Run => cmd_scheduler_run().await,
            SchedulerAction::Tick => cmd_scheduler_tick().await,
        },
        Command::Drafts { status, limit } => cmd_drafts(status, limit).await,
        Command::Failures { limit } => cmd_failures(limit).await,
        Command::Taxonomy { action } => match action {
            TaxonomyAction::AddCategory(args) => cmd_taxonomy_add(args, LabelKind::Category).await,
            TaxonomyAction::AddTag(args) => cmd_taxonomy_add(args, LabelKind::Tag).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
            ConfigAction::UseTarget { name } => cmd_config_use_target(&name).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn load_validated() -> Result<AppConfig> {
    let config = load_config()?;
    config.validate()?;
    Ok(config)
}

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_home(&config.storage.source_db)?;
    Ok(Arc::new(Storage::open(&path).await?))
}

/// The source database for listing commands, or `None` if nothing has
/// been written yet. Never creates the file.
async fn open_storage_readonly(config: &AppConfig) -> Result<Option<Storage>> {
    let path = expand_home(&config.storage.source_db)?;
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Storage::open_readonly(&path).await?))
}

/// HTTP collaborators for `config`, with the active target as taxonomy source.
async fn build_collaborators(
    config: &AppConfig,
    registry: &TargetRegistry,
) -> Result<Collaborators> {
    let llm = Arc::new(OpenRouterClient::new(&config.openrouter)?);
    let taxonomy: Arc<dyn TaxonomySource> = registry.get(&config.active_target).await?;
    Ok(Collaborators {
        search: Arc::new(DuckDuckGoSearch::new(&config.search)?),
        scraper: Arc::new(PageFetcher::new(&config.search)?),
        planner: llm.clone(),
        images: Arc::new(FluxImageGenerator::new(
            &config.images,
            image_host(&config.images)?,
        )?),
        writer: llm,
        taxonomy,
        matcher: Arc::new(TfIdfMatcher::new()),
    })
}

fn collect_keywords(mut keywords: Vec<String>, file: Option<&std::path::Path>) -> Result<Vec<String>> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("cannot read keywords from {}: {e}", path.display()))?;
        keywords.extend(content.lines().map(str::to_string));
    }
    Ok(keywords)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_submit(
    mut request: BatchRequest,
    target: Option<&str>,
    collection: Option<String>,
) -> Result<()> {
    let mut config = load_validated()?;
    if let Some(name) = target {
        config = config.with_active_target(name)?;
    }
    validate_api_keys(&config)?;

    if request.jobs().is_empty() {
        return Err(eyre!("no keywords given"));
    }
    let mut locator: TargetLocator = config.active_locator();
    if let Some(collection) = collection {
        locator.collection = collection;
    }
    request.target = Some(locator.clone());

    let storage = open_storage(&config).await?;
    let registry = TargetRegistry::from_config(&config);
    let collab = build_collaborators(&config, &registry).await?;
    let pipeline = Pipeline::new(Arc::new(config), collab, storage)?;

    info!(
        keywords = request.jobs().len(),
        target = %locator.store,
        collection = %locator.collection,
        "submitting batch"
    );

    let reporter = CliProgress::new();
    let report = pipeline.run_batch(request, &reporter).await?;

    println!();
    if report.halted {
        println!("  Batch halted: a provider ran out of quota.");
    } else {
        println!("  Batch complete.");
    }
    println!("  Batch:       {}", report.batch_id);
    println!("  Drafts:      {}", report.drafts.len());
    println!("  Recovered:   {}", report.recovered.len());
    println!("  Unprocessed: {}", report.unprocessed.len());
    for draft in report.drafts.iter().chain(&report.recovered) {
        println!(
            "    {}  {}  {}",
            draft.scheduled_at.format("%Y-%m-%d %H:%M"),
            draft.slug,
            draft.title
        );
    }
    for failure in &report.unprocessed {
        println!("    ! {} [{}] {}", failure.keyword, failure.stage, failure.message);
    }
    println!();

    Ok(())
}

async fn cmd_scheduler_run() -> Result<()> {
    let config = load_validated()?;
    let scheduler = scheduler(&config).await?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current tick");
            let _ = tx.send(true);
        }
    });

    scheduler.run(rx).await;
    Ok(())
}

async fn cmd_scheduler_tick() -> Result<()> {
    let config = load_validated()?;
    let report = scheduler(&config).await?.tick(Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn scheduler(config: &AppConfig) -> Result<PublishScheduler> {
    Ok(PublishScheduler::new(
        open_storage(config).await?,
        Arc::new(TargetRegistry::from_config(config)),
        SchedulerConfig::try_from(config)?,
    ))
}

async fn cmd_drafts(status: Option<DraftStatus>, limit: u32) -> Result<()> {
    let config = load_config()?;
    let drafts = match open_storage_readonly(&config).await? {
        Some(storage) => storage.list_drafts(status, limit).await?,
        None => Vec::new(),
    };

    if drafts.is_empty() {
        println!("No drafts.");
        return Ok(());
    }
    for draft in drafts {
        println!(
            "{:<9}  {}  {:<40}  {}/{}",
            draft.status.as_str(),
            draft.scheduled_at.format("%Y-%m-%d %H:%M"),
            draft.slug,
            draft.target.store,
            draft.target.collection,
        );
    }
    Ok(())
}

async fn cmd_failures(limit: u32) -> Result<()> {
    let config = load_config()?;
    let failures = match open_storage_readonly(&config).await? {
        Some(storage) => storage.list_failures(limit).await?,
        None => Vec::new(),
    };

    if failures.is_empty() {
        println!("No unprocessed keywords.");
        return Ok(());
    }
    for record in failures {
        println!(
            "{}  {:<30}  {:<20}  {}",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.keyword,
            record.stage,
            record.message
        );
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum LabelKind {
    Category,
    Tag,
}

async fn cmd_taxonomy_add(args: LabelArgs, kind: LabelKind) -> Result<()> {
    let config = load_validated()?;
    let target = args.target.unwrap_or_else(|| config.active_target.clone());
    let registry = TargetRegistry::from_config(&config);
    let store = registry.get(&target).await?;

    let id = args.id.unwrap_or_else(|| slugify(&args.name));
    if id.is_empty() {
        return Err(eyre!("cannot derive an id from {:?}; pass --id", args.name));
    }
    let candidate = Candidate {
        id,
        name: args.name,
        description: args.description,
    };
    match kind {
        LabelKind::Category => store.upsert_category(&candidate).await?,
        LabelKind::Tag => store.upsert_tag(&candidate).await?,
    }
    println!("Saved {} in {target}.", candidate.id);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_config_use_target(name: &str) -> Result<()> {
    let config = load_config()?.with_active_target(name)?;
    let path = config_file_path()?;
    save_config_to(&config, &path)?;
    println!("Active target set to {name} in {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn keyword_started(&self, keyword: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Generating [{current}/{total}] {keyword}"));
    }

    fn keyword_finished(&self, keyword: &str, failure: Option<&StageFailure>) {
        if let Some(failure) = failure {
            self.spinner.println(format!("  ! {keyword}: {failure}"));
        }
    }

    fn done(&self, _report: &BatchReport) {
        self.spinner.finish_and_clear();
    }
}
