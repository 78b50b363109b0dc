use crate::comparison::compare_models;
use crate::config::EngineConfig;
use crate::engine::llm::{HttpLlmClient, LlmErrorKind, ProviderSettings};
use crate::engine::template::placeholders;
use crate::engine::RunExecutor;
use crate::model::{new_id, EvaluationMethod, PromptSystem, RunEvent, Sample, ScheduleDescriptor};
use crate::notify::LogNotifier;
use crate::optimizer::session::{OptimizationConfig, SessionStatus};
use crate::optimizer::OptimizationEngine;
use crate::orchestrator::{run_daemon, ScheduleRunner, Scheduler};
use crate::session_store::FileSessionStore;
use crate::storage::{self, JsonStore, Storage};
use crate::text_summary::{self, TextSummary};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser)]
#[command(
    name = "prompt-regress",
    version,
    about = "Regression testing and optimization for LLM prompts"
)]
pub struct Cli {
    /// Directory holding the catalog file
    #[arg(long, global = true, env = "PROMPT_REGRESS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of a text summary
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Host running Ollama (port 11434)
    #[arg(long, env = "OLLAMA_HOST", default_value = "localhost")]
    pub ollama_host: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage prompt systems
    System {
        #[command(subcommand)]
        action: SystemCommand,
    },
    /// Run a regression set once and store the result
    Run(RunArgs),
    /// Show a stored run
    Show { run_id: String },
    /// Score history for a prompt system
    History {
        #[arg(long)]
        system: String,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Manage recurring schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleCommand,
    },
    /// Run scheduled tests until interrupted
    Serve,
    /// Iteratively rewrite a prompt to improve its score
    Optimize {
        #[command(subcommand)]
        action: OptimizeCommand,
    },
    /// Score one template against several models
    Compare(CompareArgs),
}

#[derive(Debug, Subcommand)]
pub enum SystemCommand {
    Add {
        /// Prompt system definition (JSON)
        #[arg(long)]
        file: PathBuf,
    },
    List,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    pub system: String,
    /// Regression samples (JSON array)
    #[arg(long)]
    pub samples: PathBuf,
    #[arg(long, default_value = "fuzzy", value_parser = parse_method)]
    pub method: EvaluationMethod,
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCommand {
    Add(ScheduleAddArgs),
    /// Pause or resume a schedule
    Toggle { id: String },
    Remove { id: String },
    List,
}

#[derive(Debug, Args)]
pub struct ScheduleAddArgs {
    #[arg(long)]
    pub system: String,
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub samples: PathBuf,
    #[arg(long, default_value = "1h")]
    pub interval: humantime::Duration,
    #[arg(long, default_value = "fuzzy", value_parser = parse_method)]
    pub method: EvaluationMethod,
    /// Alert when the average score drops by more than this (0 to 1)
    #[arg(long, default_value_t = 0.2, value_parser = parse_threshold)]
    pub threshold: f64,
    #[arg(long)]
    pub notify: bool,
    #[arg(long = "recipient")]
    pub recipients: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum OptimizeCommand {
    /// Start a session and follow it until it ends (Ctrl-C stops it)
    Start(OptimizeArgs),
    Status { id: String },
    /// Stop a running session, including one driven by another process
    Stop { id: String },
    StopAll,
    Delete { id: String },
    List,
}

#[derive(Debug, Args)]
pub struct OptimizeArgs {
    #[arg(long)]
    pub system: String,
    #[arg(long, default_value_t = 5)]
    pub max_iterations: u32,
    #[arg(long, default_value_t = 0.05)]
    pub budget: f64,
    #[arg(long, default_value = "fuzzy", value_parser = parse_method)]
    pub method: EvaluationMethod,
}

#[derive(Debug, Args)]
pub struct CompareArgs {
    /// File containing the prompt template
    #[arg(long)]
    pub template: PathBuf,
    #[arg(long, value_delimiter = ',', required = true)]
    pub models: Vec<String>,
    #[arg(long)]
    pub samples: PathBuf,
    #[arg(long, default_value = "fuzzy", value_parser = parse_method)]
    pub method: EvaluationMethod,
}

fn parse_method(s: &str) -> std::result::Result<EvaluationMethod, String> {
    match EvaluationMethod::parse(s) {
        EvaluationMethod::Unknown => Err(format!(
            "unknown evaluation method {s:?} (expected one of: {})",
            EvaluationMethod::KNOWN
                .iter()
                .map(|m| format!("{m} ({})", m.description()))
                .collect::<Vec<_>>()
                .join(", ")
        )),
        m => Ok(m),
    }
}

fn parse_threshold(s: &str) -> std::result::Result<f64, String> {
    let t: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&t) {
        Ok(t)
    } else {
        Err(format!("threshold must be between 0 and 1, got {s}"))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Shared handles built from global flags.
struct App {
    store: Arc<JsonStore>,
    sessions: Arc<FileSessionStore>,
    executor: RunExecutor,
    cfg: EngineConfig,
    json: bool,
    out: mpsc::UnboundedSender<OutputLine>,
}

impl App {
    fn build(args: &Cli, out: mpsc::UnboundedSender<OutputLine>) -> Result<Self> {
        let cfg = match args.config.as_deref() {
            Some(p) => EngineConfig::load(p)?,
            None => EngineConfig::default(),
        };
        let dir = args
            .data_dir
            .clone()
            .unwrap_or_else(storage::default_data_dir);
        let store = Arc::new(JsonStore::open(&dir)?);
        if let Some(path) = store.path() {
            debug!(catalog = %path.display(), "catalog opened");
        }
        let sessions = Arc::new(FileSessionStore::open(&dir)?);
        let llm = HttpLlmClient::new(ProviderSettings {
            openai_base_url: args.openai_base_url.clone(),
            openai_api_key: args.openai_api_key.clone(),
            ollama_host: args.ollama_host.clone(),
            timeout: cfg.request_timeout,
        })
        .context("build HTTP client")?;
        Ok(Self {
            store,
            sessions,
            executor: RunExecutor::new(Arc::new(llm)),
            cfg,
            json: args.json,
            out,
        })
    }

    fn stdout(&self, line: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stdout(line.into()));
    }

    fn stderr(&self, line: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stderr(line.into()));
    }

    /// JSON in `--json` mode, the text summary otherwise.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> TextSummary) -> Result<()> {
        if self.json {
            self.stdout(serde_json::to_string_pretty(value)?);
        } else {
            for line in text().lines {
                self.stdout(line);
            }
        }
        Ok(())
    }

    fn optimizer(&self) -> Arc<OptimizationEngine> {
        Arc::new(OptimizationEngine::new(
            self.store.clone(),
            self.sessions.clone(),
            self.executor.clone(),
            self.cfg.clone(),
        ))
    }

    async fn require_system(&self, id: &str) -> Result<PromptSystem> {
        self.store
            .get_prompt_system(id)
            .await?
            .with_context(|| format!("prompt system not found: {id}"))
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let res = match App::build(&args, out_tx) {
        Ok(app) => {
            let res = dispatch(&app, args.command).await;
            drop(app);
            res
        }
        Err(e) => Err(e),
    };
    let _ = out_handle.await;
    res
}

async fn dispatch(app: &App, command: Command) -> Result<()> {
    match command {
        Command::System { action } => system_command(app, action).await,
        Command::Run(a) => run_once(app, a).await,
        Command::Show { run_id } => {
            let run = app
                .store
                .get_run(&run_id)
                .await?
                .with_context(|| format!("run not found: {run_id}"))?;
            app.emit(&run, || text_summary::build_run_summary(&run, 5))
        }
        Command::History { system, days } => {
            let points = storage::history(app.store.as_ref(), &system, days).await?;
            app.emit(&points, || text_summary::build_history_summary(&points))
        }
        Command::Schedule { action } => schedule_command(app, action).await,
        Command::Serve => serve(app).await,
        Command::Optimize { action } => optimize_command(app, action).await,
        Command::Compare(a) => compare(app, a).await,
    }
}

async fn system_command(app: &App, action: SystemCommand) -> Result<()> {
    match action {
        SystemCommand::Add { file } => {
            let mut system: PromptSystem = read_json(&file)?;
            if system.variables.is_empty() {
                system.variables = placeholders(&system.template);
            }
            app.store.save_prompt_system(&system).await?;
            app.stderr(format!("Saved prompt system {}", system.id));
            app.emit(&system, || TextSummary {
                lines: vec![system.id.clone()],
            })
        }
        SystemCommand::List => {
            let systems = app.store.list_prompt_systems().await?;
            app.emit(&systems, || TextSummary {
                lines: systems
                    .iter()
                    .map(|s| format!("{}  {:<24} {}/{}", s.id, s.name, s.provider, s.model))
                    .collect(),
            })
        }
    }
}

async fn run_once(app: &App, args: RunArgs) -> Result<()> {
    let system = app.require_system(&args.system).await?;
    let samples: Vec<Sample> = read_json(&args.samples)?;

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let executor = app.executor.clone().with_events(evt_tx);
    let progress = app.out.clone();
    let quiet = app.json;
    let forward = tokio::spawn(async move {
        while let Some(ev) = evt_rx.recv().await {
            if !quiet {
                let _ = progress.send(OutputLine::Stderr(ev.to_message()));
            }
        }
    });

    let result = executor
        .run_and_store(app.store.as_ref(), &system, &samples, args.method)
        .await;
    drop(executor);
    let _ = forward.await;

    let run = result.map_err(|e| {
        let hint = match e.upstream_kind() {
            Some(LlmErrorKind::Auth) => " (check OPENAI_API_KEY)",
            Some(LlmErrorKind::Quota) => " (provider quota exceeded)",
            _ => "",
        };
        anyhow::anyhow!("test run failed [{}]: {e}{hint}", e.status_code())
    })?;
    info!(run_id = %run.id, avg_score = run.outcome.avg_score, "run stored");
    app.emit(&run, || text_summary::build_run_summary(&run, 5))
}

async fn schedule_command(app: &App, action: ScheduleCommand) -> Result<()> {
    match action {
        ScheduleCommand::Add(a) => {
            app.require_system(&a.system).await?;
            let interval = Duration::from(a.interval);
            if interval.is_zero() {
                anyhow::bail!("interval must be greater than zero");
            }
            let schedule = ScheduleDescriptor {
                id: new_id(),
                name: a.name,
                prompt_system_id: a.system,
                regression_set: read_json(&a.samples)?,
                interval,
                evaluation_method: a.method,
                alert_threshold: a.threshold,
                notifications_enabled: a.notify,
                recipients: a.recipients,
                active: true,
                created_at: OffsetDateTime::now_utc(),
                last_run_at: None,
                next_run_at: Some(OffsetDateTime::now_utc() + interval),
            };
            app.store.save_schedule(&schedule).await?;
            app.stderr(format!("Created schedule {}", schedule.id));
            app.emit(&schedule, || TextSummary {
                lines: vec![schedule.id.clone()],
            })
        }
        ScheduleCommand::Toggle { id } => {
            let mut schedule = app
                .store
                .get_schedule(&id)
                .await?
                .with_context(|| format!("schedule not found: {id}"))?;
            schedule.active = !schedule.active;
            app.store.save_schedule(&schedule).await?;
            let state = if schedule.active { "resumed" } else { "paused" };
            app.stderr(format!("Schedule {id} {state}"));
            Ok(())
        }
        ScheduleCommand::Remove { id } => {
            if !app.store.delete_schedule(&id).await? {
                anyhow::bail!("schedule not found: {id}");
            }
            app.stderr(format!("Removed schedule {id}"));
            Ok(())
        }
        ScheduleCommand::List => {
            let schedules = app.store.list_schedules(false).await?;
            app.emit(&schedules, || TextSummary {
                lines: schedules
                    .iter()
                    .map(|s| {
                        format!(
                            "{}  {:<24} every {:<8} {} samples{}",
                            s.id,
                            s.name,
                            humantime::format_duration(s.interval).to_string(),
                            s.regression_set.len(),
                            if s.active { "" } else { " (paused)" }
                        )
                    })
                    .collect(),
            })
        }
    }
}

async fn serve(app: &App) -> Result<()> {
    let runner = Arc::new(ScheduleRunner::new(
        app.store.clone(),
        app.executor.clone(),
        Arc::new(LogNotifier),
    ));
    let scheduler = Scheduler::new(runner);
    let optimizer = app.optimizer();
    run_daemon(&app.store, &scheduler, &optimizer, &app.cfg, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn optimize_command(app: &App, action: OptimizeCommand) -> Result<()> {
    let engine = app.optimizer();
    match action {
        OptimizeCommand::Start(a) => optimize(app, &engine, a).await,
        OptimizeCommand::Status { id } => {
            let session = engine.status(&id).await?;
            app.emit(&session, || text_summary::build_session_summary(&session))
        }
        OptimizeCommand::Stop { id } => {
            let status = engine.stop(&id).await?;
            app.stderr(format!("Session {id} {status}"));
            Ok(())
        }
        OptimizeCommand::StopAll => {
            let n = engine.stop_all().await?;
            app.stderr(format!("Stopped {n} running session(s)"));
            Ok(())
        }
        OptimizeCommand::Delete { id } => {
            engine.delete(&id).await?;
            app.stderr(format!("Deleted session {id}"));
            Ok(())
        }
        OptimizeCommand::List => {
            let sessions = engine.list().await?;
            app.emit(&sessions, || text_summary::build_session_list(&sessions))
        }
    }
}

async fn optimize(
    app: &App,
    engine: &Arc<OptimizationEngine>,
    args: OptimizeArgs,
) -> Result<()> {
    let id = engine
        .start(
            &args.system,
            OptimizationConfig {
                max_iterations: args.max_iterations,
                cost_budget: args.budget,
                evaluation_method: args.method,
            },
        )
        .await?;
    app.stderr(format!(
        "Optimization session {id} started (Ctrl-C or `optimize stop {id}` to stop)"
    ));

    let mut seen = 0;
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;
    let session = loop {
        tokio::select! {
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                engine.stop(&id).await?;
                app.stderr("Stopping…");
            }
            _ = poll.tick() => {
                let session = engine.status(&id).await?;
                for r in session.results.iter().skip(seen) {
                    app.stderr(format!(
                        "Iteration {}: score {:.3} ({:+.3})",
                        r.iteration, r.score, r.improvement
                    ));
                }
                seen = session.results.len();
                if session.status != SessionStatus::Running {
                    break session;
                }
            }
        }
    };
    app.emit(&session, || text_summary::build_session_summary(&session))
}

async fn compare(app: &App, args: CompareArgs) -> Result<()> {
    let template = std::fs::read_to_string(&args.template)
        .with_context(|| format!("read {}", args.template.display()))?;
    let samples: Vec<Sample> = read_json(&args.samples)?;
    let base = PromptSystem {
        id: "comparison".into(),
        name: "comparison".into(),
        variables: placeholders(&template),
        template,
        provider: String::new(),
        model: String::new(),
        temperature: 0.7,
        max_tokens: 1000,
        top_p: 1.0,
        top_k: None,
        created_at: OffsetDateTime::now_utc(),
    };
    let results = compare_models(&app.executor, &base, &args.models, &samples, args.method).await;
    app.emit(&results, || text_summary::build_comparison_summary(&results))
}
