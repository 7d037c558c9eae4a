use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use futures::StreamExt;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;

use docrelay::api::{AppState, create_router};
use docrelay::config::{self, APP_NAME, AppConfig};
use docrelay::consumer::{ConsumerError, Notice, RelayClient, StreamHandler};
use docrelay::relay::HttpUpstream;
use docrelay::tracker::{
    BatchTracker, BatchUpdate, PollConfig, ProgressClient, TaskPoller, TaskUpdate,
};
use docrelay_protocol::{ProgressRecord, group_by_batch};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Serve(cmd) => handle_serve(&ctx, cmd).await,
        Command::Relay(cmd) => handle_relay(&ctx, cmd).await,
        Command::Watch(cmd) => handle_watch(&ctx, cmd).await,
        Command::Batch(cmd) => handle_batch(&ctx, cmd).await,
        Command::Tasks(cmd) => handle_tasks(&ctx, cmd).await,
        Command::Clear(cmd) => handle_clear(&ctx, cmd).await,
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved config file: {}", ctx.config_file.display());

    async_main(ctx, cli.command)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "docrelay - streaming relay and progress tracker for document ingestion.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Send a request through a running relay and print its events
    Relay(RelayCommand),
    /// Follow one task until it completes or fails
    Watch(WatchCommand),
    /// Follow several tasks as one batch
    Batch(BatchCommand),
    /// List active tasks grouped by batch
    Tasks(TasksCommand),
    /// Remove a task from the progress store
    Clear(ClearCommand),
    /// Create the default configuration file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (default: server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (default: server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Upstream ingestion API (default: upstream.base_url)
    #[arg(long, value_name = "URL")]
    upstream: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct TokenOpts {
    /// Bearer credential forwarded to the upstream
    #[arg(long, env = "DOCRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct RelayCommand {
    /// Upstream path, e.g. documents/bulk
    path: String,
    /// JSON request body
    #[arg(long, conflicts_with = "file")]
    data: Option<String>,
    /// Read the request body from a file
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Content type of the request body
    #[arg(long, default_value = "application/json")]
    content_type: String,
    /// Relay server (default: http://<server.host>:<server.port>)
    #[arg(long, value_name = "URL")]
    server: Option<String>,
    #[command(flatten)]
    auth: TokenOpts,
}

#[derive(Debug, Clone, Args)]
struct WatchCommand {
    task_id: String,
    /// Clear the task from the progress store once it finished
    #[arg(long)]
    clear: bool,
    #[command(flatten)]
    auth: TokenOpts,
}

#[derive(Debug, Clone, Args)]
struct BatchCommand {
    /// Tasks belonging to the batch
    #[arg(required = true)]
    task_ids: Vec<String>,
    /// Name shown for the batch
    #[arg(long, default_value = "batch")]
    batch_id: String,
    #[command(flatten)]
    auth: TokenOpts,
}

#[derive(Debug, Clone, Args)]
struct TasksCommand {
    #[command(flatten)]
    auth: TokenOpts,
}

#[derive(Debug, Clone, Args)]
struct ClearCommand {
    task_id: String,
    #[command(flatten)]
    auth: TokenOpts,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = discover_config_file(common.config.clone())?;
        if !config_file.exists() {
            if common.dry_run {
                info!(
                    "dry-run: would create default config at {}",
                    config_file.display()
                );
            } else {
                config::write_default(&config_file)?;
            }
        }
        let config = config::load(&config_file)?;

        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "docrelay={level},docrelay_protocol={level},tower_http={level}"
            ))
        });

        // JSON output for --json, pretty format otherwise
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for the log-based modules
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn progress_client(&self, token: Option<String>) -> Result<ProgressClient> {
        let base_url = self
            .config
            .tracker
            .resolved_base_url(&self.config.upstream);
        let client = ProgressClient::new(base_url, token, &self.config.tracker)
            .context("creating progress client")?;
        Ok(client.with_missing_fields_prefix(self.config.relay.missing_fields_prefix.clone()))
    }

    /// Print `value` as JSON/YAML when requested, otherwise run `human`.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            println!(
                "---\n{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            human();
        }
        Ok(())
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(host) = cmd.host {
        config.server.host = host;
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    if let Some(upstream) = cmd.upstream {
        config.upstream.base_url = upstream;
    }

    let upstream = HttpUpstream::new(&config.upstream).context("creating upstream client")?;
    let progress = ProgressClient::new(
        config.tracker.resolved_base_url(&config.upstream),
        None,
        &config.tracker,
    )
    .context("creating progress client")?
    .with_missing_fields_prefix(config.relay.missing_fields_prefix.clone());
    info!("Relaying to {}", upstream.base_url());
    info!("Progress endpoints at {}", progress.base_url());

    let state = AppState::new(Arc::new(upstream), config.relay.clone(), progress);
    let app = axum::Router::new().nest("/api", create_router(state, &config.server));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Listening on http://{}", addr);

    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {}", err);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    warn!("failed to install SIGTERM handler: {}", err);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

/// Prints relay events as they arrive.
struct PrintHandler {
    json: bool,
}

impl StreamHandler for PrintHandler {
    fn on_started(&mut self, message: &str) {
        if !self.json {
            eprintln!("started: {message}");
        }
    }

    fn on_result(&mut self, result: &Value) {
        if self.json {
            println!("{result}");
        } else {
            match serde_json::to_string_pretty(result) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{result}"),
            }
        }
    }

    fn on_error(&mut self, error: &ConsumerError, notice: &Notice) {
        warn!("relay failed: {}", error);
        if self.json {
            if let Ok(text) = serde_json::to_string(notice) {
                eprintln!("{text}");
            }
        } else {
            eprintln!("error: {}", notice.message);
        }
    }

    fn on_done(&mut self) {
        if !self.json {
            eprintln!("done");
        }
    }
}

async fn handle_relay(ctx: &RuntimeContext, cmd: RelayCommand) -> Result<()> {
    let body = match (&cmd.data, &cmd.file) {
        (Some(data), _) => data.clone().into_bytes(),
        (None, Some(path)) => {
            let path = expand_path(path.clone())?;
            fs::read(&path).with_context(|| format!("reading request body {}", path.display()))?
        }
        (None, None) => Vec::new(),
    };

    let server = cmd.server.unwrap_or_else(|| {
        format!(
            "http://{}:{}",
            ctx.config.server.host, ctx.config.server.port
        )
    });
    let client = RelayClient::new(server, ctx.config.upstream.connect_timeout())
        .map_err(|err| anyhow!("{err}"))?
        .with_token(cmd.auth.token)
        .with_missing_fields_prefix(ctx.config.relay.missing_fields_prefix.clone());

    let mut handler = PrintHandler {
        json: ctx.common.json,
    };
    client
        .post(&cmd.path, &cmd.content_type, body, &mut handler)
        .await
        .map_err(|err| anyhow!("relay to {} failed: {}", cmd.path, err))?;
    Ok(())
}

fn describe_record(record: &ProgressRecord) -> String {
    let mut line = format!(
        "{} [{}] {:>3}% {} ({}/{})",
        record.filename.as_deref().unwrap_or(&record.task_id),
        record.status,
        record.progress_percent,
        record.current_step,
        record.completed_steps,
        record.total_steps
    );
    if let Some(eta) = record.estimated_remaining_seconds {
        line.push_str(&format!(", ~{eta}s left"));
    }
    if let Some(error) = &record.error_message {
        line.push_str(&format!(": {error}"));
    }
    line
}

async fn handle_watch(ctx: &RuntimeContext, cmd: WatchCommand) -> Result<()> {
    let client = ctx.progress_client(cmd.auth.token)?;
    let poller = TaskPoller::new(
        Arc::new(client.clone()),
        PollConfig::from(&ctx.config.tracker),
    );

    let mut updates = std::pin::pin!(poller.watch(cmd.task_id.clone()));
    let mut finished = false;
    while let Some(update) = updates.next().await {
        ctx.emit(&update, || match &update {
            TaskUpdate::Progress(record) | TaskUpdate::Finished(record) => {
                println!("{}", describe_record(record));
            }
            other => {
                if let Some(notice) = other.notice() {
                    eprintln!("{}", notice.message);
                }
            }
        })?;
        if let TaskUpdate::Finished(_) = update {
            finished = true;
        } else if update.is_final() {
            return Err(anyhow!(
                "{}",
                update
                    .notice()
                    .map(|notice| notice.message)
                    .unwrap_or_else(|| "watch ended".to_string())
            ));
        }
    }

    if finished && cmd.clear {
        if ctx.common.dry_run {
            info!("dry-run: would clear task {}", cmd.task_id);
        } else {
            let response = client.clear_task(&cmd.task_id).await?;
            info!("{}", response.message);
        }
    }
    Ok(())
}

async fn handle_batch(ctx: &RuntimeContext, cmd: BatchCommand) -> Result<()> {
    let client = ctx.progress_client(cmd.auth.token)?;
    let tracker = BatchTracker::new(
        Arc::new(client),
        PollConfig::from(&ctx.config.tracker),
        cmd.batch_id,
        cmd.task_ids,
    );

    let mut updates = std::pin::pin!(tracker.watch());
    while let Some(update) = updates.next().await {
        ctx.emit(&update, || match &update {
            BatchUpdate::Snapshot(snapshot) | BatchUpdate::Finished(snapshot) => {
                let batch = &snapshot.batch;
                println!(
                    "{}: {}% ({} done, {} failed, {} processing, {} queued of {})",
                    batch.batch_id,
                    batch.overall_percent,
                    batch.completed_count,
                    batch.failed_count,
                    batch.processing_count,
                    batch.queued_count,
                    batch.total_files
                );
            }
            BatchUpdate::Stalled { failures, reason } => {
                eprintln!("progress updates delayed after {failures} failed polls: {reason}");
            }
            BatchUpdate::Unauthorized => {}
        })?;
        if update == BatchUpdate::Unauthorized {
            return Err(anyhow!("credential rejected by the progress service"));
        }
    }
    Ok(())
}

async fn handle_tasks(ctx: &RuntimeContext, cmd: TasksCommand) -> Result<()> {
    let client = ctx.progress_client(cmd.auth.token)?;
    let tracked = client.list_tasks().await?;
    let batches = group_by_batch(&tracked);
    let records: Vec<ProgressRecord> = tracked
        .into_iter()
        .filter(|record| !record.is_terminal())
        .collect();

    #[derive(Serialize)]
    struct Listing<'a> {
        tasks: &'a [ProgressRecord],
        batches: &'a [docrelay_protocol::BatchRecord],
    }

    ctx.emit(
        &Listing {
            tasks: &records,
            batches: &batches,
        },
        || {
            if records.is_empty() {
                println!("no active tasks");
                return;
            }
            for batch in &batches {
                println!(
                    "batch {}: {}% ({} of {} finished)",
                    batch.batch_id,
                    batch.overall_percent,
                    batch.completed_count + batch.failed_count,
                    batch.total_files
                );
                for record in records
                    .iter()
                    .filter(|r| r.batch_id.as_deref() == Some(batch.batch_id.as_str()))
                {
                    println!("  {}", describe_record(record));
                }
            }
            for record in records.iter().filter(|r| r.batch_id.is_none()) {
                println!("{}", describe_record(record));
            }
        },
    )
}

async fn handle_clear(ctx: &RuntimeContext, cmd: ClearCommand) -> Result<()> {
    if ctx.common.dry_run {
        info!("dry-run: would clear task {}", cmd.task_id);
        return Ok(());
    }
    let client = ctx.progress_client(cmd.auth.token)?;
    let response = client.clear_task(&cmd.task_id).await?;
    ctx.emit(&response, || println!("{}", response.message))
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.config_file.display()
        );
        return Ok(());
    }

    config::write_default(&ctx.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!("dry-run: would reset config at {}", ctx.config_file.display());
                return Ok(());
            }
            config::write_default(&ctx.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn discover_config_file(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        let expanded = shellexpand::full(text).context("expanding path")?;
        Ok(PathBuf::from(expanded.to_string()))
    } else {
        Ok(path)
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
