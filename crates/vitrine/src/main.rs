use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use config::{Config, Environment, File, FileFormat};
use env_logger::WriteStyle;
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use vitrine::api::{AppState, create_router};
use vitrine::catalog::{CredentialEntry, Project, StaticCatalog};
use vitrine::container::{
    ContainerOrchestrator, ContainerRuntime, ContainerRuntimeApi, OrchestratorConfig, RuntimeType,
};
use vitrine::db::Database;
use vitrine::jobs::{JobQueue, JobWorker, SweepScope};
use vitrine::routing::{CommandReloader, NoopReloader, ProxyReloader, RouteConfig, RouteManager};
use vitrine::session::{DemoSessionConfig, DemoSessionOrchestrator, SessionRepository, SessionView};
use vitrine::sweeper::{ReconciliationSweeper, SweepReport, SweeperConfig};
use vitrine::ws::StatusBroadcaster;

const APP_NAME: &str = env!("CARGO_PKG_NAME");

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, AsyncCommand::Serve(cmd)),
        Command::Sweep => async_main(ctx, AsyncCommand::Sweep),
        Command::Sessions { command } => async_main(ctx, AsyncCommand::Sessions(command)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

enum AsyncCommand {
    Serve(ServeCommand),
    Sweep,
    Sessions(SessionsCommand),
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: AsyncCommand) -> Result<()> {
    match cmd {
        AsyncCommand::Serve(cmd) => handle_serve(&ctx, cmd).await,
        AsyncCommand::Sweep => handle_sweep(&ctx).await,
        AsyncCommand::Sessions(cmd) => handle_sessions(&ctx, cmd).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Vitrine - ephemeral demo sessions for showcased projects",
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
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine-readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine-readable YAML
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
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long, global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API, the job worker and the reconciliation timer
    Serve(ServeCommand),
    /// Run one full reconciliation pass and exit
    Sweep,
    /// Inspect or terminate demo sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Create the config file with defaults
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
    /// Address to bind (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// List sessions
    List {
        /// Include finished sessions
        #[arg(long)]
        all: bool,
        /// Maximum number of sessions with --all
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Terminate a session and remove its container
    Terminate {
        /// Session ID
        session_id: String,
    },
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
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level();
        let level_str = match level {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level_str},tower_http={level_str}"))
        });

        let force_color = matches!(self.common.color, ColorOption::Always)
            || env::var_os("FORCE_COLOR").is_some();
        let disable_color = self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !io::stderr().is_terminal());

        let diagnostics = self.common.diagnostics;
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(diagnostics)
                        .with_file(diagnostics)
                        .with_line_number(diagnostics),
                )
                .try_init()
                .ok();
        }

        // The container and routing layers log through `log`.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level_str));
        builder.filter_level(level);
        builder.format_timestamp(None);
        builder.write_style(if disable_color {
            WriteStyle::Never
        } else if force_color {
            WriteStyle::Always
        } else {
            WriteStyle::Auto
        });
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

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }
        for dir in [&self.paths.data_dir, &self.paths.state_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn database_path(&self) -> PathBuf {
        self.paths.data_dir.join(format!("{APP_NAME}.db"))
    }

    fn route_config(&self) -> Result<RouteConfig> {
        let routing = &self.config.routing;
        let document_path = expand_str_path(&routing.document_path)?;
        let document_path = if document_path.is_absolute() {
            document_path
        } else {
            self.paths.state_dir.join(document_path)
        };
        Ok(RouteConfig {
            document_path,
            router_prefix: routing.router_prefix.clone(),
            base_domain: routing.base_domain.clone(),
            entry_points: routing.entry_points.clone(),
            cert_resolver: routing.cert_resolver.clone(),
            upstream_host: routing.upstream_host.clone(),
            scheme: routing.scheme.clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
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

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(data) = cfg.paths.data_dir.as_ref() {
            self.data_dir = expand_str_path(data)?;
        }
        if let Some(state) = cfg.paths.state_dir.as_ref() {
            self.state_dir = expand_str_path(state)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    profile: String,
    logging: LoggingConfig,
    paths: PathsConfig,
    server: ServerConfig,
    container: ContainerSettings,
    sessions: SessionSettings,
    routing: RoutingSettings,
    broadcast: BroadcastSettings,
    projects: Vec<Project>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Empty allows any origin.
    allowed_origins: Vec<String>,
    job_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerSettings {
    /// Autodetected when unset.
    runtime: Option<RuntimeType>,
    binary: Option<String>,
    name_prefix: String,
    bind_address: Option<String>,
    stop_timeout_seconds: u32,
    start_timeout_seconds: u64,
    port_poll_interval_ms: u64,
    max_concurrent_creates: usize,
    memory_limit: Option<String>,
    cpu_limit: Option<String>,
    network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionSettings {
    inactivity_timeout_seconds: u64,
    freeze_after_seconds: Option<u64>,
    retention_hours: u64,
    sweep_interval_seconds: u64,
    orphan_sweep_every: u64,
    retry_delay_ms: u64,
    terminate_on_shutdown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RoutingSettings {
    /// Relative paths resolve against the state directory.
    document_path: String,
    router_prefix: String,
    base_domain: String,
    entry_points: Vec<String>,
    cert_resolver: Option<String>,
    upstream_host: String,
    scheme: String,
    /// Run after every route change, e.g. `["systemctl", "reload", "traefik"]`.
    reload_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BroadcastSettings {
    capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            container: ContainerSettings::default(),
            sessions: SessionSettings::default(),
            routing: RoutingSettings::default(),
            broadcast: BroadcastSettings::default(),
            projects: vec![sample_project()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
            job_queue_capacity: 64,
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            runtime: None,
            binary: None,
            name_prefix: defaults.name_prefix,
            bind_address: defaults.bind_address,
            stop_timeout_seconds: defaults.stop_timeout_seconds,
            start_timeout_seconds: defaults.start_timeout.as_secs(),
            port_poll_interval_ms: defaults.port_poll_interval.as_millis() as u64,
            max_concurrent_creates: defaults.max_concurrent_creates,
            memory_limit: defaults.memory_limit,
            cpu_limit: defaults.cpu_limit,
            network: defaults.network,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let sweeper = SweeperConfig::default();
        Self {
            inactivity_timeout_seconds: sweeper.inactivity_timeout.as_secs(),
            freeze_after_seconds: sweeper.freeze_after.map(|d| d.as_secs()),
            retention_hours: sweeper.retention.as_secs() / 3600,
            sweep_interval_seconds: sweeper.interval.as_secs(),
            orphan_sweep_every: sweeper.orphan_every,
            retry_delay_ms: DemoSessionConfig::default().retry_delay.as_millis() as u64,
            terminate_on_shutdown: true,
        }
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        let defaults = RouteConfig::default();
        Self {
            document_path: defaults.document_path.to_string_lossy().into_owned(),
            router_prefix: defaults.router_prefix,
            base_domain: defaults.base_domain,
            entry_points: defaults.entry_points,
            cert_resolver: defaults.cert_resolver,
            upstream_host: defaults.upstream_host,
            scheme: defaults.scheme,
            reload_command: Vec::new(),
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            capacity: vitrine::ws::DEFAULT_CAPACITY,
        }
    }
}

fn sample_project() -> Project {
    Project {
        name: "demo-app".to_string(),
        image: "ghcr.io/example/demo-app:latest".to_string(),
        container_port: 3000,
        subdomain: "demo-app".to_string(),
        route_path: None,
        shared: false,
        env: BTreeMap::new(),
        identity_command: Vec::new(),
        credentials: vec![
            CredentialEntry {
                username: "alice".to_string(),
                role: "admin".to_string(),
                secret: "change-me".to_string(),
            },
            CredentialEntry {
                username: "bob".to_string(),
                role: "viewer".to_string(),
                secret: "change-me".to_string(),
            },
        ],
    }
}

impl ContainerSettings {
    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            name_prefix: self.name_prefix.clone(),
            bind_address: self.bind_address.clone(),
            stop_timeout_seconds: self.stop_timeout_seconds,
            start_timeout: Duration::from_secs(self.start_timeout_seconds),
            port_poll_interval: Duration::from_millis(self.port_poll_interval_ms.max(10)),
            max_concurrent_creates: self.max_concurrent_creates.max(1),
            memory_limit: self.memory_limit.clone(),
            cpu_limit: self.cpu_limit.clone(),
            network: self.network.clone(),
        }
    }

    fn runtime(&self) -> ContainerRuntime {
        match (self.runtime, self.binary.as_deref()) {
            (Some(kind), Some(binary)) => ContainerRuntime::with_binary(kind, binary),
            (Some(kind), None) => ContainerRuntime::with_type(kind),
            (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::default(), binary),
            (None, None) => ContainerRuntime::new(),
        }
    }
}

impl SessionSettings {
    fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_seconds.max(1)),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_seconds),
            freeze_after: self.freeze_after_seconds.map(Duration::from_secs),
            retention: Duration::from_secs(self.retention_hours * 3600),
            orphan_every: self.orphan_sweep_every.max(1),
        }
    }
}

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("profile", "default")?
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path)?;
    body.push_str(&toml);
    if !body.ends_with('\n') {
        body.push('\n');
    }
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> Result<String> {
    let mut header = String::new();
    header.push_str("# Configuration for ");
    header.push_str(APP_NAME);
    header.push('\n');
    header.push_str("# File: ");
    header.push_str(&path.display().to_string());
    header.push('\n');
    header.push('\n');
    Ok(header)
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
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

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Everything a command needs to drive sessions.
struct Services {
    demo: DemoSessionOrchestrator,
    sweeper: Arc<ReconciliationSweeper>,
}

async fn build_services(ctx: &RuntimeContext) -> Result<Services> {
    let cfg = &ctx.config;

    let db_path = ctx.database_path();
    info!("Using database at {}", db_path.display());
    let db = Database::new(&db_path)
        .await
        .context("opening session database")?;
    let repo = SessionRepository::new(db.pool().clone());

    let runtime = cfg.container.runtime();
    info!("Using container runtime {}", runtime.runtime_type());
    let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(runtime);
    let containers = ContainerOrchestrator::new(runtime, cfg.container.orchestrator_config());

    let reloader: Arc<dyn ProxyReloader> =
        match CommandReloader::from_command(&cfg.routing.reload_command) {
            Some(reloader) => Arc::new(reloader),
            None => Arc::new(NoopReloader),
        };
    let route_config = ctx.route_config()?;
    info!(
        "Writing routes to {}",
        route_config.document_path.display()
    );
    let (routes, _writer) = RouteManager::spawn(route_config, reloader);

    let broadcaster = Arc::new(StatusBroadcaster::new(cfg.broadcast.capacity.max(1)));
    let catalog = Arc::new(
        StaticCatalog::new(cfg.projects.clone()).context("loading project catalog")?,
    );
    if catalog.is_empty() {
        warn!("No projects configured; every start request will be rejected");
    }

    let demo = DemoSessionOrchestrator::new(
        repo,
        containers,
        routes,
        broadcaster,
        catalog.clone(),
        catalog,
        DemoSessionConfig {
            retry_delay: Duration::from_millis(cfg.sessions.retry_delay_ms),
        },
    );
    let sweeper = Arc::new(ReconciliationSweeper::new(
        demo.clone(),
        cfg.sessions.sweeper_config(),
    ));

    Ok(Services { demo, sweeper })
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    if ctx.common.dry_run {
        info!("dry-run: would serve on {addr}");
        return Ok(());
    }

    let Services { demo, sweeper } = build_services(ctx).await?;

    // Bring the store, the runtime and the routing document back in line
    // before accepting requests.
    match sweeper.sweep_sessions(SweepScope::Startup).await {
        Ok(report) => info!(
            "Startup reconciliation: {} recovered, {} terminated, {} orphans removed, {} routes published, {} withdrawn",
            report.recovered,
            report.terminated,
            report.orphans_removed,
            report.routes_published,
            report.routes_withdrawn
        ),
        Err(e) => warn!("Startup reconciliation failed: {}", e),
    }

    let (jobs, rx) = JobQueue::channel(ctx.config.server.job_queue_capacity);
    let worker = JobWorker::new(demo.clone(), sweeper.clone()).spawn(rx);

    let cancel = CancellationToken::new();
    let timer = sweeper.spawn_timer(jobs.clone(), cancel.clone());

    let state = AppState::new(demo.clone(), jobs)
        .with_allowed_origins(ctx.config.server.allowed_origins.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on http://{}", addr);

    let terminate_on_shutdown = ctx.config.sessions.terminate_on_shutdown;
    let shutdown_demo = demo.clone();
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_cancel.cancel();
            if terminate_on_shutdown {
                info!("Terminating active demo sessions");
                match shutdown_demo.terminate_all_active().await {
                    Ok(count) => info!("Terminated {} sessions", count),
                    Err(e) => warn!("Failed to terminate sessions on shutdown: {}", e),
                }
            }
        })
        .await
        .context("running HTTP server")?;

    cancel.cancel();
    let _ = timer.await;
    // The worker exits once the router and the timer dropped their queue handles.
    if tokio::time::timeout(Duration::from_secs(30), worker)
        .await
        .is_err()
    {
        warn!("Job worker did not finish in time");
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn handle_sweep(ctx: &RuntimeContext) -> Result<()> {
    if ctx.common.dry_run {
        info!("dry-run: would run a full reconciliation pass");
        return Ok(());
    }
    let Services { sweeper, .. } = build_services(ctx).await?;
    let report = sweeper.sweep_sessions(SweepScope::Full).await?;
    print_report(&ctx.common, &report)
}

fn print_report(common: &CommonOpts, report: &SweepReport) -> Result<()> {
    if common.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else if common.yaml {
        print!("{}", serde_yaml::to_string(report)?);
    } else if !common.quiet {
        println!("recovered        {}", report.recovered);
        println!("terminated       {}", report.terminated);
        println!("frozen           {}", report.frozen);
        println!("skipped          {}", report.skipped);
        println!("failed           {}", report.failed);
        println!("orphans removed  {}", report.orphans_removed);
        println!("routes published {}", report.routes_published);
        println!("routes withdrawn {}", report.routes_withdrawn);
        println!("purged           {}", report.purged);
    }
    Ok(())
}

async fn handle_sessions(ctx: &RuntimeContext, cmd: SessionsCommand) -> Result<()> {
    let Services { demo, .. } = build_services(ctx).await?;
    match cmd {
        SessionsCommand::List { all, limit } => {
            let views: Vec<SessionView> = if all {
                demo.repository()
                    .list_recent(limit)
                    .await?
                    .into_iter()
                    .map(|s| SessionView::from_session(s, None))
                    .collect()
            } else {
                demo.list_active_sessions().await?
            };

            if ctx.common.json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else if ctx.common.yaml {
                print!("{}", serde_yaml::to_string(&views)?);
            } else if views.is_empty() {
                if !ctx.common.quiet {
                    println!("No sessions");
                }
            } else {
                for view in &views {
                    println!(
                        "{}  {:<20} {:<16} {:<12} {}",
                        view.id,
                        view.project_name,
                        view.username,
                        view.state.as_str(),
                        view.host_port
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }
        SessionsCommand::Terminate { session_id } => {
            if ctx.common.dry_run {
                info!("dry-run: would terminate session {session_id}");
                return Ok(());
            }
            let changed = demo.terminate_session(&session_id).await?;
            if !ctx.common.quiet {
                if changed {
                    println!("Terminated {session_id}");
                } else {
                    println!("Session {session_id} was already finished");
                }
            }
        }
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)?;
    if !ctx.common.quiet {
        println!("Wrote {}", ctx.paths.config_file.display());
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!("{}", serde_json::to_string_pretty(&ctx.config)?);
            } else if ctx.common.yaml {
                print!("{}", serde_yaml::to_string(&ctx.config)?);
            } else {
                println!("{:#?}", ctx.config);
            }
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
            } else {
                write_default_config(&ctx.paths.config_file)?;
            }
        }
    }
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, 8080);
        assert_eq!(parsed.projects.len(), 1);
        assert_eq!(parsed.projects[0].credentials.len(), 2);
        assert!(parsed.sessions.terminate_on_shutdown);
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "VITRINE");
    }

    #[test]
    fn test_sweeper_config_conversion() {
        let settings = SessionSettings {
            inactivity_timeout_seconds: 120,
            freeze_after_seconds: Some(30),
            retention_hours: 2,
            sweep_interval_seconds: 0,
            orphan_sweep_every: 0,
            retry_delay_ms: 10,
            terminate_on_shutdown: false,
        };
        let cfg = settings.sweeper_config();
        assert_eq!(cfg.inactivity_timeout, Duration::from_secs(120));
        assert_eq!(cfg.freeze_after, Some(Duration::from_secs(30)));
        assert_eq!(cfg.retention, Duration::from_secs(7200));
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.orphan_every, 1);
    }

    #[test]
    fn test_cli_parses_serve_overrides() {
        let cli = Cli::try_parse_from(["vitrine", "-v", "serve", "--port", "9000"]).unwrap();
        assert_eq!(cli.common.verbose, 1);
        match cli.command {
            Command::Serve(cmd) => {
                assert_eq!(cmd.port, Some(9000));
                assert!(cmd.host.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
