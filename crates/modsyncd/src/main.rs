// # modsyncd - Moderation Sync Daemon
//
// Thin integration layer: reads configuration from the environment, wires
// the Discord gateway and REST platform into the engine, and turns process
// signals into a clean shutdown. All replication logic lives in
// modsync-core.
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Required
// - `MODSYNC_GUILDS`: Comma-separated guild ids to keep in sync (alias `SERVERS`)
// - `MODSYNC_DISCORD_TOKEN`: Bot token (alias `DISCORD_TOKEN`)
//
// ### Engine
// - `MODSYNC_MUTATION_TIMEOUT_SECS`: Bound for one mutation call (default 10)
// - `MODSYNC_MAX_RETRIES`: Retries for transient failures (default 2)
// - `MODSYNC_RETRY_DELAY_MS`: Delay between retries (default 500)
// - `MODSYNC_BAN_DELETE_MESSAGE_SECS`: Message history a replicated ban deletes (default 86400)
// - `MODSYNC_ECHO_WINDOW_SECS`: Echo recognition window, 0 disables (default 15)
//
// ### Runtime
// - `MODSYNC_MODE`: `live` (default) or `dry-run`
// - `MODSYNC_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Exit codes
//
// - 0: Shutdown on SIGINT/SIGTERM
// - 1: Configuration or startup error
// - 2: Runtime error, including the gateway session ending on its own
//
// ## Example
//
// ```bash
// export MODSYNC_GUILDS=123456789012345678,234567890123456789
// export MODSYNC_DISCORD_TOKEN=your_bot_token
// export MODSYNC_MODE=dry-run
//
// modsyncd
// ```

use anyhow::Result;
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use modsync_core::config::MAX_BAN_DELETE_MESSAGE_SECS;
use modsync_core::{EngineConfig, ModSyncConfig, ModSyncEngine, MonitoredGuilds};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long a running fan-out may delay shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum ModSyncExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<ModSyncExitCode> for ExitCode {
    fn from(code: ModSyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// How the daemon ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Signal(&'static str),
    SourceClosed,
}

/// Application configuration
struct Config {
    guilds: MonitoredGuilds,
    token: String,
    dry_run: bool,
    engine: EngineConfig,
    log_level: String,
}

// Custom Debug implementation that hides the bot token
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("guilds", &self.guilds.len())
            .field("token", &"<REDACTED>")
            .field("dry_run", &self.dry_run)
            .field("engine", &self.engine)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str, alias: Option<&str>| {
            lookup(name)
                .or_else(|| alias.and_then(|alias| lookup(alias)))
                .filter(|value| !value.trim().is_empty())
        };

        let Some(guild_list) = var("MODSYNC_GUILDS", Some("SERVERS")) else {
            anyhow::bail!(
                "MODSYNC_GUILDS is required. \
                Set it via: export MODSYNC_GUILDS=123456789012345678,234567890123456789"
            );
        };
        let guilds = MonitoredGuilds::parse(&guild_list)
            .map_err(|e| anyhow::anyhow!("MODSYNC_GUILDS is invalid: {}", e))?;

        let Some(token) = var("MODSYNC_DISCORD_TOKEN", Some("DISCORD_TOKEN")) else {
            anyhow::bail!(
                "MODSYNC_DISCORD_TOKEN is required. \
                Set it via: export MODSYNC_DISCORD_TOKEN=your_bot_token"
            );
        };

        let dry_run = match var("MODSYNC_MODE", None).as_deref().map(str::trim) {
            None | Some("live") => false,
            Some("dry-run") => true,
            Some(other) => anyhow::bail!(
                "MODSYNC_MODE '{}' is not valid. Valid modes: live, dry-run",
                other
            ),
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            mutation_timeout_secs: number(
                &var,
                "MODSYNC_MUTATION_TIMEOUT_SECS",
                defaults.mutation_timeout_secs,
            )?,
            max_retries: number(&var, "MODSYNC_MAX_RETRIES", defaults.max_retries)?,
            retry_delay_ms: number(&var, "MODSYNC_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            ban_delete_message_secs: number(
                &var,
                "MODSYNC_BAN_DELETE_MESSAGE_SECS",
                defaults.ban_delete_message_secs,
            )?,
            echo_window_secs: number(&var, "MODSYNC_ECHO_WINDOW_SECS", defaults.echo_window_secs)?,
            ..defaults
        };

        Ok(Self {
            guilds,
            token: token.trim().to_string(),
            dry_run,
            engine,
            log_level: var("MODSYNC_LOG_LEVEL", None).unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Checks the token for obvious mistakes and every numeric setting
    /// against its allowed range.
    fn validate(&self) -> Result<()> {
        // Bot tokens are three dot-separated base64 segments, 59+ characters
        if self.token.len() < 50 {
            anyhow::bail!(
                "MODSYNC_DISCORD_TOKEN appears too short ({} chars). \
                Copy the bot token from the developer portal.",
                self.token.len()
            );
        }

        let token_lower = self.token.to_lowercase();
        if token_lower.contains("your_bot_token")
            || token_lower.contains("replace_me")
            || token_lower.starts_with("bot ")
        {
            anyhow::bail!(
                "MODSYNC_DISCORD_TOKEN appears to be a placeholder or carries a 'Bot ' prefix. \
                Use the bare bot token."
            );
        }

        let engine = &self.engine;
        if !(1..=120).contains(&engine.mutation_timeout_secs) {
            anyhow::bail!(
                "MODSYNC_MUTATION_TIMEOUT_SECS must be between 1 and 120 seconds. Got: {}",
                engine.mutation_timeout_secs
            );
        }

        if engine.max_retries > 10 {
            anyhow::bail!(
                "MODSYNC_MAX_RETRIES must be between 0 and 10. Got: {}",
                engine.max_retries
            );
        }

        if engine.retry_delay_ms > 60_000 {
            anyhow::bail!(
                "MODSYNC_RETRY_DELAY_MS must be between 0 and 60000. Got: {}",
                engine.retry_delay_ms
            );
        }

        if engine.ban_delete_message_secs > MAX_BAN_DELETE_MESSAGE_SECS {
            anyhow::bail!(
                "MODSYNC_BAN_DELETE_MESSAGE_SECS must be between 0 and {}. Got: {}",
                MAX_BAN_DELETE_MESSAGE_SECS,
                engine.ban_delete_message_secs
            );
        }

        // Validate log level
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "MODSYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn engine_config(&self) -> ModSyncConfig {
        ModSyncConfig {
            guilds: self.guilds.iter().collect(),
            engine: self.engine.clone(),
        }
    }
}

/// Parse an optional numeric variable, falling back to `default` when unset
fn number<T: FromStr>(
    var: impl Fn(&str, Option<&str>) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match var(name, None) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer. Got: '{}'", name, raw)),
        None => Ok(default),
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ModSyncExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return ModSyncExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ModSyncExitCode::ConfigError.into();
    }

    info!("Starting modsyncd daemon");
    info!(
        "Configuration loaded: {} monitored guild(s){}",
        config.guilds.len(),
        if config.dry_run { ", dry-run mode" } else { "" }
    );
    if config.guilds.len() < 2 {
        warn!("Only one guild is monitored, nothing will be replicated");
    }

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ModSyncExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        match run_daemon(config).await {
            Ok(Termination::Signal(signal)) => {
                info!("Shut down after {}", signal);
                ModSyncExitCode::CleanShutdown
            }
            Ok(Termination::SourceClosed) => {
                error!("Gateway session ended unexpectedly");
                ModSyncExitCode::RuntimeError
            }
            Err(e) => {
                error!("Daemon error: {}", e);
                ModSyncExitCode::RuntimeError
            }
        }
    });

    result.into()
}

/// Run the daemon until a signal arrives or the gateway session ends
async fn run_daemon(config: Config) -> Result<Termination> {
    let (gateway, platform) = modsync_discord::connect(config.token.clone(), config.dry_run)?;

    let (engine, mut events) =
        ModSyncEngine::new(Box::new(gateway), Arc::new(platform), config.engine_config())?;

    // Outcomes are already logged by the engine; keep the channel drained
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!("Engine event: {:?}", event);
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let run = engine.run_with_shutdown(Some(shutdown_rx));
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => {
            result?;
            Ok(Termination::SourceClosed)
        }
        signal = wait_for_shutdown() => {
            let signal = signal?;
            info!("Received shutdown signal: {}", signal);
            let _ = shutdown_tx.send(());

            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut run).await {
                Ok(result) => result?,
                Err(_) => anyhow::bail!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT),
            }
            Ok(Termination::Signal(signal))
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let signal = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signal)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
