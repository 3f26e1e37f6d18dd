//! bored-agent - reverse-tunnel agent
//!
//! Keeps an outbound connection to a bored broker and relays the streams it
//! opens to the cluster API server.

use anyhow::{Context, Result};
use bored_crypto::{FileKeyProvider, GeneratedKeyProvider, KeyProvider};
use bored_transport::{BrokerCredentials, DEFAULT_CONNECT_TIMEOUT};
use bored_tunnel::config::{
    DEFAULT_BACKEND_HOST, DEFAULT_BACKEND_PORT, DEFAULT_CA_CERT_PATH,
    DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH, DEFAULT_SHUTDOWN_GRACE,
};
use bored_tunnel::{
    AgentConfig, BackendConfig, BackendVerification, ImpersonationConfig, ReconnectConfig,
    TunnelClient,
};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// bored reverse-tunnel agent
#[derive(Parser, Debug)]
#[command(name = "bored-agent")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
bored-agent dials a bored broker, presents its public key, and relays every
stream the broker opens to the Kubernetes API server over TLS. Stream
payloads are end-to-end encrypted between the broker's clients and the agent.

EXAMPLES:
  # Run in-cluster with the service account mounts
  bored-agent --bored-server https://bored.example.com --bored-token $TOKEN

  # Run from a config file, overriding the log level
  bored-agent --config agent.yaml --log-level debug

ENVIRONMENT VARIABLES:
  BORED_SERVER               Broker URL
  BORED_TOKEN                Broker bearer token
  IDP_PUBLIC_KEY             PEM public key of the identity provider
  CA_CERT_PATH               CA bundle for the API server
  SERVICEACCOUNT_TOKEN_PATH  Service account token used for impersonation
  KUBERNETES_HOST            API server host
  KUBERNETES_SERVICE_PORT    API server port
  BACKEND_VERIFICATION       auto, strict or disabled
  BORED_AGENT_KEY_FILE       Persistent agent key file
"#)]
struct Args {
    /// Broker URL (http(s):// or ws(s)://)
    #[arg(long, env = "BORED_SERVER")]
    bored_server: Option<String>,

    /// Broker bearer token
    #[arg(long, env = "BORED_TOKEN", hide_env_values = true)]
    bored_token: Option<String>,

    /// Identity provider public key (PEM); empty disables impersonation
    #[arg(long, env = "IDP_PUBLIC_KEY", hide_env_values = true)]
    idp_public_key: Option<String>,

    /// CA bundle used to verify the API server
    #[arg(long, env = "CA_CERT_PATH")]
    ca_cert_path: Option<PathBuf>,

    /// Service account token presented to the API server when impersonating
    #[arg(long, env = "SERVICEACCOUNT_TOKEN_PATH")]
    service_account_token_path: Option<PathBuf>,

    /// API server host
    #[arg(long, env = "KUBERNETES_HOST")]
    backend_host: Option<String>,

    /// API server port
    #[arg(long, env = "KUBERNETES_SERVICE_PORT")]
    backend_port: Option<u16>,

    /// API server certificate verification (auto, strict, disabled)
    #[arg(long, env = "BACKEND_VERIFICATION")]
    backend_verification: Option<BackendVerification>,

    /// Agent private key file, created if missing (default: fresh key per run)
    #[arg(long, env = "BORED_AGENT_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Initial reconnection delay in milliseconds
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    /// Maximum reconnection delay in milliseconds
    #[arg(long)]
    max_reconnect_delay_ms: Option<u64>,

    /// How long live streams may finish on shutdown, in milliseconds
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,

    /// Give up on a broker dial after this many milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    server: Option<String>,
    token: Option<String>,
    idp_public_key: Option<String>,
    service_account_token_path: Option<PathBuf>,
    key_file: Option<PathBuf>,
    backend: BackendFile,
    reconnect: Option<ReconnectConfig>,
    shutdown_grace_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BackendFile {
    host: Option<String>,
    port: Option<u16>,
    ca_cert_path: Option<PathBuf>,
    verification: Option<BackendVerification>,
}

/// Resolved settings for one agent process
#[derive(Debug)]
struct Settings {
    agent: AgentConfig,
    key_file: Option<PathBuf>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge flags and environment over the config file over defaults
fn build_settings(args: Args, file: ConfigFile) -> Result<Settings> {
    let server_url = args.bored_server.or(file.server).unwrap_or_default();
    let bearer_token = args.bored_token.or(file.token).unwrap_or_default();

    if server_url.trim().is_empty() {
        anyhow::bail!("Broker URL is required (use --bored-server, BORED_SERVER or config file)");
    }
    if bearer_token.trim().is_empty() {
        anyhow::bail!("Broker token is required (use --bored-token, BORED_TOKEN or config file)");
    }

    let backend = BackendConfig {
        host: args
            .backend_host
            .or(file.backend.host)
            .unwrap_or_else(|| DEFAULT_BACKEND_HOST.to_string()),
        port: args
            .backend_port
            .or(file.backend.port)
            .unwrap_or(DEFAULT_BACKEND_PORT),
        ca_cert_path: Some(
            args.ca_cert_path
                .or(file.backend.ca_cert_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CA_CERT_PATH)),
        ),
        verification: args
            .backend_verification
            .or(file.backend.verification)
            .unwrap_or_default(),
        ..BackendConfig::default()
    };

    let impersonation = ImpersonationConfig {
        idp_public_key: args
            .idp_public_key
            .or(file.idp_public_key)
            .unwrap_or_default(),
        service_account_token_path: Some(
            args.service_account_token_path
                .or(file.service_account_token_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH)),
        ),
    };

    let mut reconnect = file.reconnect.unwrap_or_default();
    if let Some(ms) = args.reconnect_delay_ms {
        reconnect.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = args.max_reconnect_delay_ms {
        reconnect.max_backoff = Duration::from_millis(ms);
    }
    reconnect.validate().map_err(anyhow::Error::msg)?;

    let shutdown_grace = args
        .shutdown_grace_ms
        .or(file.shutdown_grace_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SHUTDOWN_GRACE);

    let connect_timeout = args
        .connect_timeout_ms
        .or(file.connect_timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    if connect_timeout.is_zero() {
        anyhow::bail!("Broker connect timeout must be greater than zero");
    }

    Ok(Settings {
        agent: AgentConfig {
            credentials: BrokerCredentials {
                server_url,
                bearer_token,
            },
            backend,
            impersonation,
            reconnect,
            connect_timeout,
            shutdown_grace,
        },
        key_file: args.key_file.or(file.key_file),
    })
}

fn key_provider(key_file: Option<PathBuf>) -> Box<dyn KeyProvider> {
    match key_file {
        Some(path) => {
            info!("Agent key file: {}", path.display());
            Box::new(FileKeyProvider::new(path))
        }
        None => {
            info!("No key file configured, generating an ephemeral agent key");
            Box::new(GeneratedKeyProvider)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("bored-agent {} ({}) starting...", env!("GIT_TAG"), env!("GIT_HASH"));

    let file = match args.config.take() {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(&path)?
        }
        None => ConfigFile::default(),
    };
    let settings = build_settings(args, file).context("Failed to build agent configuration")?;

    // Log configuration (but not the tokens)
    info!("Broker: {}", settings.agent.credentials.server_url);
    info!("Backend: {}", settings.agent.backend.address());

    let identity = key_provider(settings.key_file)
        .load()
        .context("Failed to load agent key")?;

    let client = TunnelClient::new(settings.agent).context("Failed to create tunnel client")?;
    client
        .initialize(identity)
        .context("Failed to initialize tunnel client")?;

    client
        .run_until_shutdown(shutdown_signal())
        .await
        .context("Tunnel client failed")?;

    info!("bored-agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("bored-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_config_file() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
server: https://file.example.com
token: file-token
backend:
  host: 10.0.0.1
  port: 6443
  verification: strict
reconnect:
  initial_backoff: 500
  max_backoff: 10000
"#,
        )
        .unwrap();

        let settings = build_settings(
            parse(&[
                "--bored-server",
                "https://flag.example.com",
                "--backend-port",
                "8443",
                "--max-reconnect-delay-ms",
                "20000",
            ]),
            file,
        )
        .unwrap();

        let agent = settings.agent;
        assert_eq!(agent.credentials.server_url, "https://flag.example.com");
        assert_eq!(agent.credentials.bearer_token, "file-token");
        assert_eq!(agent.backend.address(), "10.0.0.1:8443");
        assert_eq!(agent.backend.verification, BackendVerification::Strict);
        assert_eq!(agent.reconnect.initial_backoff, Duration::from_millis(500));
        assert_eq!(agent.reconnect.max_backoff, Duration::from_secs(20));
    }

    #[test]
    fn test_defaults() {
        let settings = build_settings(
            parse(&["--bored-server", "https://b.example.com", "--bored-token", "t"]),
            ConfigFile::default(),
        )
        .unwrap();

        let agent = settings.agent;
        assert_eq!(agent.backend.address(), "kubernetes.default.svc:443");
        assert_eq!(agent.backend.verification, BackendVerification::Auto);
        assert_eq!(
            agent.backend.ca_cert_path.as_deref(),
            Some(Path::new(DEFAULT_CA_CERT_PATH))
        );
        assert!(agent.impersonation.idp_public_key.is_empty());
        assert_eq!(agent.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
        assert_eq!(agent.reconnect.max_backoff, Duration::from_secs(30));
        assert_eq!(agent.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(settings.key_file.is_none());
    }

    #[test]
    fn test_connect_timeout_from_file_and_flag() {
        let file: ConfigFile = serde_yaml::from_str(
            "server: https://b.example.com\ntoken: t\nconnect_timeout_ms: 2500\n",
        )
        .unwrap();
        let settings = build_settings(parse(&[]), file).unwrap();
        assert_eq!(settings.agent.connect_timeout, Duration::from_millis(2500));

        let settings = build_settings(
            parse(&[
                "--bored-server",
                "https://b.example.com",
                "--bored-token",
                "t",
                "--connect-timeout-ms",
                "750",
            ]),
            ConfigFile::default(),
        )
        .unwrap();
        assert_eq!(settings.agent.connect_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_invalid_reconnect_settings_are_rejected() {
        for yaml in [
            "reconnect:\n  multiplier: -1\n",
            "reconnect:\n  jitter: 4.0\n",
            "reconnect:\n  initial_backoff: 0\n",
            "reconnect:\n  initial_backoff: 60000\n  max_backoff: 1000\n",
            "connect_timeout_ms: 0\n",
        ] {
            let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
            let result = build_settings(
                parse(&["--bored-server", "https://b.example.com", "--bored-token", "t"]),
                file,
            );
            assert!(result.is_err(), "{} should be rejected", yaml.trim());
        }
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let result = build_settings(
            parse(&["--bored-server", "https://b.example.com"]),
            ConfigFile::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_insecure_alias_for_verification() {
        let args = parse(&["--backend-verification", "insecure"]);
        assert_eq!(args.backend_verification, Some(BackendVerification::Disabled));
    }

    #[test]
    fn test_unknown_config_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        fs::write(&path, "server: https://b.example.com\nrelay: nope\n").unwrap();
        assert!(load_config_file(&path).is_err());
    }
}
