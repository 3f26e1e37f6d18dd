//! Agent configuration

use bored_impersonation::{ImpersonationFilter, JwtImpersonator};
use bored_transport::{BrokerCredentials, DEFAULT_CONNECT_TIMEOUT};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{ClientError, ReconnectConfig};

pub const DEFAULT_CA_CERT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
pub const DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_BACKEND_HOST: &str = "kubernetes.default.svc";
pub const DEFAULT_BACKEND_PORT: u16 = 443;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How the backend's certificate is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendVerification {
    /// Strict if the CA bundle exists, disabled otherwise
    #[default]
    Auto,
    /// Chain and hostname verification against the CA bundle
    Strict,
    /// Accept any certificate (INSECURE)
    Disabled,
}

impl FromStr for BackendVerification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "strict" => Ok(Self::Strict),
            "disabled" | "insecure" => Ok(Self::Disabled),
            other => Err(format!(
                "invalid backend verification mode '{}' (expected auto, strict or disabled)",
                other
            )),
        }
    }
}

impl std::fmt::Display for BackendVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Strict => write!(f, "strict"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// The protected server every stream is relayed to
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// PEM bundle of trusted roots
    pub ca_cert_path: Option<PathBuf>,
    pub verification: BackendVerification,
    pub dial_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BACKEND_HOST.to_string(),
            port: DEFAULT_BACKEND_PORT,
            ca_cert_path: Some(PathBuf::from(DEFAULT_CA_CERT_PATH)),
            verification: BackendVerification::Auto,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

impl BackendConfig {
    /// Backend address from `KUBERNETES_HOST` / `KUBERNETES_SERVICE_PORT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("KUBERNETES_HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }

        if let Some(port) = lookup("KUBERNETES_SERVICE_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) if port != 0 => config.port = port,
                _ => warn!(
                    "Ignoring invalid KUBERNETES_SERVICE_PORT '{}', using {}",
                    port, DEFAULT_BACKEND_PORT
                ),
            }
        }

        config
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Identity impersonation settings
#[derive(Debug, Clone, Default)]
pub struct ImpersonationConfig {
    /// Identity provider public key (PEM); empty disables impersonation
    pub idp_public_key: String,
    pub service_account_token_path: Option<PathBuf>,
}

impl ImpersonationConfig {
    /// Build the filter when both the IdP key and a service-account token are present
    ///
    /// A missing piece disables impersonation. An IdP key that cannot be
    /// parsed is a configuration error.
    pub fn build_filter(&self) -> Result<Option<Arc<dyn ImpersonationFilter>>, ClientError> {
        if self.idp_public_key.trim().is_empty() {
            info!("No identity provider key configured, impersonation disabled");
            return Ok(None);
        }

        let Some(path) = &self.service_account_token_path else {
            info!("No service account token path configured, impersonation disabled");
            return Ok(None);
        };

        let token = match std::fs::read_to_string(path) {
            Ok(token) if !token.trim().is_empty() => token,
            Ok(_) => {
                info!(
                    "Service account token {} is empty, impersonation disabled",
                    path.display()
                );
                return Ok(None);
            }
            Err(e) => {
                info!(
                    "Service account token {} not readable ({}), impersonation disabled",
                    path.display(),
                    e
                );
                return Ok(None);
            }
        };

        let filter = JwtImpersonator::new(&self.idp_public_key, &token)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        info!("Impersonation enabled");
        Ok(Some(Arc::new(filter)))
    }
}

/// Everything the tunnel client needs
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub credentials: BrokerCredentials,
    pub backend: BackendConfig,
    pub impersonation: ImpersonationConfig,
    pub reconnect: ReconnectConfig,
    /// Upper bound on one broker dial, upgrade included
    pub connect_timeout: Duration,
    /// How long live streams may drain on shutdown
    pub shutdown_grace: Duration,
}

impl AgentConfig {
    pub fn new(credentials: BrokerCredentials) -> Self {
        Self {
            credentials,
            backend: BackendConfig::default(),
            impersonation: ImpersonationConfig {
                idp_public_key: String::new(),
                service_account_token_path: Some(PathBuf::from(
                    DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH,
                )),
            },
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.credentials.server_url.trim().is_empty() {
            return Err(ClientError::Config("broker URL is required".to_string()));
        }
        if self.credentials.bearer_token.trim().is_empty() {
            return Err(ClientError::Config("broker token is required".to_string()));
        }
        self.credentials
            .connect_url()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        if self.backend.host.is_empty() {
            return Err(ClientError::Config("backend host is empty".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::Config(
                "broker connect timeout must be greater than zero".to_string(),
            ));
        }
        self.reconnect.validate().map_err(ClientError::Config)?;
        Ok(())
    }
}
