use crate::auth::Signer;
use crate::policy::{
    AuthPolicy, CloseInactive, ConnectOnSend, DeferOnAuth, LimitRequests, RetryAuthRequired,
    SendWhenOpen, SocketPolicy,
};
use crate::publish::PublishOptions;
use crate::request::RequestOptions;
use crate::transport::WebSocketTransport;
use config::{Config as ConfigTree, ConfigError, Environment, File};
use nostr::{Keys, SecretKey};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const ENVIRONMENT_PREFIX: &str = "NOSTR_NET";
const CONFIG_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize)]
pub struct NetSettings {
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_publish_timeout")]
    pub publish_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub request_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default = "default_auth_timeout")]
    pub auth_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_error_cooldown")]
    pub error_cooldown: Duration,
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(
        default = "default_auth_retry_attempts",
        deserialize_with = "validate_auth_retry_attempts"
    )]
    pub auth_retry_attempts: u32,
    #[serde(default, deserialize_with = "validate_max_inflight_requests")]
    pub max_inflight_requests: Option<usize>,
    #[serde(default)]
    pub eager_auth: bool,
    /// Relays eager auth is limited to. Empty means every relay.
    #[serde(default)]
    pub auth_relays: Vec<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_auth_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_error_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_auth_retry_attempts() -> u32 {
    1
}

fn validate_auth_retry_attempts<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let attempts = u32::deserialize(deserializer)?;
    if attempts == 0 {
        return Err(D::Error::custom("auth_retry_attempts must be greater than 0"));
    }
    Ok(attempts)
}

fn validate_max_inflight_requests<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let max = Option::<usize>::deserialize(deserializer)?;
    if max == Some(0) {
        return Err(D::Error::custom(
            "max_inflight_requests must be greater than 0",
        ));
    }
    Ok(max)
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            connect_timeout: default_connect_timeout(),
            publish_timeout: default_publish_timeout(),
            request_timeout: None,
            auth_timeout: default_auth_timeout(),
            error_cooldown: default_error_cooldown(),
            idle_timeout: default_idle_timeout(),
            auth_retry_attempts: default_auth_retry_attempts(),
            max_inflight_requests: None,
            eager_auth: false,
            auth_relays: Vec::new(),
            secret_key: None,
        }
    }
}

impl NetSettings {
    /// Policy stack for pooled sockets, in application order.
    pub fn policies(&self) -> Vec<Arc<dyn SocketPolicy>> {
        let mut policies: Vec<Arc<dyn SocketPolicy>> = vec![
            Arc::new(SendWhenOpen),
            Arc::new(DeferOnAuth),
            Arc::new(RetryAuthRequired::new(self.auth_retry_attempts)),
            Arc::new(ConnectOnSend::new(self.error_cooldown)),
            Arc::new(CloseInactive::new(self.idle_timeout)),
        ];
        if let Some(max) = self.max_inflight_requests {
            policies.push(Arc::new(LimitRequests::new(max)));
        }
        policies
    }

    pub fn transport(&self) -> WebSocketTransport {
        WebSocketTransport::new(self.connect_timeout)
    }

    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            timeout: self.publish_timeout,
        }
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: self.request_timeout,
            ..Default::default()
        }
    }

    pub fn keys(&self) -> Result<Option<Keys>, anyhow::Error> {
        let Some(secret_key) = &self.secret_key else {
            return Ok(None);
        };
        let secret_key = SecretKey::parse(secret_key)?;
        Ok(Some(Keys::new(secret_key)))
    }

    pub fn signer(&self) -> Result<Option<Arc<dyn Signer>>, anyhow::Error> {
        Ok(self
            .keys()?
            .map(|keys| Arc::new(keys) as Arc<dyn Signer>))
    }

    /// Policy answering challenges with the configured key, when eager auth
    /// is on and a key is set.
    pub fn auth_policy(&self) -> Result<Option<Arc<dyn SocketPolicy>>, anyhow::Error> {
        if !self.eager_auth {
            return Ok(None);
        }
        let Some(signer) = self.signer()? else {
            return Ok(None);
        };
        let policy = if self.auth_relays.is_empty() {
            AuthPolicy::new(signer)
        } else {
            AuthPolicy::for_relays(signer, &self.auth_relays)
        };
        Ok(Some(Arc::new(policy)))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    config: ConfigTree,
}

impl Config {
    /// Layers `settings.yml`, `settings.{environment}.yml`,
    /// `settings.local.yml` and `NOSTR_NET__*` variables. Every file is
    /// optional.
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let environment =
            std::env::var(format!("{ENVIRONMENT_PREFIX}{CONFIG_SEPARATOR}ENVIRONMENT"))
                .unwrap_or_else(|_| "development".into());

        let config_dir = config_dir.as_ref();
        let default_config = config_dir.join("settings.yml");
        let env_config = config_dir.join(format!("settings.{}.yml", environment));
        let local_config = config_dir.join("settings.local.yml");

        let config = ConfigTree::builder()
            .add_source(File::from(default_config).required(false))
            .add_source(File::from(env_config).required(false))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix(ENVIRONMENT_PREFIX)
                    .separator(CONFIG_SEPARATOR)
                    .list_separator(",")
                    .with_list_parse_key("net.relays")
                    .with_list_parse_key("net.auth_relays")
                    .try_parsing(true),
            )
            .build()?;

        Ok(Config { config })
    }

    pub fn get_settings(&self) -> Result<NetSettings, ConfigError> {
        let settings = match self.config.get::<NetSettings>("net") {
            Ok(settings) => settings,
            Err(ConfigError::NotFound(_)) => NetSettings::default(),
            Err(e) => return Err(e),
        };
        tracing::debug!(
            "Net config: relays={:?}, publish_timeout={:?}, request_timeout={:?}, error_cooldown={:?}, idle_timeout={:?}, max_inflight_requests={:?}",
            settings.relays,
            settings.publish_timeout,
            settings.request_timeout,
            settings.error_cooldown,
            settings.idle_timeout,
            settings.max_inflight_requests,
        );
        Ok(settings)
    }
}
