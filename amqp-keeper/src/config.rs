use crate::message::HeaderValue;
use anyhow::Result;
use serde_derive::Deserialize;
use std::collections::HashMap;
use url::Url;

pub const DEFAULT_VIRTUAL_HOST: &str = "/";
pub const DEFAULT_PORT: u16 = 5672;

/// Connection parameters of a [`crate::Client`].
///
/// Every field has a default, so a TOML file needs to list only what differs:
///
/// ```toml
/// host = "rabbit.local"
/// queue = "orders"
/// prefetch_count = 16
///
/// [arguments]
/// x-max-length = 10000
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Queue the client consumes from and the default routing key of publishes.
    pub queue: String,
    /// Exchange of publishes. Empty means the default exchange.
    pub exchange: String,
    pub user_name: String,
    pub password: String,
    /// Count-based QoS applied to the channel, 0 means unlimited.
    pub prefetch_count: u16,
    /// Extra arguments of the queue declaration.
    pub arguments: HashMap<String, HeaderValue>,
    /// Content type of publishes, `application/json` if empty.
    pub content_type: String,
    pub virtual_host: String,
    /// Client properties sent to the broker during the handshake.
    pub properties: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            queue: String::new(),
            exchange: String::new(),
            user_name: "guest".to_owned(),
            password: "guest".to_owned(),
            prefetch_count: 0,
            arguments: HashMap::new(),
            content_type: String::new(),
            virtual_host: DEFAULT_VIRTUAL_HOST.to_owned(),
            properties: HashMap::new(),
        }
    }
}

impl Config {
    /// Builds the config from `AMQP_*` environment variables. Missing or unparsable values
    /// keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let defaults = Config::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        Config {
            host: string("AMQP_HOST", defaults.host),
            port: lookup("AMQP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            queue: string("AMQP_QUEUE", defaults.queue),
            exchange: string("AMQP_EXCHANGE", defaults.exchange),
            user_name: string("AMQP_USER", defaults.user_name),
            password: string("AMQP_PASSWORD", defaults.password),
            prefetch_count: lookup("AMQP_PREFETCH_COUNT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.prefetch_count),
            content_type: string("AMQP_CONTENT_TYPE", defaults.content_type),
            virtual_host: string("AMQP_VIRTUAL_HOST", defaults.virtual_host),
            ..defaults
        }
    }

    /// `host:port`, used as the context of every log line and error.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// AMQP URI of the broker. The virtual host goes to the path percent-encoded, so the
    /// default `/` becomes `%2F`.
    pub fn url(&self) -> Result<String> {
        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))?;

        url.set_username(&self.user_name)
            .map_err(|_| anyhow::anyhow!("Cannot set user name on {}", self.addr()))?;
        url.set_password(Some(&self.password))
            .map_err(|_| anyhow::anyhow!("Cannot set password on {}", self.addr()))?;

        let vhost: String = url::form_urlencoded::byte_serialize(self.virtual_host.as_bytes()).collect();
        url.set_path(&format!("/{vhost}"));

        Ok(url.to_string())
    }

    /// The URI with the password masked, safe for logging.
    pub fn redacted_url(&self) -> String {
        let masked = Config {
            password: "****".to_owned(),
            ..self.clone()
        };

        masked.url().unwrap_or_else(|_| self.addr())
    }
}

/// Reads a TOML config file.
pub fn parse_config(path: &str) -> Result<Config> {
    let cfg = std::fs::read_to_string(path)?;

    parse_config_str(&cfg)
}

pub fn parse_config_str(cfg: &str) -> Result<Config> {
    Ok(toml::from_str(cfg)?)
}
