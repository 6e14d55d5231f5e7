use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use chartmatch_sources::ProxySourceConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the service.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Fine-tuning the two persistent caches.
///
/// The proxy cache and the search cache are independent stores with independent TTLs:
/// proxies rot within hours, search resolutions stay useful much longer.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// How long a validated proxy address is trusted without re-validation.
    #[serde(with = "humantime_serde")]
    pub proxy_ttl: Duration,

    /// How long a search resolution (match or no-match) is reused.
    #[serde(with = "humantime_serde")]
    pub search_ttl: Duration,

    /// Number of buffered cache mutations before a durable writeback.
    pub write_batch_size: usize,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            proxy_ttl: Duration::from_secs(2 * 3600),
            search_ttl: Duration::from_secs(24 * 3600),
            write_batch_size: 10,
        }
    }
}

/// Fine-tuning the proxy pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    /// Number of fresh candidates validated concurrently.
    pub workers: usize,

    /// Validation attempts per candidate before it is given up on.
    ///
    /// Defaults to 1 (no retry); flaky-but-usable targets may warrant more.
    pub validation_retries: usize,

    /// The proxy-list sources to gather fresh candidates from.
    pub sources: Vec<ProxySourceConfig>,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            validation_retries: 1,
            sources: Vec::new(),
        }
    }
}

/// Fine-tuning the catalog resolver.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Number of catalog searches in flight at once.
    pub workers: usize,

    /// Minimum score below which a best candidate is recorded as "no match".
    pub min_confidence: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            min_confidence: 0.6,
        }
    }
}

/// The service configuration, loaded from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching. Default is not to cache.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Fine-tune cache expiry and writeback.
    pub caches: CacheConfigs,

    /// Configuration for the proxy pool.
    pub proxy: ProxyPoolConfig,

    /// Configuration for the catalog resolver.
    pub resolver: ResolverConfig,

    /// The timeout for establishing a connection in any network-bound attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving a response once connected.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Config {
    /// Return a cache file path for `file`, joined with the configured cache directory.
    ///
    /// If there is no cache directory configured this means no persistent caching
    /// should happen and this returns None.
    pub fn cache_path<P>(&self, file: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(file))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            caches: CacheConfigs::default(),
            proxy: ProxyPoolConfig::default(),
            resolver: ResolverConfig::default(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        // check for empty files explicitly
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
