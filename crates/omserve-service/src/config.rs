use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

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
    /// The log level for omserve.
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

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "omserve".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the hybrid (local or remote) resolution cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HybridCacheConfig {
    /// Entries that have not been accessed for this long are dropped by the sweep.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Duration,

    /// How often the background sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Blocks of a replaced remote file that were accessed more recently than this are kept
    /// around, as readers may still hold on to the old backend.
    #[serde(with = "humantime_serde")]
    pub block_grace: Duration,

    /// Blocks of a replaced remote file that were accessed within this window are preloaded
    /// into the new backend.
    #[serde(with = "humantime_serde")]
    pub preload_window: Duration,

    /// Whether to preload recently active blocks after a remote file was replaced.
    pub preload: bool,

    /// Log the accumulated sweep statistics every this many sweeps.
    pub log_stats_every: u32,

    /// Remote verdicts that were not refreshed for this long are forgotten.
    ///
    /// This should exceed `max_unused_for` plus the longest revalidation budget, so that
    /// verdicts of cached entries are refreshed before they are dropped.
    #[serde(with = "humantime_serde")]
    pub forget_versions_after: Duration,
}

impl Default for HybridCacheConfig {
    fn default() -> Self {
        Self {
            max_unused_for: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(10),
            block_grace: Duration::from_secs(60),
            preload_window: Duration::from_secs(15 * 60),
            preload: true,
            log_stats_every: 6,
            forget_versions_after: Duration::from_secs(60 * 60),
        }
    }
}

/// Fine-tuning of the local-only file cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Entries that have not been accessed for this long are dropped by the sweep.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Duration,

    /// How often the background sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Log the accumulated sweep statistics every this many sweeps.
    pub log_stats_every: u32,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_unused_for: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(10),
            log_stats_every: 6,
        }
    }
}

/// Sizing of the in-memory block cache for remote files.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Size of a single cached block in bytes.
    ///
    /// Defaults to `64 KiB`.
    pub block_size: u64,

    /// Capacity of the cache in bytes.
    ///
    /// The size limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `1 GiB`.
    pub capacity: u64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            capacity: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// The cache used when a remote origin is configured.
    pub hybrid: HybridCacheConfig,
    /// The cache used when only local files are served.
    pub local: LocalCacheConfig,
    /// The block cache backing remote files.
    pub blocks: BlockCacheConfig,
    /// Where to persist the remote version metadata. Default is to keep it in memory.
    pub versions_file: Option<PathBuf>,
}

/// Staleness budgets for the different classes of files.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RevalidationConfig {
    /// Metadata files (`*.json`) change with every model run.
    #[serde(with = "humantime_serde")]
    pub metadata: Duration,

    /// Data files that were modified recently, or whose existence is being checked.
    #[serde(with = "humantime_serde")]
    pub recent: Duration,

    /// Data files that have not been modified for longer than `archive_after`.
    #[serde(with = "humantime_serde")]
    pub archive: Duration,

    /// Data files older than this are considered archives.
    #[serde(with = "humantime_serde")]
    pub archive_after: Duration,
}

impl Default for RevalidationConfig {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(10),
            recent: Duration::from_secs(3 * 60),
            archive: Duration::from_secs(15 * 60),
            archive_after: Duration::from_secs(24 * 3600),
        }
    }
}

/// Various timeouts for requests to the remote origin.
#[derive(Copy, Clone, Debug)]
pub struct HttpTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for metadata (`HEAD`) requests.
    pub head: Duration,
    /// Global timeout for one range request.
    pub max_download: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
            max_download: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the local array files.
    pub data_dir: PathBuf,

    /// Base URL of the remote origin. Keys are appended to it as relative paths.
    ///
    /// Without a remote origin, only local files are served.
    pub remote_url: Option<Url>,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry
    pub caches: CacheConfigs,

    /// How often remote files are revalidated.
    pub revalidation: RevalidationConfig,

    /// The timeout for establishing a connection to the remote origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for metadata requests to the remote origin.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// The maximum time a single range request may take.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,
}

impl Config {
    pub fn timeouts(&self) -> HttpTimeouts {
        HttpTimeouts {
            connect: self.connect_timeout,
            head: self.head_timeout,
            max_download: self.max_download_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let timeouts = HttpTimeouts::default();
        Config {
            data_dir: PathBuf::from("./data"),
            remote_url: None,
            bind: "127.0.0.1:8080".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            revalidation: RevalidationConfig::default(),
            connect_timeout: timeouts.connect,
            head_timeout: timeouts.head,
            max_download_timeout: timeouts.max_download,
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // Individual settings can be overridden without affecting the other defaults.
        let cfg = Config::get(None).unwrap();
        assert_eq!(
            cfg.caches.hybrid.max_unused_for,
            Duration::from_secs(15 * 60)
        );
        assert_eq!(cfg.caches.local.max_unused_for, Duration::from_secs(3600));

        let yaml = r#"
            caches:
              hybrid:
                block_grace: 5s
                forget_versions_after: 2h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.hybrid.block_grace, Duration::from_secs(5));
        assert_eq!(
            cfg.caches.hybrid.forget_versions_after,
            Duration::from_secs(2 * 3600)
        );
        assert_eq!(
            cfg.caches.hybrid.sweep_interval,
            HybridCacheConfig::default().sweep_interval
        );
        assert_eq!(cfg.caches.local, LocalCacheConfig::default());
        assert_eq!(cfg.caches.blocks, BlockCacheConfig::default());
        assert_eq!(cfg.revalidation, RevalidationConfig::default());
    }

    #[test]
    fn test_revalidation_config() {
        let yaml = r#"
            revalidation:
              metadata: 1m
              archive_after: 7days
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.revalidation.metadata, Duration::from_secs(60));
        assert_eq!(
            cfg.revalidation.archive_after,
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(cfg.revalidation.recent, Duration::from_secs(180));
    }

    #[test]
    fn test_remote_url() {
        let yaml = r#"
            data_dir: /data
            remote_url: https://example.com/data/
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/data"));
        assert_eq!(
            cfg.remote_url.unwrap().as_str(),
            "https://example.com/data/"
        );
    }

    #[test]
    fn test_unspecified_timeouts() {
        let yaml = r#"
            bind: 0.0.0.0:8080
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let default_cfg = Config::default();
        assert_eq!(cfg.connect_timeout, default_cfg.connect_timeout);
        assert_eq!(cfg.head_timeout, default_cfg.head_timeout);
        assert_eq!(cfg.max_download_timeout, default_cfg.max_download_timeout);
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache:
                max_unused_for: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
