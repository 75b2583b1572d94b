//! Configuration for the S3 Shuttle worker fleet

use serde::{Deserialize, Serialize};

/// Worker and producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target part size in bytes. Adjusted upward per object when the part
    /// count would exceed the multipart limit of 10,000.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Objects at or below this size skip the resume probe entirely.
    #[serde(default = "default_resumable_threshold")]
    pub resumable_threshold: u64,

    /// Per-operation retry budget for transient I/O failures.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Maximum number of parts in flight for one object. Drop to 50 or so
    /// for memory-constrained deployments.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Whole-object deadline in seconds. Expiry abandons the attempt and
    /// leaves the multipart upload open for the next lease.
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,

    /// Re-download already-uploaded parts and compare the reconstructed
    /// composite digest against the destination ETag after finalize.
    #[serde(default)]
    pub verify_digest_twice: bool,

    /// Storage class applied when initiating destination uploads.
    #[serde(default = "default_storage_class")]
    pub storage_class: String,

    /// Debug flag: abort in-progress uploads found for the current key
    /// before transferring, forcing a fresh upload.
    #[serde(default)]
    pub clean_unfinished_upload: bool,

    /// Log filter applied when RUST_LOG is not set ("info", "debug", ...).
    #[serde(default = "default_logging_level")]
    pub logging_level: String,

    /// Name of the SQS work queue.
    #[serde(default = "default_channel_name")]
    pub queue_name: String,

    /// Name of the DynamoDB bookkeeping table.
    #[serde(default = "default_channel_name")]
    pub table_name: String,

    /// SSM parameter holding the peer-account credentials as JSON.
    /// When unset, peer credentials are read from the environment.
    #[serde(default)]
    pub ssm_parameter_credentials: Option<String>,

    /// Which side of the transfer uses the peer-account credentials.
    #[serde(default)]
    pub transfer_direction: TransferDirection,

    /// Stable identifier recorded in bookkeeping. A random identifier is
    /// generated when unset.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Source bucket and prefix listed by the producer.
    #[serde(default)]
    pub src_bucket: String,
    #[serde(default)]
    pub src_prefix: String,

    /// Destination applied by the producer and to bare event-notification
    /// messages that carry no destination of their own.
    #[serde(default)]
    pub des_bucket_default: String,
    #[serde(default)]
    pub des_prefix_default: String,

    /// Source-side S3 client settings.
    #[serde(default)]
    pub source: S3TargetConfig,

    /// Destination-side S3 client settings.
    #[serde(default)]
    pub destination: S3TargetConfig,
}

/// Per-side S3 client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3TargetConfig {
    /// Endpoint URL override (for MinIO or non-AWS S3-compatible vendors).
    /// If not specified, uses the vendor default endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Region for this side's client.
    #[serde(default = "default_region")]
    pub region: String,

    /// Use path-style URLs (required for MinIO and most compatible vendors).
    #[serde(default)]
    pub force_path_style: bool,
}

impl Default for S3TargetConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            force_path_style: false,
        }
    }
}

/// Which side of the transfer is in the peer trust domain.
///
/// `Put` pushes into a foreign destination (source uses the default
/// credential chain, destination the peer credentials); `Get` pulls from
/// a foreign source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    #[default]
    Put,
    Get,
}

// Default value functions for serde
fn default_chunk_size() -> u64 {
    5 * 1024 * 1024 // 5 MiB
}

fn default_resumable_threshold() -> u64 {
    5 * 1024 * 1024
}

fn default_max_retry() -> u32 {
    10
}

fn default_max_concurrency() -> usize {
    200
}

fn default_job_timeout() -> u64 {
    3000
}

fn default_storage_class() -> String {
    "STANDARD".to_string()
}

fn default_logging_level() -> String {
    "info".to_string()
}

fn default_channel_name() -> String {
    "s3_shuttle_jobs".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            resumable_threshold: default_resumable_threshold(),
            max_retry: default_max_retry(),
            max_concurrency: default_max_concurrency(),
            job_timeout: default_job_timeout(),
            verify_digest_twice: false,
            storage_class: default_storage_class(),
            clean_unfinished_upload: false,
            logging_level: default_logging_level(),
            queue_name: default_channel_name(),
            table_name: default_channel_name(),
            ssm_parameter_credentials: None,
            transfer_direction: TransferDirection::default(),
            worker_id: None,
            src_bucket: String::new(),
            src_prefix: String::new(),
            des_bucket_default: String::new(),
            des_prefix_default: String::new(),
            source: S3TargetConfig::default(),
            destination: S3TargetConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables (legacy support)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SHUTTLE_CHUNK_SIZE") {
            if let Ok(parsed) = v.parse() {
                config.chunk_size = parsed;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_RESUMABLE_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                config.resumable_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_MAX_RETRY") {
            if let Ok(parsed) = v.parse() {
                config.max_retry = parsed;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_MAX_CONCURRENCY") {
            if let Ok(parsed) = v.parse() {
                config.max_concurrency = parsed;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_JOB_TIMEOUT") {
            if let Ok(parsed) = v.parse() {
                config.job_timeout = parsed;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_VERIFY_DIGEST_TWICE") {
            config.verify_digest_twice = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SHUTTLE_STORAGE_CLASS") {
            config.storage_class = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_CLEAN_UNFINISHED_UPLOAD") {
            config.clean_unfinished_upload = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SHUTTLE_LOGGING_LEVEL") {
            config.logging_level = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_QUEUE_NAME") {
            config.queue_name = v.clone();
            config.table_name = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_TABLE_NAME") {
            config.table_name = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_SSM_PARAMETER_CREDENTIALS") {
            config.ssm_parameter_credentials = Some(v);
        }
        if let Ok(v) = std::env::var("SHUTTLE_TRANSFER_DIRECTION") {
            config.transfer_direction = match v.to_ascii_lowercase().as_str() {
                "get" => TransferDirection::Get,
                _ => TransferDirection::Put,
            };
        }
        if let Ok(v) = std::env::var("SHUTTLE_WORKER_ID") {
            config.worker_id = Some(v);
        }
        if let Ok(v) = std::env::var("SHUTTLE_SRC_BUCKET") {
            config.src_bucket = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_SRC_PREFIX") {
            config.src_prefix = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_DES_BUCKET_DEFAULT") {
            config.des_bucket_default = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_DES_PREFIX_DEFAULT") {
            config.des_prefix_default = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_SRC_REGION") {
            config.source.region = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_DES_REGION") {
            config.destination.region = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_SRC_ENDPOINT") {
            config.source.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("SHUTTLE_DES_ENDPOINT") {
            config.destination.endpoint = Some(v);
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Self {
        // Try config file first
        if let Ok(path) = std::env::var("SHUTTLE_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        // Try default config file locations
        for path in &["s3_shuttle.toml", "/etc/s3_shuttle/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        // Fall back to environment variables
        Self::from_env()
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.max_retry, 10);
        assert_eq!(config.max_concurrency, 200);
        assert_eq!(config.job_timeout, 3000);
        assert!(!config.verify_digest_twice);
        assert_eq!(config.storage_class, "STANDARD");
        assert_eq!(config.transfer_direction, TransferDirection::Put);
    }

    #[test]
    fn test_config_parse_toml() {
        let toml = r#"
            chunk_size = 10485760
            max_concurrency = 200
            verify_digest_twice = true
            queue_name = "migration-jobs"
            table_name = "migration-jobs"
            des_bucket_default = "archive"
            des_prefix_default = "mirrored"
            transfer_direction = "get"

            [source]
            region = "us-west-2"

            [destination]
            endpoint = "http://localhost:9000"
            region = "eu-central-1"
            force_path_style = true
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.max_concurrency, 200);
        assert!(config.verify_digest_twice);
        assert_eq!(config.queue_name, "migration-jobs");
        assert_eq!(config.transfer_direction, TransferDirection::Get);
        assert_eq!(config.source.region, "us-west-2");
        assert_eq!(
            config.destination.endpoint,
            Some("http://localhost:9000".to_string())
        );
        assert!(config.destination.force_path_style);
        // Unspecified knobs keep their defaults
        assert_eq!(config.max_retry, 10);
        assert_eq!(config.job_timeout, 3000);
    }

    #[test]
    fn test_config_parse_minimal() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.queue_name, "s3_shuttle_jobs");
        assert_eq!(config.table_name, "s3_shuttle_jobs");
        assert!(config.ssm_parameter_credentials.is_none());
    }
}
