use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use relay_core::backoff::Backoff;
use relay_core::store::LeaseConfig;
use relay_core::transfer::TransferConfig;

/// Broker configuration loaded from environment variables.
///
/// All fields have defaults suitable for running a single broker locally.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8081`).
    pub port: u16,
    /// HTTP request timeout in seconds (default: `300`). Uploads of large
    /// result files must finish inside it.
    pub request_timeout_secs: u64,
    /// Default READING lease for new jobs.
    pub read_lease: Duration,
    /// PROCESSING jobs are reclaimed after this long without a report.
    pub processing_stale_after: Duration,
    /// Registrations not seen for this long are purged.
    pub worker_expiry: Duration,
    /// Window for "active worker" counts.
    pub worker_active_window: Duration,
    /// Reaper sweep interval.
    pub reap_interval: Duration,
    /// Base directory for relative transfer source paths.
    pub upload_dir: PathBuf,
    /// Root directory for committed result artifacts.
    pub results_dir: PathBuf,
    /// Streaming chunk size for downloads.
    pub download_chunk_bytes: usize,
    /// Request body limit for result uploads.
    pub max_upload_bytes: usize,
    /// Post-rename verification attempts.
    pub upload_verify_retries: u32,
    pub upload_verify_delay: Duration,
    pub upload_verify_backoff: f64,
    pub upload_verify_timeout: Duration,
    /// Accepted download kinds.
    pub transfer_kinds: Vec<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                  |
    /// |------------------------------|--------------------------|
    /// | `HOST`                       | `0.0.0.0`                |
    /// | `PORT`                       | `8081`                   |
    /// | `REQUEST_TIMEOUT_SECS`       | `300`                    |
    /// | `READ_LEASE_SECS`            | `10`                     |
    /// | `PROCESSING_STALE_SECS`      | `1800`                   |
    /// | `WORKER_EXPIRY_SECS`         | `600`                    |
    /// | `WORKER_ACTIVE_SECS`         | `60`                     |
    /// | `REAP_INTERVAL_SECS`         | `30`                     |
    /// | `UPLOAD_DIR`                 | `./relay_data/uploads`   |
    /// | `RESULTS_DIR`                | `./relay_data/results`   |
    /// | `DOWNLOAD_CHUNK_BYTES`       | `8192`                   |
    /// | `MAX_UPLOAD_BYTES`           | `268435456` (256 MiB)    |
    /// | `UPLOAD_VERIFY_RETRIES`      | `5`                      |
    /// | `UPLOAD_VERIFY_DELAY_MS`     | `500`                    |
    /// | `UPLOAD_VERIFY_BACKOFF`      | `1.5`                    |
    /// | `UPLOAD_VERIFY_TIMEOUT_SECS` | `30`                     |
    /// | `TRANSFER_KINDS`             | `input,config`           |
    ///
    /// Panics on unparseable values so misconfiguration fails at startup.
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let transfer_kinds: Vec<String> = std::env::var("TRANSFER_KINDS")
            .unwrap_or_else(|_| "input,config".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            host,
            port: env_or("PORT", 8081),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 300),
            read_lease: Duration::from_secs(env_or("READ_LEASE_SECS", 10)),
            processing_stale_after: Duration::from_secs(env_or("PROCESSING_STALE_SECS", 1800)),
            worker_expiry: Duration::from_secs(env_or("WORKER_EXPIRY_SECS", 600)),
            worker_active_window: Duration::from_secs(env_or("WORKER_ACTIVE_SECS", 60)),
            reap_interval: Duration::from_secs(env_or("REAP_INTERVAL_SECS", 30)),
            upload_dir: env_or("UPLOAD_DIR", PathBuf::from("./relay_data/uploads")),
            results_dir: env_or("RESULTS_DIR", PathBuf::from("./relay_data/results")),
            download_chunk_bytes: env_or("DOWNLOAD_CHUNK_BYTES", 8192),
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", 256 * 1024 * 1024),
            upload_verify_retries: env_or("UPLOAD_VERIFY_RETRIES", 5),
            upload_verify_delay: Duration::from_millis(env_or("UPLOAD_VERIFY_DELAY_MS", 500)),
            upload_verify_backoff: env_or("UPLOAD_VERIFY_BACKOFF", 1.5),
            upload_verify_timeout: Duration::from_secs(env_or("UPLOAD_VERIFY_TIMEOUT_SECS", 30)),
            transfer_kinds,
        }
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            read_lease: self.read_lease,
            processing_stale_after: self.processing_stale_after,
            worker_expiry: self.worker_expiry,
            worker_active_window: self.worker_active_window,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            upload_dir: self.upload_dir.clone(),
            results_dir: self.results_dir.clone(),
            chunk_size: self.download_chunk_bytes,
            kinds: self.transfer_kinds.clone(),
            verify: Backoff::exponential(
                self.upload_verify_delay,
                self.upload_verify_backoff,
                Duration::from_secs(30),
            )
            .with_max_attempts(self.upload_verify_retries.max(1))
            .with_max_elapsed(self.upload_verify_timeout),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            request_timeout_secs: 300,
            read_lease: Duration::from_secs(10),
            processing_stale_after: Duration::from_secs(1800),
            worker_expiry: Duration::from_secs(600),
            worker_active_window: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
            upload_dir: PathBuf::from("./relay_data/uploads"),
            results_dir: PathBuf::from("./relay_data/results"),
            download_chunk_bytes: 8192,
            max_upload_bytes: 256 * 1024 * 1024,
            upload_verify_retries: 5,
            upload_verify_delay: Duration::from_millis(500),
            upload_verify_backoff: 1.5,
            upload_verify_timeout: Duration::from_secs(30),
            transfer_kinds: vec!["input".into(), "config".into()],
        }
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{key} has an invalid value '{raw}': {e}")),
        Err(_) => default,
    }
}
