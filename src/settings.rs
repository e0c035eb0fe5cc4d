use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct RpcSettings {
    #[serde(default = "default_rpc_http_url")]
    pub http_url: String,
    /// Connection-level timeout; an elapsed timeout surfaces as an ordinary fetch failure.
    #[serde(default = "default_rpc_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_rpc_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_rpc_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_rpc_http_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_rpc_timeout_seconds() -> u64 {
    300
}
fn default_rpc_max_retries() -> usize {
    3
}
fn default_rpc_retry_base_delay_ms() -> u64 {
    500
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            http_url: default_rpc_http_url(),
            timeout_seconds: default_rpc_timeout_seconds(),
            max_retries: default_rpc_max_retries(),
            retry_base_delay_ms: default_rpc_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout_seconds() -> u64 {
    5
}
fn default_connect_attempts() -> u32 {
    10
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobSettings {
    #[serde(default = "default_job_name")]
    pub name: String,
    /// Identity used for logs and for the per-worker cancellation flag.
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
}

fn default_job_name() -> String {
    "gather_samples".to_string()
}

/// The machine's hostname, so a restarted worker keeps its cancellation flag.
/// The pid is only a last resort.
fn default_worker_name() -> String {
    read_hostname("/proc/sys/kernel/hostname")
        .or_else(|| non_empty_env("HOSTNAME"))
        .or_else(|| non_empty_env("COMPUTERNAME"))
        .unwrap_or_else(|| format!("worker-{}", std::process::id()))
}

fn read_hostname(path: impl AsRef<Path>) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            name: default_job_name(),
            worker_name: default_worker_name(),
        }
    }
}

/// Overall historical range to backfill. `end_block` is inclusive.
#[derive(Debug, Deserialize, Clone)]
pub struct RangeSettings {
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

fn default_chunk_size() -> u64 {
    1_000
}

impl Default for RangeSettings {
    fn default() -> Self {
        Self {
            start_block: None,
            end_block: None,
            chunk_size: default_chunk_size(),
        }
    }
}

impl RangeSettings {
    /// Returns `(start_block, end_block_inclusive)` or an error when either bound is missing.
    pub fn bounds(&self) -> Result<(u64, u64), ConfigError> {
        match (self.start_block, self.end_block) {
            (Some(start), Some(end)) if start <= end => Ok((start, end)),
            (Some(start), Some(end)) => Err(ConfigError::Message(format!(
                "range.start_block ({}) is after range.end_block ({})",
                start, end
            ))),
            _ => Err(ConfigError::Message(
                "range.start_block and range.end_block must both be set".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleSettings {
    /// Target number of log events per round trip.
    #[serde(default = "default_setpoint")]
    pub setpoint: f64,
    #[serde(default = "default_additive_increase")]
    pub additive_increase: f64,
    #[serde(default = "default_initial_window")]
    pub initial_window: f64,
    #[serde(default = "default_min_window")]
    pub min_window: u64,
    #[serde(default = "default_max_window")]
    pub max_window: u64,
}

fn default_setpoint() -> f64 {
    2_500.0
}
fn default_additive_increase() -> f64 {
    2.0
}
fn default_initial_window() -> f64 {
    10.0
}
fn default_min_window() -> u64 {
    1
}
fn default_max_window() -> u64 {
    10_000
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            setpoint: default_setpoint(),
            additive_increase: default_additive_increase(),
            initial_window: default_initial_window(),
            min_window: default_min_window(),
            max_window: default_max_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Transactions with fewer decoded transfers are never handed to detection.
    #[serde(default = "default_min_transfers")]
    pub min_transfers: usize,
}

fn default_min_transfers() -> usize {
    3
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_transfers: default_min_transfers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    #[serde(default = "default_cancellation_poll_seconds")]
    pub cancellation_poll_seconds: u64,
    /// Number of reservations in a row that may fail on fetch/detect/persist
    /// before the worker gives up. `1` means fail fast.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_cancellation_poll_seconds() -> u64 {
    10
}
fn default_max_consecutive_failures() -> u32 {
    1
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            cancellation_poll_seconds: default_cancellation_poll_seconds(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgressSettings {
    #[serde(default = "default_print_period_seconds")]
    pub print_period_seconds: u64,
}

fn default_print_period_seconds() -> u64 {
    60
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            print_period_seconds: default_print_period_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Only honoured with the `observability` feature.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_listen_address")]
    pub listen_address: String,
}

fn default_metrics_listen_address() -> String {
    "0.0.0.0:9184".to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            listen_address: default_metrics_listen_address(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub job: JobSettings,
    #[serde(default)]
    pub range: RangeSettings,
    #[serde(default)]
    pub throttle: ThrottleSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Loads settings from `path` (a missing file is not an error), then applies
    /// environment overrides and validates the result.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(url) = non_empty_env("BACKFILL_RPC_HTTP_URL") {
            self.rpc.http_url = url;
        }
        if let Some(name) = non_empty_env("BACKFILL_WORKER_NAME") {
            self.job.worker_name = name;
        }
        if let Some(block) = non_empty_env("BACKFILL_START_BLOCK").and_then(|v| v.parse().ok()) {
            self.range.start_block = Some(block);
        }
        if let Some(block) = non_empty_env("BACKFILL_END_BLOCK").and_then(|v| v.parse().ok()) {
            self.range.end_block = Some(block);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.range.chunk_size == 0 {
            return Err(ConfigError::Message("range.chunk_size must be positive".into()));
        }
        if let (Some(start), Some(end)) = (self.range.start_block, self.range.end_block) {
            if start > end {
                return Err(ConfigError::Message(format!(
                    "range.start_block ({}) is after range.end_block ({})",
                    start, end
                )));
            }
        }
        let throttle = &self.throttle;
        if throttle.min_window == 0 || throttle.min_window > throttle.max_window {
            return Err(ConfigError::Message(format!(
                "throttle window bounds are invalid: min={} max={}",
                throttle.min_window, throttle.max_window
            )));
        }
        if !(throttle.setpoint > 0.0) || !(throttle.initial_window > 0.0) {
            return Err(ConfigError::Message(
                "throttle.setpoint and throttle.initial_window must be positive".into(),
            ));
        }
        if throttle.additive_increase < 0.0 {
            return Err(ConfigError::Message(
                "throttle.additive_increase must not be negative".into(),
            ));
        }
        if self.worker.max_consecutive_failures == 0 {
            return Err(ConfigError::Message(
                "worker.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.job.worker_name.trim().is_empty() {
            return Err(ConfigError::Message("job.worker_name must not be empty".into()));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::from_path("/nonexistent/backfill/Config.toml").unwrap();
        assert_eq!(settings.job.name, "gather_samples");
        assert_eq!(settings.range.chunk_size, 1_000);
        assert_eq!(settings.throttle.max_window, 10_000);
        assert_eq!(settings.pipeline.min_transfers, 3);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let file = write_config(
            r#"
            [range]
            start_block = 100
            end_block = 5099
            chunk_size = 500

            [throttle]
            setpoint = 100.0
            max_window = 50
            "#,
        );
        let settings = Settings::from_path(file.path()).unwrap();
        assert_eq!(settings.range.bounds().unwrap(), (100, 5_099));
        assert_eq!(settings.range.chunk_size, 500);
        assert_eq!(settings.throttle.setpoint, 100.0);
        assert_eq!(settings.throttle.max_window, 50);
        assert_eq!(settings.throttle.min_window, 1);
    }

    #[test]
    fn test_rejects_inverted_range() {
        let file = write_config(
            r#"
            [range]
            start_block = 200
            end_block = 100
            "#,
        );
        assert!(Settings::from_path(file.path()).is_err());
    }

    #[test]
    fn test_rejects_inverted_window_bounds() {
        let file = write_config(
            r#"
            [throttle]
            min_window = 100
            max_window = 10
            "#,
        );
        assert!(Settings::from_path(file.path()).is_err());
    }

    #[test]
    fn test_read_hostname_trims_and_skips_empty() {
        let file = write_config("vm\n");
        assert_eq!(read_hostname(file.path()).as_deref(), Some("vm"));
        let empty = write_config("  \n");
        assert_eq!(read_hostname(empty.path()), None);
        assert_eq!(read_hostname("/nonexistent/hostname"), None);
    }

    #[test]
    fn test_worker_name_defaults_to_kernel_hostname() {
        let Some(host) = read_hostname("/proc/sys/kernel/hostname") else {
            return;
        };
        // stable across restarts, unlike the pid fallback
        assert_eq!(default_worker_name(), host);
        assert_eq!(JobSettings::default().worker_name, host);
    }

    #[test]
    fn test_bounds_require_both_ends() {
        let range = RangeSettings {
            start_block: Some(10),
            end_block: None,
            chunk_size: 10,
        };
        assert!(range.bounds().is_err());
    }
}
