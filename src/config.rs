use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ib_gateway: IbGatewayConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// API server port (default: 8420)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_api_port() -> u16 {
    8420
}

/// Brokerage gateway connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct IbGatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_paper_port")]
    pub paper_port: u16,
    #[serde(default = "default_live_port")]
    pub live_port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: u32,
    /// Bound on every gateway call (bar fetch, submit, cancel, status)
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub account_code: String,
    /// "paper" (default) or "live"; live additionally requires
    /// runtime.enable_live_trading = true
    #[serde(default = "default_trading_mode")]
    pub trading_mode: String,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_paper_port() -> u16 {
    4002
}

fn default_live_port() -> u16 {
    4001
}

fn default_client_id() -> u32 {
    99
}

fn default_gateway_timeout() -> u64 {
    5
}

fn default_trading_mode() -> String {
    "paper".to_string()
}

impl IbGatewayConfig {
    /// Resolve the API port for the configured trading mode.
    pub fn api_port(&self) -> u16 {
        if self.trading_mode.eq_ignore_ascii_case("live") {
            self.live_port
        } else {
            self.paper_port
        }
    }

    pub fn is_live(&self) -> bool {
        self.trading_mode.eq_ignore_ascii_case("live")
    }
}

/// Filesystem layout and runtime switches
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub market_data_log_path: Option<String>,
    #[serde(default)]
    pub market_cache_db_path: Option<String>,
    #[serde(default)]
    pub condition_rules_path: Option<String>,
    /// Live trading must be enabled explicitly on top of trading_mode=live
    #[serde(default)]
    pub enable_live_trading: bool,
}

impl RuntimeConfig {
    pub fn resolved_data_dir(&self) -> String {
        self.data_dir.clone().unwrap_or_else(|| "data".to_string())
    }

    pub fn resolved_db_path(&self) -> String {
        self.db_path
            .clone()
            .unwrap_or_else(|| format!("{}/sentra.sqlite3", self.resolved_data_dir()))
    }

    pub fn resolved_market_cache_db_path(&self) -> String {
        self.market_cache_db_path
            .clone()
            .unwrap_or_else(|| format!("{}/market_cache.sqlite3", self.resolved_data_dir()))
    }
}

/// Scheduler / worker-pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Scan cadence; clamped to [20, 300] with a warning
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,
    #[serde(default = "default_configured_threads")]
    pub configured_threads: usize,
    #[serde(default = "default_queue_maxsize")]
    pub queue_maxsize: usize,
    /// A no_new_data skip never postpones a strategy longer than this
    #[serde(default = "default_max_monitoring_interval")]
    pub max_monitoring_interval_minutes: u64,
    #[serde(default = "default_lock_ttl")]
    pub strategy_lock_ttl_seconds: u64,
    #[serde(default = "default_gateway_throttle")]
    pub gateway_unavailable_event_throttle_seconds: u64,
    #[serde(default = "default_waiting_throttle")]
    pub waiting_for_market_data_event_throttle_seconds: u64,
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_configured_threads() -> usize {
    2
}

fn default_queue_maxsize() -> usize {
    4096
}

fn default_max_monitoring_interval() -> u64 {
    60
}

fn default_lock_ttl() -> u64 {
    120
}

fn default_gateway_throttle() -> u64 {
    300
}

fn default_waiting_throttle() -> u64 {
    120
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            monitor_interval_seconds: default_monitor_interval(),
            configured_threads: default_configured_threads(),
            queue_maxsize: default_queue_maxsize(),
            max_monitoring_interval_minutes: default_max_monitoring_interval(),
            strategy_lock_ttl_seconds: default_lock_ttl(),
            gateway_unavailable_event_throttle_seconds: default_gateway_throttle(),
            waiting_for_market_data_event_throttle_seconds: default_waiting_throttle(),
        }
    }
}

/// Pre-trade verification rule thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_max_notional")]
    pub max_notional_usd: Decimal,
    #[serde(default = "default_allowed_order_types")]
    pub allowed_order_types: Vec<String>,
}

fn default_max_notional() -> Decimal {
    dec!(100000)
}

fn default_allowed_order_types() -> Vec<String> {
    vec!["MKT".to_string(), "LMT".to_string()]
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_notional_usd: default_max_notional(),
            allowed_order_types: default_allowed_order_types(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_conditions")]
    pub max_conditions_per_strategy: usize,
}

fn default_max_conditions() -> usize {
    5
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_conditions_per_strategy: default_max_conditions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from the default location and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a TOML file, with SENTRA_* environment
    /// overrides (env > file > built-in defaults).
    pub fn load_from<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();

        let builder = Config::builder()
            .set_default("ib_gateway.host", default_gateway_host())?
            .set_default("ib_gateway.trading_mode", default_trading_mode())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .set_default("api_port", default_api_port() as i64)?
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("SENTRA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Clamp out-of-range values (with warnings) and canonicalize modes.
    fn normalize(&mut self) {
        let interval = self.worker.monitor_interval_seconds;
        let clamped = interval.clamp(20, 300);
        if clamped != interval {
            warn!(
                configured = interval,
                clamped, "worker.monitor_interval_seconds out of [20, 300], clamping"
            );
            self.worker.monitor_interval_seconds = clamped;
        }

        let mode = self.ib_gateway.trading_mode.trim().to_ascii_lowercase();
        self.ib_gateway.trading_mode = if mode == "live" {
            "live".to_string()
        } else {
            "paper".to_string()
        };

        if self.worker.configured_threads == 0 {
            warn!("worker.configured_threads = 0, using 1");
            self.worker.configured_threads = 1;
        }
    }

    /// Validate configuration values. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ib_gateway.is_live() && !self.runtime.enable_live_trading {
            errors.push(
                "trading_mode=live requires runtime.enable_live_trading=true".to_string(),
            );
        }
        if self.ib_gateway.timeout_seconds == 0 {
            errors.push("ib_gateway.timeout_seconds must be > 0".to_string());
        }
        if self.verification.max_notional_usd <= Decimal::ZERO {
            errors.push(format!(
                "verification.max_notional_usd must be > 0, got {}",
                self.verification.max_notional_usd
            ));
        }
        if self.verification.allowed_order_types.is_empty() {
            errors.push("verification.allowed_order_types cannot be empty".to_string());
        }
        if self.limits.max_conditions_per_strategy == 0 {
            errors.push("limits.max_conditions_per_strategy must be > 0".to_string());
        }
        if self.worker.queue_maxsize < 64 {
            errors.push(format!(
                "worker.queue_maxsize must be >= 64, got {}",
                self.worker.queue_maxsize
            ));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            ib_gateway: IbGatewayConfig {
                host: default_gateway_host(),
                paper_port: default_paper_port(),
                live_port: default_live_port(),
                client_id: default_client_id(),
                timeout_seconds: default_gateway_timeout(),
                account_code: String::new(),
                trading_mode: default_trading_mode(),
            },
            runtime: RuntimeConfig::default(),
            worker: WorkerConfig::default(),
            verification: VerificationConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
            api_port: default_api_port(),
        }
    }

    #[test]
    fn test_monitor_interval_clamps() {
        let mut cfg = base_config();
        cfg.worker.monitor_interval_seconds = 5;
        cfg.normalize();
        assert_eq!(cfg.worker.monitor_interval_seconds, 20);

        cfg.worker.monitor_interval_seconds = 900;
        cfg.normalize();
        assert_eq!(cfg.worker.monitor_interval_seconds, 300);

        cfg.worker.monitor_interval_seconds = 60;
        cfg.normalize();
        assert_eq!(cfg.worker.monitor_interval_seconds, 60);
    }

    #[test]
    fn test_live_requires_enable_flag() {
        let mut cfg = base_config();
        cfg.ib_gateway.trading_mode = "live".to_string();
        cfg.normalize();
        assert!(!cfg.validate().is_empty());

        cfg.runtime.enable_live_trading = true;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_unknown_trading_mode_falls_back_to_paper() {
        let mut cfg = base_config();
        cfg.ib_gateway.trading_mode = "LIVE-ish".to_string();
        cfg.normalize();
        assert_eq!(cfg.ib_gateway.trading_mode, "paper");
        assert_eq!(cfg.ib_gateway.api_port(), cfg.ib_gateway.paper_port);
    }
}
