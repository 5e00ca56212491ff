//! Environment-driven configuration. Every knob is optional; invalid values
//! log a warning and fall back to the default rather than aborting startup.

use std::path::PathBuf;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalanceStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastUsed,
    Random,
}

impl LoadBalanceStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "weighted_round_robin" => Some(Self::WeightedRoundRobin),
            "least_used" => Some(Self::LeastUsed),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastUsed => "least_used",
            Self::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputValidationMode {
    Off,
    Warn,
    Strict,
}

#[derive(Debug, Clone)]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl MySqlConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub admin_key: Option<String>,
    pub api_key: Option<String>,
    pub mysql: Option<MySqlConfig>,
    pub data_dir: PathBuf,
    pub strategy: LoadBalanceStrategy,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_error_threshold: u32,
    pub circuit_breaker_recovery_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub cache_simulation_enabled: bool,
    pub cache_ttl_secs: u64,
    pub max_cache_entries: usize,
    pub auto_refresh_enabled: bool,
    pub token_refresh_interval_hours: u64,
    pub zero_input_token_models: Vec<String>,
    pub input_validation: InputValidationMode,
    pub max_input_tokens: u32,
    /// Restores the original always-on thinking behavior. Claude API
    /// semantics (off unless requested) are the default.
    pub thinking_always_on: bool,
    pub upstream_timeout_secs: u64,
    pub base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_key: None,
            api_key: None,
            mysql: None,
            data_dir: PathBuf::from("data"),
            strategy: LoadBalanceStrategy::WeightedRoundRobin,
            circuit_breaker_enabled: true,
            circuit_breaker_error_threshold: 5,
            circuit_breaker_recovery_timeout_secs: 300,
            health_check_interval_secs: 300,
            cache_simulation_enabled: false,
            cache_ttl_secs: 86_400,
            max_cache_entries: 5_000,
            auto_refresh_enabled: false,
            token_refresh_interval_hours: 5,
            zero_input_token_models: Vec::new(),
            input_validation: InputValidationMode::Warn,
            max_input_tokens: 100_000,
            thinking_always_on: false,
            upstream_timeout_secs: 300,
            base_url: None,
        }
    }
}

pub fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn apply_bool(target: &mut bool, key: &str) {
    if let Some(raw) = env_nonempty(key) {
        match parse_env_bool(&raw) {
            Some(parsed) => *target = parsed,
            None => warn!("[Config] ignoring invalid {} value: {}", key, raw),
        }
    }
}

fn apply_u64(target: &mut u64, key: &str) {
    if let Some(raw) = env_nonempty(key) {
        match raw.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("[Config] ignoring invalid {} value: {}", key, raw),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(port) = env_nonempty("PORT") {
            match port.parse::<u16>() {
                Ok(p) if p > 0 => config.port = p,
                _ => warn!("[Config] ignoring invalid PORT value: {}", port),
            }
        }
        config.admin_key = env_nonempty("ADMIN_KEY");
        config.api_key = env_nonempty("API_KEY");

        if let Some(host) = env_nonempty("MYSQL_HOST") {
            let user = env_nonempty("MYSQL_USER");
            let database =
                env_nonempty("MYSQL_DATABASE").unwrap_or_else(|| "pontoon".to_string());
            match user {
                Some(user) => {
                    let port = env_nonempty("MYSQL_PORT")
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(3306);
                    config.mysql = Some(MySqlConfig {
                        host,
                        port,
                        user,
                        password: std::env::var("MYSQL_PASSWORD").unwrap_or_default(),
                        database,
                    });
                }
                None => warn!("[Config] MYSQL_HOST set without MYSQL_USER, using embedded store"),
            }
        }

        if let Some(dir) = env_nonempty("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(raw) = env_nonempty("LOAD_BALANCE_STRATEGY") {
            match LoadBalanceStrategy::parse(&raw) {
                Some(s) => config.strategy = s,
                None => warn!("[Config] ignoring invalid LOAD_BALANCE_STRATEGY: {}", raw),
            }
        }

        apply_bool(&mut config.circuit_breaker_enabled, "CIRCUIT_BREAKER_ENABLED");
        if let Some(raw) = env_nonempty("CIRCUIT_BREAKER_ERROR_THRESHOLD") {
            match raw.parse::<u32>() {
                Ok(v) if v > 0 => config.circuit_breaker_error_threshold = v,
                _ => warn!(
                    "[Config] ignoring invalid CIRCUIT_BREAKER_ERROR_THRESHOLD: {}",
                    raw
                ),
            }
        }
        apply_u64(
            &mut config.circuit_breaker_recovery_timeout_secs,
            "CIRCUIT_BREAKER_RECOVERY_TIMEOUT",
        );
        apply_u64(&mut config.health_check_interval_secs, "HEALTH_CHECK_INTERVAL");

        apply_bool(&mut config.cache_simulation_enabled, "ENABLE_CACHE_SIMULATION");
        apply_u64(&mut config.cache_ttl_secs, "CACHE_TTL_SECONDS");
        if let Some(raw) = env_nonempty("MAX_CACHE_ENTRIES") {
            match raw.parse::<usize>() {
                Ok(v) => config.max_cache_entries = v,
                Err(_) => warn!("[Config] ignoring invalid MAX_CACHE_ENTRIES: {}", raw),
            }
        }

        apply_bool(&mut config.auto_refresh_enabled, "ENABLE_AUTO_REFRESH");
        apply_u64(
            &mut config.token_refresh_interval_hours,
            "TOKEN_REFRESH_INTERVAL_HOURS",
        );

        if let Some(raw) = env_nonempty("ZERO_INPUT_TOKEN_MODELS") {
            config.zero_input_token_models = raw
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }

        if let Some(raw) = env_nonempty("DISABLE_INPUT_VALIDATION") {
            if parse_env_bool(&raw) == Some(true) {
                config.input_validation = InputValidationMode::Off;
            }
        }
        if let Some(raw) = env_nonempty("STRICT_INPUT_VALIDATION") {
            if parse_env_bool(&raw) == Some(true)
                && config.input_validation != InputValidationMode::Off
            {
                config.input_validation = InputValidationMode::Strict;
            }
        }
        if let Some(raw) = env_nonempty("AMAZONQ_MAX_INPUT_TOKENS") {
            match raw.parse::<u32>() {
                Ok(v) if v > 0 => config.max_input_tokens = v,
                _ => warn!("[Config] ignoring invalid AMAZONQ_MAX_INPUT_TOKENS: {}", raw),
            }
        }

        apply_bool(&mut config.thinking_always_on, "THINKING_ALWAYS_ON");
        apply_u64(&mut config.upstream_timeout_secs, "UPSTREAM_TIMEOUT_SECONDS");
        config.base_url = env_nonempty("BASE_URL");

        config
    }

    /// Overall request deadline: upstream deadline plus slack for SSE drain.
    pub fn request_deadline_secs(&self) -> u64 {
        self.upstream_timeout_secs + 30
    }
}
