//! Runtime configuration, loaded from environment variables with defaults.

use crate::guard::GuardConfig;
use crate::policy::PolicyConfig;

/// Top-level runner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the exchange REST API.
    pub exchange_url: String,
    /// API key header value, if the deployment requires one.
    pub api_key: Option<String>,
    /// Base URL of the feature-snapshot producer.
    pub features_url: String,
    pub symbol: String,
    /// Where the bandit policy record lives.
    pub policy_state_path: String,
    pub decision_interval_secs: u64,
    /// Request validity window forwarded to the exchange, in milliseconds.
    pub recv_window_ms: u64,
    /// Base order quantity; scaled by the chosen size bucket.
    pub base_quantity: f64,
    pub guard: GuardConfig,
    pub policy: PolicyConfig,
}

impl Config {
    /// Load from environment. Only malformed numerics are errors; absent
    /// variables fall back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            exchange_url: env_or("EXCHANGE_URL", "http://localhost:8080"),
            api_key: std::env::var("EXCHANGE_API_KEY").ok(),
            features_url: env_or("FEATURES_URL", "http://localhost:9000"),
            symbol: env_or("SYMBOL", "BTCUSDT"),
            policy_state_path: env_or("POLICY_STATE_PATH", "state/policy.json"),
            decision_interval_secs: env_num("DECISION_INTERVAL_SECS", 60)?,
            recv_window_ms: env_num("RECV_WINDOW_MS", 5000)?,
            base_quantity: env_num("BASE_QUANTITY", 0.01)?,
            guard: GuardConfig {
                stop_pct: env_num("STOP_PCT", GuardConfig::default().stop_pct)?,
                take_profit_pct: env_num("TAKE_PROFIT_PCT", GuardConfig::default().take_profit_pct)?,
                ..GuardConfig::default()
            },
            policy: PolicyConfig {
                eps_gate: env_num("EPS_GATE", PolicyConfig::default().eps_gate)?,
                gate_margin: env_num("GATE_MARGIN", PolicyConfig::default().gate_margin)?,
                skip_push: env_num("SKIP_PUSH", PolicyConfig::default().skip_push)?,
                ..PolicyConfig::default()
            },
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_num<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}
