//! Bracket Bandit - bandit-gated trading agent with bracket protection
//!
//! Startup sequence:
//! 1. Load configuration from environment
//! 2. Restore the persisted bandit policy state (fresh start if absent)
//! 3. Build the exchange client and bracket guard
//! 4. Run the decision/protection loop

use tracing::info;

use bracket_bandit::{BanditPolicy, Config, HttpExchange, PolicyStore, Runner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting Bracket Bandit...");

    let config = Config::from_env()?;
    info!(
        "Symbol: {}, Exchange: {}",
        config.symbol, config.exchange_url
    );

    let exchange = HttpExchange::new(
        &config.exchange_url,
        config.api_key.clone(),
        config.recv_window_ms,
    )?;

    let store = PolicyStore::new(&config.policy_state_path);
    let policy = match store.load().await? {
        Some(state) => {
            info!("Restored policy state ({} trades)", state.n_trades);
            BanditPolicy::from_state(&state, config.policy)?
        }
        None => {
            info!("No persisted policy state, starting fresh");
            BanditPolicy::new(config.policy)
        }
    };

    let runner = Runner::new(exchange, policy, store, config);
    runner.run().await
}
