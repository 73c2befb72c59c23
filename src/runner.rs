//! Trading loop orchestration
//!
//! Per opportunity: feature snapshot → bandit decision → market entry →
//! bracket protection. A slower poll watches for the position closing and
//! feeds the realized reward back into the policy.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchange::{Exchange, NewOrder};
use crate::features::FeatureVector;
use crate::guard::{derive_stop, derive_take_profit, BracketGuard, EntryProtection};
use crate::persistence::PolicyStore;
use crate::policy::BanditPolicy;
use crate::quantize::PositionDir;

/// The trade currently being tracked for reward attribution.
#[derive(Debug, Clone)]
struct OpenTrade {
    dir: PositionDir,
    entry_price: f64,
    /// Denominator for the R-multiple reward: distance to the initial stop.
    risk_per_unit: f64,
}

/// Main loop: composes the bandit policy and the bracket guard over one
/// exchange client. One position at a time.
pub struct Runner<E: Exchange + Clone> {
    exchange: E,
    guard: BracketGuard<E>,
    policy: BanditPolicy,
    store: PolicyStore,
    http: reqwest::Client,
    cfg: Config,
    open_trade: Option<OpenTrade>,
}

impl<E: Exchange + Clone> Runner<E> {
    pub fn new(exchange: E, policy: BanditPolicy, store: PolicyStore, cfg: Config) -> Self {
        let guard = BracketGuard::new(exchange.clone(), cfg.guard);
        Self {
            exchange,
            guard,
            policy,
            store,
            http: reqwest::Client::new(),
            cfg,
            open_trade: None,
        }
    }

    /// Run forever: decision ticks and exit polls.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            "Runner starting for {} (decision every {}s)",
            self.cfg.symbol, self.cfg.decision_interval_secs
        );

        let mut decision_interval = interval(Duration::from_secs(self.cfg.decision_interval_secs));
        let mut exit_interval = interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                _ = decision_interval.tick() => {
                    if let Err(e) = self.decision_cycle().await {
                        error!("Decision cycle error: {}", e);
                    }
                }
                _ = exit_interval.tick() => {
                    if let Err(e) = self.poll_exit().await {
                        error!("Exit poll error: {}", e);
                    }
                }
            }
        }
    }

    /// One decision tick: snapshot, gate/size, entry, protection.
    async fn decision_cycle(&mut self) -> anyhow::Result<()> {
        if self.open_trade.is_some() {
            debug!("Position open on {}, skipping decision", self.cfg.symbol);
            return Ok(());
        }

        let Some(ctx) = self.fetch_features().await else {
            return Ok(());
        };

        let decision = self.policy.decide(&ctx);
        if !decision.take {
            debug!("Policy skipped {}", self.cfg.symbol);
            return Ok(());
        }

        // Direction comes with the snapshot: the sign of the trend feature.
        let dir = if ctx.value("trend").unwrap_or(0.0) >= 0.0 {
            PositionDir::Long
        } else {
            PositionDir::Short
        };

        let Some(entry_price) = self.guard.reference_price(&self.cfg.symbol).await else {
            warn!("No reference price for {}, skipping entry", self.cfg.symbol);
            return Ok(());
        };

        let quantity = self.cfg.base_quantity * decision.bucket.multiplier();
        let entry = NewOrder::market_entry(&self.cfg.symbol, dir, quantity);
        if let Err(e) = self.exchange.place_order(&entry).await {
            warn!("Entry placement failed on {}: {}", self.cfg.symbol, e);
            return Ok(());
        }

        info!(
            "Entered {:?} {} qty {} (bucket {})",
            dir,
            self.cfg.symbol,
            quantity,
            decision.bucket.as_str()
        );
        self.policy.note_entry(&ctx, decision.bucket);
        self.save_policy().await;

        self.open_trade = Some(OpenTrade {
            dir,
            entry_price,
            risk_per_unit: entry_price * self.cfg.guard.stop_pct,
        });

        self.ensure_protection(dir, quantity, entry_price).await;
        Ok(())
    }

    /// Protect the fresh entry, falling back to the legacy request shape when
    /// the modern one surfaces a placement error.
    async fn ensure_protection(&mut self, dir: PositionDir, quantity: f64, entry_price: f64) {
        let modern = EntryProtection::Modern {
            quantity,
            entry_price,
            stop: None,
            take_profit: None,
        };
        match self.guard.ensure_after_entry(&self.cfg.symbol, dir, modern).await {
            Ok(true) => {}
            Ok(false) => warn!("Partial protection on {}", self.cfg.symbol),
            Err(e) => {
                warn!(
                    "Modern protection request failed on {}: {}, retrying legacy shape",
                    self.cfg.symbol, e
                );
                let legacy = EntryProtection::Legacy {
                    stop: Some(derive_stop(dir, entry_price, self.cfg.guard.stop_pct)),
                    take_profit: Some(derive_take_profit(
                        dir,
                        entry_price,
                        self.cfg.guard.take_profit_pct,
                    )),
                };
                match self.guard.ensure_after_entry(&self.cfg.symbol, dir, legacy).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Partial protection on {} after fallback", self.cfg.symbol),
                    Err(e) => error!("Legacy protection request failed on {}: {}", self.cfg.symbol, e),
                }
            }
        }
    }

    /// Detect the tracked position closing and feed the realized R-multiple
    /// back into the policy.
    async fn poll_exit(&mut self) -> anyhow::Result<()> {
        let Some(trade) = self.open_trade.clone() else {
            return Ok(());
        };

        let positions = match self.exchange.position_risk(&self.cfg.symbol).await {
            Ok(p) => p,
            Err(e) => {
                debug!("Position poll failed for {}: {}", self.cfg.symbol, e);
                return Ok(());
            }
        };
        let still_open = positions
            .iter()
            .any(|p| p.symbol == self.cfg.symbol && p.position_amt != 0.0);
        if still_open {
            return Ok(());
        }

        // Closed: approximate the exit with the current reference price.
        let exit_price = self
            .guard
            .reference_price(&self.cfg.symbol)
            .await
            .unwrap_or(trade.entry_price);
        let signed_move = match trade.dir {
            PositionDir::Long => exit_price - trade.entry_price,
            PositionDir::Short => trade.entry_price - exit_price,
        };
        let reward = if trade.risk_per_unit > 0.0 {
            signed_move / trade.risk_per_unit
        } else {
            0.0
        };

        info!(
            "Position on {} closed, realized {:.2}R",
            self.cfg.symbol, reward
        );

        let mut outcome = HashMap::new();
        outcome.insert("reward_r".to_string(), serde_json::json!(reward));
        self.policy.note_exit(&outcome, None, None);
        self.save_policy().await;

        self.open_trade = None;
        Ok(())
    }

    /// Fetch a feature snapshot from the producer. Failures degrade to a
    /// skipped tick.
    async fn fetch_features(&self) -> Option<FeatureVector> {
        let url = format!("{}/features/{}", self.cfg.features_url, self.cfg.symbol);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Feature fetch failed: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("Feature fetch returned {}", response.status());
            return None;
        }
        match response.json::<FeatureSnapshotResponse>().await {
            Ok(body) => Some(FeatureVector::from_map(&body.features)),
            Err(e) => {
                debug!("Feature decode failed: {}", e);
                None
            }
        }
    }

    async fn save_policy(&self) {
        if let Err(e) = self.store.save(&self.policy.to_state()).await {
            warn!("Failed to persist policy state: {}", e);
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeatureSnapshotResponse {
    features: HashMap<String, f64>,
}
