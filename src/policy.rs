//! Bandit policy - take/skip gating and size selection
//!
//! Two independent UCB estimators share one feature contract: the gate scores
//! the raw context, the size axis scores the context scaled by each bucket's
//! multiplier (a cheap stand-in for one estimator per arm). Rewards arrive
//! after the trade closes and flow back through `note_exit`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::estimator::{EstimatorState, LinUcb};
use crate::features::{FeatureVector, DIM};

/// Reward-key aliases accepted by `note_exit`, first present wins.
const REWARD_KEYS: [&str; 5] = ["reward_r", "pnl_r", "r", "reward", "pnl_r_multiple"];

/// Discrete position-size category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
}

impl SizeBucket {
    /// Buckets in enumeration order; ties in scoring go to the first scanned.
    pub const ALL: [SizeBucket; 3] = [SizeBucket::Small, SizeBucket::Medium, SizeBucket::Large];

    /// Scalar applied to the feature vector before scoring, and to the base
    /// quantity when sizing an entry.
    pub fn multiplier(&self) -> f64 {
        match self {
            SizeBucket::Small => 0.6,
            SizeBucket::Medium => 1.0,
            SizeBucket::Large => 1.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeBucket::Small => "S",
            SizeBucket::Medium => "M",
            SizeBucket::Large => "L",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "S" | "small" => Some(SizeBucket::Small),
            "M" | "medium" => Some(SizeBucket::Medium),
            "L" | "large" => Some(SizeBucket::Large),
            _ => None,
        }
    }
}

/// Outcome of one `decide` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub take: bool,
    pub bucket: SizeBucket,
}

/// Policy tunables. Values not present in the persisted record (warmup,
/// sizing switch) come from here on every construction.
#[derive(Debug, Clone, Copy)]
pub struct PolicyConfig {
    pub gate_alpha: f64,
    pub size_alpha: f64,
    pub l2: f64,
    /// Probability of a forced exploratory TAKE.
    pub eps_gate: f64,
    /// Gate score must clear this margin to TAKE.
    pub gate_margin: f64,
    /// Trades during which a fixed grace bonus favors exploration.
    pub warmup_trades: u64,
    pub warmup_bonus: f64,
    /// Constant subtracted from the gate score (bias toward skipping).
    pub skip_push: f64,
    /// Minimum minutes between trades, persisted for callers that gate on it.
    pub anti_stall_min: f64,
    pub sizing_enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            gate_alpha: 1.2,
            size_alpha: 0.8,
            l2: 1e-3,
            eps_gate: 0.05,
            gate_margin: 0.0,
            warmup_trades: 20,
            warmup_bonus: 0.15,
            skip_push: 0.0,
            anti_stall_min: 0.0,
            sizing_enabled: true,
        }
    }
}

/// Persisted policy record. Round-trip must reproduce identical scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyState {
    pub gate: EstimatorState,
    pub size: EstimatorState,
    pub gate_alpha: f64,
    pub size_alpha: f64,
    pub l2: f64,
    pub n_trades: u64,
    pub last_trade_ts: i64,
    pub eps_gate: f64,
    pub gate_margin: f64,
    pub anti_stall_min: f64,
    pub skip_push: f64,
}

/// Contextual-bandit gate + sizer.
pub struct BanditPolicy {
    gate: LinUcb,
    size: LinUcb,
    cfg: PolicyConfig,
    n_trades: u64,
    last_trade_ts: i64,
    rng: StdRng,
    last_context: Option<FeatureVector>,
    last_bucket: Option<SizeBucket>,
}

impl BanditPolicy {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self::with_rng(cfg, StdRng::from_entropy())
    }

    /// Deterministic policy for tests: exploration draws come from the
    /// supplied RNG.
    pub fn with_rng(cfg: PolicyConfig, rng: StdRng) -> Self {
        Self {
            gate: LinUcb::new(DIM, cfg.gate_alpha, cfg.l2),
            size: LinUcb::new(DIM, cfg.size_alpha, cfg.l2),
            cfg,
            n_trades: 0,
            last_trade_ts: 0,
            rng,
            last_context: None,
            last_bucket: None,
        }
    }

    pub fn seeded(cfg: PolicyConfig, seed: u64) -> Self {
        Self::with_rng(cfg, StdRng::seed_from_u64(seed))
    }

    pub fn n_trades(&self) -> u64 {
        self.n_trades
    }

    pub fn last_trade_ts(&self) -> i64 {
        self.last_trade_ts
    }

    /// Gate + size decision for one opportunity. Deterministic apart from
    /// the epsilon draw.
    pub fn decide(&mut self, ctx: &FeatureVector) -> Decision {
        let x = ctx.as_slice();

        let mut take_score = self.gate.score(x) - self.cfg.skip_push;
        if self.n_trades < self.cfg.warmup_trades {
            take_score += self.cfg.warmup_bonus;
        }

        // Pure exploration branch first, so a deeply negative gate can still
        // collect fresh observations.
        let explore = self.rng.gen::<f64>() < self.cfg.eps_gate;
        let take = explore || take_score - self.cfg.gate_margin > 0.0;

        let bucket = if take && self.cfg.sizing_enabled {
            self.best_bucket(ctx)
        } else {
            SizeBucket::Small
        };

        debug!(
            "decide: take={} bucket={} score={:.4} explore={}",
            take,
            bucket.as_str(),
            take_score,
            explore
        );

        Decision { take, bucket }
    }

    fn best_bucket(&self, ctx: &FeatureVector) -> SizeBucket {
        let mut best = SizeBucket::ALL[0];
        let mut best_score = f64::NEG_INFINITY;
        for bucket in SizeBucket::ALL {
            let score = self.size.score(&ctx.scaled(bucket.multiplier()));
            // Strict comparison keeps ties on the first bucket scanned.
            if score > best_score {
                best = bucket;
                best_score = score;
            }
        }
        best
    }

    /// Record an entry for later reward attribution. No learning happens
    /// here; the reward is unknown until the trade closes.
    pub fn note_entry(&mut self, ctx: &FeatureVector, bucket: SizeBucket) {
        self.last_context = Some(ctx.clone());
        self.last_bucket = Some(bucket);
        self.n_trades += 1;
        self.last_trade_ts = chrono::Utc::now().timestamp();
    }

    /// Learn from a realized outcome. Missing or malformed rewards degrade
    /// to a no-op; a bad bucket never blocks gate learning.
    pub fn note_exit(
        &mut self,
        outcome: &HashMap<String, serde_json::Value>,
        ctx: Option<&FeatureVector>,
        bucket: Option<&str>,
    ) {
        let Some((key, reward)) = resolve_reward(outcome) else {
            debug!("note_exit: no reward key present, skipping");
            return;
        };

        let context = match ctx.cloned().or_else(|| self.last_context.clone()) {
            Some(c) => c,
            None => {
                debug!("note_exit: no context to attribute reward to");
                return;
            }
        };

        let bucket = bucket
            .and_then(SizeBucket::from_str)
            .or(self.last_bucket);

        debug!("note_exit: reward {:.4} from key {:?}", reward, key);

        self.gate.learn(context.as_slice(), reward);
        if let Some(bucket) = bucket {
            self.size
                .learn(&context.scaled(bucket.multiplier()), reward);
        }
    }

    /// Gate score for a context, without mutating exploration state.
    pub fn gate_score(&self, ctx: &FeatureVector) -> f64 {
        self.gate.score(ctx.as_slice()) - self.cfg.skip_push
    }

    pub fn to_state(&self) -> PolicyState {
        PolicyState {
            gate: self.gate.to_state(),
            size: self.size.to_state(),
            gate_alpha: self.cfg.gate_alpha,
            size_alpha: self.cfg.size_alpha,
            l2: self.cfg.l2,
            n_trades: self.n_trades,
            last_trade_ts: self.last_trade_ts,
            eps_gate: self.cfg.eps_gate,
            gate_margin: self.cfg.gate_margin,
            anti_stall_min: self.cfg.anti_stall_min,
            skip_push: self.cfg.skip_push,
        }
    }

    /// Rebuild from a persisted record. Tunables stored in the record win
    /// over the supplied config; non-persisted ones (warmup, sizing) come
    /// from `cfg`.
    pub fn from_state(state: &PolicyState, cfg: PolicyConfig) -> anyhow::Result<Self> {
        let gate = LinUcb::from_state(&state.gate)?;
        let size = LinUcb::from_state(&state.size)?;
        Ok(Self {
            gate,
            size,
            cfg: PolicyConfig {
                gate_alpha: state.gate_alpha,
                size_alpha: state.size_alpha,
                l2: state.l2,
                eps_gate: state.eps_gate,
                gate_margin: state.gate_margin,
                anti_stall_min: state.anti_stall_min,
                skip_push: state.skip_push,
                ..cfg
            },
            n_trades: state.n_trades,
            last_trade_ts: state.last_trade_ts,
            rng: StdRng::from_entropy(),
            last_context: None,
            last_bucket: None,
        })
    }
}

/// First present reward alias with a numeric value. Logs when aliases
/// disagree, since the precedence between them is a compatibility accident.
fn resolve_reward(outcome: &HashMap<String, serde_json::Value>) -> Option<(&'static str, f64)> {
    let mut chosen: Option<(&'static str, f64)> = None;
    for key in REWARD_KEYS {
        if let Some(v) = outcome.get(key).and_then(|v| v.as_f64()) {
            if !v.is_finite() {
                continue;
            }
            match chosen {
                None => chosen = Some((key, v)),
                Some((first, first_v)) if (first_v - v).abs() > 1e-12 => {
                    warn!(
                        "note_exit: reward aliases disagree ({}={}, {}={}), using {}",
                        first, first_v, key, v, first
                    );
                }
                _ => {}
            }
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(name: &str, value: f64) -> FeatureVector {
        let mut map = HashMap::new();
        map.insert(name.to_string(), value);
        FeatureVector::from_map(&map)
    }

    fn drive_negative(policy: &mut BanditPolicy, ctx: &FeatureVector) {
        let mut outcome = HashMap::new();
        outcome.insert("reward_r".to_string(), json!(-1.0));
        for _ in 0..50 {
            policy.note_exit(&outcome, Some(ctx), Some("S"));
        }
    }

    #[test]
    fn test_epsilon_forces_takes_on_negative_gate() {
        let cfg = PolicyConfig {
            eps_gate: 0.3,
            warmup_trades: 0,
            ..PolicyConfig::default()
        };
        let mut policy = BanditPolicy::seeded(cfg, 7);

        let ctx = ctx_with("trend", 1.0);
        drive_negative(&mut policy, &ctx);
        assert!(policy.gate_score(&ctx) < 0.0);

        let takes = (0..200)
            .filter(|_| policy.decide(&ctx).take)
            .count();
        // eps = 0.3 over 200 draws: expect the forced-TAKE fraction in the
        // 20-40% band
        assert!(
            (40..=80).contains(&takes),
            "forced takes out of band: {}",
            takes
        );
    }

    #[test]
    fn test_warmup_bonus_favors_taking() {
        let cfg = PolicyConfig {
            eps_gate: 0.0,
            warmup_trades: 5,
            warmup_bonus: 0.5,
            skip_push: 0.0,
            ..PolicyConfig::default()
        };
        let mut policy = BanditPolicy::seeded(cfg, 1);
        let ctx = FeatureVector::zeros();

        // Zero context scores 0.0; only the warmup bonus clears the gate.
        assert!(policy.decide(&ctx).take);
        for _ in 0..5 {
            policy.note_entry(&ctx, SizeBucket::Small);
        }
        assert!(!policy.decide(&ctx).take);
    }

    #[test]
    fn test_skip_bias_suppresses_marginal_takes() {
        let cfg = PolicyConfig {
            eps_gate: 0.0,
            warmup_trades: 0,
            // Must clear the fresh-estimator exploration bonus
            // (alpha/sqrt(l2) ~ 38) to actually suppress the take.
            skip_push: 100.0,
            ..PolicyConfig::default()
        };
        let mut policy = BanditPolicy::seeded(cfg, 1);
        let ctx = ctx_with("trend", 1.0);
        assert!(!policy.decide(&ctx).take);
    }

    #[test]
    fn test_size_ties_break_to_first_bucket() {
        let cfg = PolicyConfig {
            eps_gate: 1.0, // always take
            ..PolicyConfig::default()
        };
        let mut policy = BanditPolicy::seeded(cfg, 1);
        // Zero context scores identically (0.0) for every bucket scaling.
        let decision = policy.decide(&FeatureVector::zeros());
        assert!(decision.take);
        assert_eq!(decision.bucket, SizeBucket::Small);
    }

    #[test]
    fn test_note_exit_reward_aliases() {
        let cfg = PolicyConfig::default();
        let mut policy = BanditPolicy::seeded(cfg, 1);
        let ctx = ctx_with("trend", 1.0);
        let before = policy.gate_score(&ctx);

        // Alias further down the list still resolves
        let mut outcome = HashMap::new();
        outcome.insert("pnl_r_multiple".to_string(), json!(-2.0));
        policy.note_exit(&outcome, Some(&ctx), Some("M"));
        assert!(policy.gate_score(&ctx) < before);
    }

    #[test]
    fn test_note_exit_no_reward_is_noop() {
        let mut policy = BanditPolicy::seeded(PolicyConfig::default(), 1);
        let ctx = ctx_with("trend", 1.0);
        let before = policy.gate_score(&ctx);

        let mut outcome = HashMap::new();
        outcome.insert("unrelated".to_string(), json!(5.0));
        outcome.insert("reward".to_string(), json!("not a number"));
        policy.note_exit(&outcome, Some(&ctx), Some("S"));

        assert_eq!(policy.gate_score(&ctx), before);
    }

    #[test]
    fn test_note_exit_unknown_bucket_still_learns_gate() {
        let mut policy = BanditPolicy::seeded(PolicyConfig::default(), 1);
        let ctx = ctx_with("trend", 1.0);
        let before = policy.gate_score(&ctx);

        let mut outcome = HashMap::new();
        outcome.insert("reward_r".to_string(), json!(-1.5));
        policy.note_exit(&outcome, Some(&ctx), Some("XXL"));

        assert!(policy.gate_score(&ctx) < before);
    }

    #[test]
    fn test_note_exit_falls_back_to_recorded_entry() {
        let mut policy = BanditPolicy::seeded(PolicyConfig::default(), 1);
        let ctx = ctx_with("trend", 1.0);
        policy.note_entry(&ctx, SizeBucket::Large);
        let before = policy.gate_score(&ctx);

        let mut outcome = HashMap::new();
        outcome.insert("r".to_string(), json!(-1.0));
        policy.note_exit(&outcome, None, None);

        assert!(policy.gate_score(&ctx) < before);
        assert_eq!(policy.n_trades(), 1);
    }

    #[test]
    fn test_state_round_trip_scoring() {
        let mut policy = BanditPolicy::seeded(PolicyConfig::default(), 9);
        let ctx = ctx_with("rsi", 55.0);
        policy.note_entry(&ctx, SizeBucket::Medium);

        let mut outcome = HashMap::new();
        outcome.insert("reward_r".to_string(), json!(0.8));
        policy.note_exit(&outcome, None, None);

        let json = serde_json::to_string(&policy.to_state()).unwrap();
        let state: PolicyState = serde_json::from_str(&json).unwrap();
        let restored = BanditPolicy::from_state(&state, PolicyConfig::default()).unwrap();

        assert_eq!(restored.gate_score(&ctx), policy.gate_score(&ctx));
        assert_eq!(restored.n_trades(), policy.n_trades());
    }
}
