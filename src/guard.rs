//! Bracket guard - keeps open positions protected by stop/take-profit orders
//!
//! The guard owns three concerns: resolving a reference price (mark, falling
//! back to book mid), deciding which side of that reference each trigger must
//! sit on, and placing orders through a retry path that widens the safety
//! margin when the exchange reports the trigger would fire immediately.
//! Placement is best-effort: apart from the documented modern-request path,
//! failures are logged and folded into the boolean result, never raised into
//! the trading loop.

use anyhow::Context;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::exchange::{
    position_side_tag, Exchange, ExchangeError, NewOrder, OpenOrder, OrderKind, OrderSide,
    PositionMode, PositionRisk, WorkingType,
};
use crate::quantize::{round_trigger, PositionDir, TriggerKind};

/// Guard tunables.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Stop distance as a fraction of entry when no explicit stop arrives.
    pub stop_pct: f64,
    /// Take-profit distance as a fraction of entry when no explicit TP arrives.
    pub take_profit_pct: f64,
    /// Safety margin, in ticks, for the first placement attempt.
    pub safety_ticks: u32,
    /// Widened margin for the retry after an immediate-trigger rejection.
    pub retry_safety_ticks: u32,
    /// Tick size used when exchange metadata is unavailable.
    pub default_tick: f64,
    pub working_type: WorkingType,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            stop_pct: 0.015,
            take_profit_pct: 0.025,
            safety_ticks: 1,
            retry_safety_ticks: 4,
            default_tick: 0.0001,
            working_type: WorkingType::MarkPrice,
        }
    }
}

/// How the caller described the entry it wants protected.
///
/// The legacy shape carries only trigger prices; the modern shape adds the
/// fill so missing triggers can be derived and validated against the actual
/// entry. Supporting both is a compatibility requirement.
#[derive(Debug, Clone)]
pub enum EntryProtection {
    Legacy {
        stop: Option<f64>,
        take_profit: Option<f64>,
    },
    Modern {
        quantity: f64,
        entry_price: f64,
        stop: Option<f64>,
        take_profit: Option<f64>,
    },
}

/// Existing protective orders for one market: at most one stop and one
/// take-profit.
#[derive(Debug, Clone, Default)]
pub struct ProtectionOrders {
    pub stop: Option<OpenOrder>,
    pub take_profit: Option<OpenOrder>,
}

/// Bracket-order protection state machine over an exchange client.
pub struct BracketGuard<E: Exchange> {
    exchange: E,
    cfg: GuardConfig,
    tick_cache: HashMap<String, f64>,
    position_mode: Option<PositionMode>,
    mode_probed: bool,
}

impl<E: Exchange> BracketGuard<E> {
    pub fn new(exchange: E, cfg: GuardConfig) -> Self {
        Self {
            exchange,
            cfg,
            tick_cache: HashMap::new(),
            position_mode: None,
            mode_probed: false,
        }
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Tick size for a market, fetched once and cached. Falls back to the
    /// configured default when metadata is unavailable.
    pub async fn tick(&mut self, symbol: &str) -> f64 {
        if let Some(tick) = self.tick_cache.get(symbol) {
            return *tick;
        }
        let tick = match self.exchange.tick_size(symbol).await {
            Ok(t) if t > 0.0 => t,
            Ok(t) => {
                debug!("Non-positive tick {} for {}, using default", t, symbol);
                self.cfg.default_tick
            }
            Err(e) => {
                debug!("Tick lookup failed for {}: {}, using default", symbol, e);
                self.cfg.default_tick
            }
        };
        self.tick_cache.insert(symbol.to_string(), tick);
        tick
    }

    /// Best-effort current price: mark price, else mid of best bid/ask.
    pub async fn reference_price(&self, symbol: &str) -> Option<f64> {
        match self.exchange.mark_price(symbol).await {
            Ok(p) if p > 0.0 => return Some(p),
            Ok(_) => {}
            Err(e) => debug!("Mark price failed for {}: {}", symbol, e),
        }
        match self.exchange.book_ticker(symbol).await {
            Ok(book) if book.bid > 0.0 && book.ask > 0.0 => Some(book.mid()),
            Ok(_) => None,
            Err(e) => {
                debug!("Book ticker failed for {}: {}", symbol, e);
                None
            }
        }
    }

    /// Partition a market's open orders into at most one stop and one
    /// take-profit. Query failures classify as "no protection" (debug-logged)
    /// so the caller re-places rather than crashes.
    pub async fn classify_open_orders(&self, symbol: &str) -> ProtectionOrders {
        let orders = match self.exchange.open_orders(symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                debug!("Open-order query failed for {}: {}", symbol, e);
                return ProtectionOrders::default();
            }
        };

        let mut protection = ProtectionOrders::default();
        for order in orders {
            if order.kind.is_stop() && protection.stop.is_none() {
                protection.stop = Some(order);
            } else if order.kind.is_take_profit() && protection.take_profit.is_none() {
                protection.take_profit = Some(order);
            }
        }
        protection
    }

    /// Ensure a fresh entry is protected on both sides.
    ///
    /// Missing triggers are derived from the entry price (modern shape only)
    /// via the configured stop/take-profit distances. Each trigger is checked
    /// against the reference price: a stop must sit on the adverse side, a
    /// take-profit on the favorable side. Invalid triggers are dropped and
    /// the call reports partial failure; valid ones are quantized and placed
    /// unless an order of that kind is already open.
    ///
    /// Returns `Ok(true)` only if nothing was dropped and every placement
    /// succeeded. The modern shape propagates an error from its first
    /// placement attempt so the caller can fall back to the legacy shape.
    pub async fn ensure_after_entry(
        &mut self,
        symbol: &str,
        dir: PositionDir,
        req: EntryProtection,
    ) -> anyhow::Result<bool> {
        let (reference, stop, take_profit, modern) = match req {
            EntryProtection::Modern {
                quantity,
                entry_price,
                stop,
                take_profit,
            } => {
                if quantity == 0.0 {
                    debug!("ensure_after_entry: zero quantity on {}, nothing to protect", symbol);
                    return Ok(true);
                }
                let stop = stop.or_else(|| Some(derive_stop(dir, entry_price, self.cfg.stop_pct)));
                let take_profit = take_profit
                    .or_else(|| Some(derive_take_profit(dir, entry_price, self.cfg.take_profit_pct)));
                (Some(entry_price), stop, take_profit, true)
            }
            EntryProtection::Legacy { stop, take_profit } => {
                (self.reference_price(symbol).await, stop, take_profit, false)
            }
        };

        let existing = self.classify_open_orders(symbol).await;
        let mut ok = true;
        let mut first_placement = true;

        for (kind, requested) in [
            (TriggerKind::Stop, stop),
            (TriggerKind::TakeProfit, take_profit),
        ] {
            let Some(price) = requested else { continue };

            if !trigger_valid(dir, kind, price, reference) {
                warn!(
                    "Dropping {:?} {:?} trigger at {} on {}: wrong side of reference {:?}",
                    dir, kind, price, symbol, reference
                );
                ok = false;
                continue;
            }

            let already_open = match kind {
                TriggerKind::Stop => existing.stop.is_some(),
                TriggerKind::TakeProfit => existing.take_profit.is_some(),
            };
            if already_open {
                debug!("{:?} already open on {}, keeping it", kind, symbol);
                continue;
            }

            if modern && first_placement {
                // Surfaced failure path: the caller uses it to retry with the
                // legacy request shape.
                first_placement = false;
                self.place_trigger(symbol, dir, kind, price, reference, self.cfg.safety_ticks)
                    .await
                    .with_context(|| {
                        format!("placing initial {:?} protection on {}", kind, symbol)
                    })?;
            } else {
                first_placement = false;
                if !self
                    .place_with_retry(symbol, dir, kind, price, reference)
                    .await
                {
                    ok = false;
                }
            }
        }

        if ok {
            info!("Protection ensured on {} ({:?})", symbol, dir);
        }
        Ok(ok)
    }

    /// Replace the exit order on the `new_price` side of the market.
    ///
    /// Resolves the live position (no-op on flat), classifies the new price
    /// as a stop or take-profit replacement by which side of the reference it
    /// sits on, cancels the existing order of that kind best-effort, and
    /// places the replacement through the retry path.
    pub async fn replace_exit(
        &mut self,
        symbol: &str,
        new_price: f64,
        dir_hint: Option<PositionDir>,
    ) -> anyhow::Result<bool> {
        let positions = match self.exchange.position_risk(symbol).await {
            Ok(p) => p,
            Err(e) => {
                debug!("Position query failed for {}: {}", symbol, e);
                return Ok(false);
            }
        };

        let Some((dir, qty)) = resolve_position(&positions, symbol, dir_hint) else {
            debug!("replace_exit: no open position on {}, nothing to replace", symbol);
            return Ok(false);
        };

        let Some(reference) = self.reference_price(symbol).await else {
            debug!("replace_exit: no reference price for {}, cannot classify", symbol);
            return Ok(false);
        };

        // Inverted form of the trigger-validity table: for a long, a price
        // below the reference can only be a stop, above only a take-profit.
        let kind = match dir {
            PositionDir::Long if new_price < reference => TriggerKind::Stop,
            PositionDir::Long => TriggerKind::TakeProfit,
            PositionDir::Short if new_price > reference => TriggerKind::Stop,
            PositionDir::Short => TriggerKind::TakeProfit,
        };

        let existing = self.classify_open_orders(symbol).await;
        let to_cancel = match kind {
            TriggerKind::Stop => existing.stop,
            TriggerKind::TakeProfit => existing.take_profit,
        };
        if let Some(order) = to_cancel {
            if let Err(e) = self.exchange.cancel_order(symbol, order.order_id).await {
                // Cancellation is best-effort; the replacement still goes out.
                warn!(
                    "Failed to cancel {:?} order {} on {}: {}",
                    kind, order.order_id, symbol, e
                );
            }
        }

        info!(
            "Replacing {:?} on {} ({:?}, qty {}) at {}",
            kind, symbol, dir, qty, new_price
        );
        Ok(self
            .place_with_retry(symbol, dir, kind, new_price, Some(reference))
            .await)
    }

    /// Place a protective order, retrying once with a widened safety margin
    /// when the exchange reports the trigger would fire immediately. All
    /// failures end up logged and reported as `false`.
    async fn place_with_retry(
        &mut self,
        symbol: &str,
        dir: PositionDir,
        kind: TriggerKind,
        price: f64,
        reference: Option<f64>,
    ) -> bool {
        match self
            .place_trigger(symbol, dir, kind, price, reference, self.cfg.safety_ticks)
            .await
        {
            Ok(()) => true,
            Err(e) if e.would_trigger_immediately() => {
                debug!(
                    "{:?} at {} on {} would trigger immediately, widening margin to {} ticks",
                    kind, price, symbol, self.cfg.retry_safety_ticks
                );
                match self
                    .place_trigger(
                        symbol,
                        dir,
                        kind,
                        price,
                        reference,
                        self.cfg.retry_safety_ticks,
                    )
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Retry placement of {:?} on {} failed: {}", kind, symbol, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Placement of {:?} on {} failed: {}", kind, symbol, e);
                false
            }
        }
    }

    /// Quantize and submit a single close-position trigger order.
    async fn place_trigger(
        &mut self,
        symbol: &str,
        dir: PositionDir,
        kind: TriggerKind,
        price: f64,
        reference: Option<f64>,
        safety_ticks: u32,
    ) -> Result<(), ExchangeError> {
        let tick = self.tick(symbol).await;
        let trigger = round_trigger(dir, kind, price, reference, tick, safety_ticks);
        let tag = self.position_tag(dir).await;

        let order = NewOrder {
            symbol: symbol.to_string(),
            side: OrderSide::closing(dir),
            kind: match kind {
                TriggerKind::Stop => OrderKind::StopMarket,
                TriggerKind::TakeProfit => OrderKind::TakeProfitMarket,
            },
            quantity: None,
            close_position: true,
            stop_price: Some(trigger),
            working_type: Some(self.cfg.working_type),
            position_side: tag.map(str::to_string),
            client_order_id: Some(uuid::Uuid::new_v4().to_string()),
        };
        self.exchange.place_order(&order).await
    }

    /// Position-side tag for protective orders, probed once. An unknown mode
    /// leaves the tag off rather than guessing.
    async fn position_tag(&mut self, dir: PositionDir) -> Option<&'static str> {
        if !self.mode_probed {
            self.mode_probed = true;
            match self.exchange.position_mode().await {
                Ok(mode) => self.position_mode = Some(mode),
                Err(e) => debug!("Position-mode probe failed: {}", e),
            }
        }
        position_side_tag(self.position_mode, dir)
    }
}

/// Heuristic stop from the entry price.
pub fn derive_stop(dir: PositionDir, entry: f64, stop_pct: f64) -> f64 {
    match dir {
        PositionDir::Long => entry * (1.0 - stop_pct),
        PositionDir::Short => entry * (1.0 + stop_pct),
    }
}

/// Heuristic take-profit from the entry price.
pub fn derive_take_profit(dir: PositionDir, entry: f64, tp_pct: f64) -> f64 {
    match dir {
        PositionDir::Long => entry * (1.0 + tp_pct),
        PositionDir::Short => entry * (1.0 - tp_pct),
    }
}

/// A stop must sit on the adverse side of the reference, a take-profit on the
/// favorable side. With no reference the trigger is accepted as-is.
fn trigger_valid(dir: PositionDir, kind: TriggerKind, price: f64, reference: Option<f64>) -> bool {
    let Some(reference) = reference else {
        return true;
    };
    match (dir, kind) {
        (PositionDir::Long, TriggerKind::Stop) => price < reference,
        (PositionDir::Long, TriggerKind::TakeProfit) => price > reference,
        (PositionDir::Short, TriggerKind::Stop) => price > reference,
        (PositionDir::Short, TriggerKind::TakeProfit) => price < reference,
    }
}

/// Pick the live position entry for a symbol, honoring a hedge-mode direction
/// hint when both sides can be open.
fn resolve_position(
    positions: &[PositionRisk],
    symbol: &str,
    dir_hint: Option<PositionDir>,
) -> Option<(PositionDir, f64)> {
    positions
        .iter()
        .filter(|p| p.symbol == symbol)
        .filter_map(|p| {
            let dir = PositionDir::from_signed_qty(p.position_amt)?;
            Some((dir, p.position_amt.abs()))
        })
        .find(|(dir, _)| dir_hint.map_or(true, |hint| hint == *dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_validity_table() {
        let r = Some(100.0);
        assert!(trigger_valid(PositionDir::Long, TriggerKind::Stop, 99.0, r));
        assert!(!trigger_valid(PositionDir::Long, TriggerKind::Stop, 101.0, r));
        assert!(trigger_valid(PositionDir::Long, TriggerKind::TakeProfit, 101.0, r));
        assert!(!trigger_valid(PositionDir::Long, TriggerKind::TakeProfit, 99.0, r));
        assert!(trigger_valid(PositionDir::Short, TriggerKind::Stop, 101.0, r));
        assert!(!trigger_valid(PositionDir::Short, TriggerKind::Stop, 99.0, r));
        assert!(trigger_valid(PositionDir::Short, TriggerKind::TakeProfit, 99.0, r));
        assert!(!trigger_valid(PositionDir::Short, TriggerKind::TakeProfit, 101.0, r));
        // Degraded mode: no reference accepts anything
        assert!(trigger_valid(PositionDir::Long, TriggerKind::Stop, 101.0, None));
    }

    #[test]
    fn test_derived_triggers() {
        let stop = derive_stop(PositionDir::Long, 100.0, 0.015);
        assert!((stop - 98.5).abs() < 1e-9);
        let tp = derive_take_profit(PositionDir::Long, 100.0, 0.025);
        assert!((tp - 102.5).abs() < 1e-9);

        let stop = derive_stop(PositionDir::Short, 100.0, 0.015);
        assert!((stop - 101.5).abs() < 1e-9);
        let tp = derive_take_profit(PositionDir::Short, 100.0, 0.025);
        assert!((tp - 97.5).abs() < 1e-9);
    }

    #[test]
    fn test_resolve_position() {
        let positions = vec![
            PositionRisk {
                symbol: "BTCUSDT".to_string(),
                position_amt: 0.0,
                position_side: "BOTH".to_string(),
            },
            PositionRisk {
                symbol: "BTCUSDT".to_string(),
                position_amt: -0.5,
                position_side: "SHORT".to_string(),
            },
        ];

        let (dir, qty) = resolve_position(&positions, "BTCUSDT", None).unwrap();
        assert_eq!(dir, PositionDir::Short);
        assert!((qty - 0.5).abs() < 1e-12);

        // A hint for the other side finds nothing
        assert!(resolve_position(&positions, "BTCUSDT", Some(PositionDir::Long)).is_none());
        // Flat entries only
        let flat = vec![PositionRisk {
            symbol: "BTCUSDT".to_string(),
            position_amt: 0.0,
            position_side: "BOTH".to_string(),
        }];
        assert!(resolve_position(&flat, "BTCUSDT", None).is_none());
    }
}
