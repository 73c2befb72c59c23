//! Tick-grid price rounding
//!
//! Exchanges reject trigger prices that are off the tick grid or on the wrong
//! side of the current market. `round_trigger` enforces both: it clamps the
//! price onto the valid side of the reference (plus a safety margin in ticks)
//! and rounds further away from the invalid side.

/// Trigger kind of a protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Stop,
    TakeProfit,
}

/// Direction of the protected position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionDir {
    Long,
    Short,
}

impl PositionDir {
    pub fn from_signed_qty(qty: f64) -> Option<Self> {
        if qty > 0.0 {
            Some(PositionDir::Long)
        } else if qty < 0.0 {
            Some(PositionDir::Short)
        } else {
            None
        }
    }
}

// Relative slack so values sitting exactly on a grid line do not slip a cell
// from float division error (e.g. 100.0 / 0.1).
const REL_EPS: f64 = 1e-9;

/// Round down to a multiple of `step`. A non-positive step returns the value
/// unchanged.
pub fn floor_to(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    ((value / step) + REL_EPS).floor() * step
}

/// Round up to a multiple of `step`. A non-positive step returns the value
/// unchanged.
pub fn ceil_to(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    ((value / step) - REL_EPS).ceil() * step
}

/// Quantize a trigger price, pushing it onto the valid side of `reference`.
///
/// Valid regions: a long stop sits below the reference and a long take-profit
/// above; shorts mirror. The price is first clamped at least `safety_ticks`
/// ticks clear of the reference, then rounded away from the invalid side.
/// Without a reference the price is merely floored to the tick.
pub fn round_trigger(
    dir: PositionDir,
    kind: TriggerKind,
    price: f64,
    reference: Option<f64>,
    tick: f64,
    safety_ticks: u32,
) -> f64 {
    let reference = match reference {
        Some(r) => r,
        None => return floor_to(price, tick),
    };
    let margin = safety_ticks as f64 * tick;
    match (dir, kind) {
        (PositionDir::Long, TriggerKind::Stop) | (PositionDir::Short, TriggerKind::TakeProfit) => {
            floor_to(price.min(reference - margin), tick)
        }
        (PositionDir::Long, TriggerKind::TakeProfit) | (PositionDir::Short, TriggerKind::Stop) => {
            ceil_to(price.max(reference + margin), tick)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_ceil_basic() {
        assert!((floor_to(100.07, 0.1) - 100.0).abs() < 1e-9);
        assert!((ceil_to(100.01, 0.1) - 100.1).abs() < 1e-9);
        // On-grid values stay put in both directions
        assert!((floor_to(100.0, 0.1) - 100.0).abs() < 1e-9);
        assert!((ceil_to(100.0, 0.1) - 100.0).abs() < 1e-9);
        // Degenerate step
        assert_eq!(floor_to(100.07, 0.0), 100.07);
    }

    #[test]
    fn test_long_stop_pushed_below_reference() {
        // Spec scenario: long stop requested above the market must come back
        // at or below reference - 1 tick.
        let p = round_trigger(
            PositionDir::Long,
            TriggerKind::Stop,
            100.05,
            Some(100.0),
            0.1,
            1,
        );
        assert!(p <= 99.9 + 1e-9, "got {}", p);
        assert!(p < 100.0);
    }

    #[test]
    fn test_all_side_kind_combinations() {
        let tick = 0.1;
        let reference = Some(100.0);

        // Long stop: strictly below reference
        let p = round_trigger(PositionDir::Long, TriggerKind::Stop, 99.5, reference, tick, 1);
        assert!(p < 100.0);
        assert!((p - 99.5).abs() < 1e-9);

        // Long take-profit: strictly above
        let p = round_trigger(
            PositionDir::Long,
            TriggerKind::TakeProfit,
            99.95,
            reference,
            tick,
            1,
        );
        assert!(p > 100.0);
        assert!((p - 100.1).abs() < 1e-9);

        // Short stop: strictly above
        let p = round_trigger(PositionDir::Short, TriggerKind::Stop, 99.8, reference, tick, 1);
        assert!(p > 100.0);

        // Short take-profit: strictly below
        let p = round_trigger(
            PositionDir::Short,
            TriggerKind::TakeProfit,
            100.3,
            reference,
            tick,
            1,
        );
        assert!(p < 100.0);
    }

    #[test]
    fn test_wider_safety_margin() {
        let p = round_trigger(
            PositionDir::Long,
            TriggerKind::Stop,
            99.99,
            Some(100.0),
            0.1,
            4,
        );
        assert!(p <= 99.6 + 1e-9, "got {}", p);
    }

    #[test]
    fn test_no_reference_degrades_to_floor() {
        let p = round_trigger(PositionDir::Long, TriggerKind::TakeProfit, 101.27, None, 0.1, 3);
        assert!((p - 101.2).abs() < 1e-9);
    }
}
