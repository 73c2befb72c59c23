//! Fixed-order feature vector shared between the snapshot producer and the
//! policy estimators.
//!
//! The name list is a contract: the estimator matrices are sized to it and a
//! persisted policy state is only valid against the same ordering.

use std::collections::HashMap;

/// Feature names, in estimator order. Do not reorder without migrating
/// persisted policy state.
pub const FEATURE_NAMES: [&str; 10] = [
    "trend",
    "atr_pct",
    "rsi",
    "macd_hist",
    "bb_width",
    "volume_ratio",
    "spread_bp",
    "funding_rate",
    "hour_sin",
    "hour_cos",
];

/// Estimator dimension.
pub const DIM: usize = FEATURE_NAMES.len();

/// Ordered numeric context for one trading opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: [f64; DIM],
}

impl FeatureVector {
    /// Build from a name → value mapping. Unknown keys are ignored, missing
    /// keys default to 0.0, non-finite values are zeroed.
    pub fn from_map(map: &HashMap<String, f64>) -> Self {
        let mut values = [0.0; DIM];
        for (i, name) in FEATURE_NAMES.iter().enumerate() {
            if let Some(v) = map.get(*name) {
                if v.is_finite() {
                    values[i] = *v;
                }
            }
        }
        Self { values }
    }

    pub fn zeros() -> Self {
        Self { values: [0.0; DIM] }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Copy of the vector with every component multiplied by `mult`.
    pub fn scaled(&self, mult: f64) -> [f64; DIM] {
        let mut out = self.values;
        for v in &mut out {
            *v *= mult;
        }
        out
    }

    /// Look up a single feature by name.
    pub fn value(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }
}

impl From<[f64; DIM]> for FeatureVector {
    fn from(values: [f64; DIM]) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_map_defaults_and_ignores() {
        let mut map = HashMap::new();
        map.insert("trend".to_string(), 0.8);
        map.insert("rsi".to_string(), 62.0);
        map.insert("not_a_feature".to_string(), 99.0);
        map.insert("spread_bp".to_string(), f64::NAN);

        let fv = FeatureVector::from_map(&map);
        assert_eq!(fv.value("trend"), Some(0.8));
        assert_eq!(fv.value("rsi"), Some(62.0));
        // Missing key defaults to zero
        assert_eq!(fv.value("macd_hist"), Some(0.0));
        // NaN is zeroed rather than poisoning the matrices
        assert_eq!(fv.value("spread_bp"), Some(0.0));
        // Unknown key has no slot
        assert_eq!(fv.value("not_a_feature"), None);
    }

    #[test]
    fn test_scaled() {
        let mut map = HashMap::new();
        map.insert("trend".to_string(), 2.0);
        let fv = FeatureVector::from_map(&map);
        let scaled = fv.scaled(1.5);
        assert_eq!(scaled[0], 3.0);
        assert_eq!(scaled[1], 0.0);
    }
}
