//! Geo-target rotation.
//!
//! Picks the country each trace egresses from, cycling a configured pool or
//! drawing from it by weight.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeoStrategy {
    #[default]
    RoundRobin,
    Weighted,
}

/// Outcome of geo resolution for a single trace request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoSelection {
    /// Country forced by the request, if any.
    pub requested: Option<String>,
    pub pool: Vec<String>,
    pub strategy: GeoStrategy,
    /// Country actually used for the trace.
    pub resolved: Option<String>,
}

/// Country selector shared by all traces; only the cursor is mutable.
#[derive(Debug)]
pub struct GeoRotator {
    pool: Vec<String>,
    strategy: GeoStrategy,
    weights: HashMap<String, f64>,
    cursor: Mutex<usize>,
}

impl GeoRotator {
    pub fn new<I, S>(pool: I, strategy: GeoStrategy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            pool: pool
                .into_iter()
                .map(|code| code.as_ref().trim().to_ascii_lowercase())
                .filter(|code| !code.is_empty())
                .collect(),
            strategy,
            weights: HashMap::new(),
            cursor: Mutex::new(0),
        }
    }

    pub fn with_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.weights = weights
            .into_iter()
            .map(|(code, weight)| (code.to_ascii_lowercase(), weight))
            .collect();
        self
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn strategy(&self) -> GeoStrategy {
        self.strategy
    }

    /// Next country from the pool, or `None` when the pool is empty.
    pub fn next(&self) -> Option<String> {
        if self.pool.is_empty() {
            return None;
        }
        match self.strategy {
            GeoStrategy::RoundRobin => {
                let mut cursor = self
                    .cursor
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let code = self.pool[*cursor % self.pool.len()].clone();
                *cursor = (*cursor + 1) % self.pool.len();
                Some(code)
            }
            GeoStrategy::Weighted => self.weighted_choice(&mut rand::thread_rng()).cloned(),
        }
    }

    /// Resolves the trace country: a forced code always wins over the pool.
    pub fn select(&self, forced: Option<&str>) -> GeoSelection {
        let requested = forced
            .map(|code| code.trim().to_ascii_lowercase())
            .filter(|code| !code.is_empty());
        let resolved = requested.clone().or_else(|| self.next());
        GeoSelection {
            requested,
            pool: self.pool.clone(),
            strategy: self.strategy,
            resolved,
        }
    }

    fn weighted_choice<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&String> {
        // Missing weights count as 1.0 so an unweighted pool stays uniform.
        let weights: Vec<f64> = self
            .pool
            .iter()
            .map(|code| self.weights.get(code).copied().unwrap_or(1.0))
            .map(|weight| if weight.is_finite() { weight.max(0.0) } else { 0.0 })
            .collect();
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= f64::EPSILON {
            let index = rng.gen_range(0..self.pool.len());
            return self.pool.get(index);
        }

        let mut target = rng.gen_range(0.0..total);
        for (code, weight) in self.pool.iter().zip(weights.iter()) {
            if target < *weight {
                return Some(code);
            }
            target -= *weight;
        }
        self.pool.last()
    }
}

impl Default for GeoRotator {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), GeoStrategy::RoundRobin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_in_order() {
        let rotator = GeoRotator::new(["us", "gb", "de"], GeoStrategy::RoundRobin);
        let picks: Vec<_> = (0..7).filter_map(|_| rotator.next()).collect();
        assert_eq!(picks, vec!["us", "gb", "de", "us", "gb", "de", "us"]);
    }

    #[test]
    fn empty_pool_yields_none() {
        let rotator = GeoRotator::default();
        assert_eq!(rotator.next(), None);
        assert_eq!(rotator.select(None).resolved, None);
    }

    #[test]
    fn weighted_respects_zero_weights() {
        let mut weights = HashMap::new();
        weights.insert("US".to_string(), 5.0);
        weights.insert("gb".to_string(), 0.0);
        let rotator = GeoRotator::new(["us", "gb"], GeoStrategy::Weighted).with_weights(weights);
        for _ in 0..100 {
            assert_eq!(rotator.next().as_deref(), Some("us"));
        }
    }

    #[test]
    fn weighted_ignores_non_finite_weights() {
        let mut weights = HashMap::new();
        weights.insert("us".to_string(), f64::INFINITY);
        weights.insert("gb".to_string(), f64::NAN);
        weights.insert("de".to_string(), 2.0);
        let rotator = GeoRotator::new(["us", "gb", "de"], GeoStrategy::Weighted).with_weights(weights);
        for _ in 0..50 {
            assert_eq!(rotator.next().as_deref(), Some("de"));
        }

        let mut huge = HashMap::new();
        huge.insert("us".to_string(), f64::MAX);
        huge.insert("gb".to_string(), f64::MAX);
        let rotator = GeoRotator::new(["us", "gb"], GeoStrategy::Weighted).with_weights(huge);
        assert!(rotator.next().is_some());
    }

    #[test]
    fn weighted_without_weights_covers_pool() {
        let rotator = GeoRotator::new(["us", "gb", "de"], GeoStrategy::Weighted);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.extend(rotator.next());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn forced_country_overrides_rotation() {
        let rotator = GeoRotator::new(["us", "gb"], GeoStrategy::RoundRobin);
        let selection = rotator.select(Some("FR"));
        assert_eq!(selection.resolved.as_deref(), Some("fr"));
        assert_eq!(selection.requested.as_deref(), Some("fr"));
        // The cursor did not move.
        assert_eq!(rotator.next().as_deref(), Some("us"));
    }
}
