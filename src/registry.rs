//! Logical model names, bindings, and selection policy.
//!
//! A binding is a concrete `(provider, model)` pair plus pricing; its
//! composite key `"provider:model"` addresses limiter buckets and breaker
//! state. The registry maps every model name and alias to the ordered list
//! of bindings registered under it.

use crate::error::Error;
use crate::provider::PriceTable;
use crate::types::ChatRequest;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub provider_key: String,
    pub model: String,
    pub price: Option<PriceTable>,
}

impl Binding {
    pub fn new(provider_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider_key: provider_key.into(), model: model.into(), price: None }
    }

    pub fn with_price(mut self, price: PriceTable) -> Self {
        self.price = Some(price);
        self
    }

    /// Composite key addressing limiter and breaker state.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider_key, self.model)
    }
}

/// A `(provider, model)` pair handed to the fallback and race composers,
/// dispatched with direct addressing (no logical-name resolution).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spec {
    pub provider: String,
    pub model: String,
}

impl Spec {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: model.into() }
    }

    /// Rewrite a request to address this spec directly.
    pub(crate) fn apply(&self, mut request: ChatRequest) -> ChatRequest {
        request.model = self.model.clone();
        request.provider = Some(self.provider.clone());
        request
    }
}

/// One model a provider serves, with optional aliases and pricing.
#[derive(Debug, Clone, Default)]
pub struct ModelEntry {
    pub name: String,
    pub aliases: Vec<String>,
    pub input_per_1k: Option<f64>,
    pub output_per_1k: Option<f64>,
}

impl ModelEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn price(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_per_1k = Some(input_per_1k);
        self.output_per_1k = Some(output_per_1k);
        self
    }

    fn price_table(&self) -> Option<PriceTable> {
        if self.input_per_1k.is_none() && self.output_per_1k.is_none() {
            return None;
        }
        Some(PriceTable::new(
            self.input_per_1k.unwrap_or(0.0),
            self.output_per_1k.unwrap_or(0.0),
        ))
    }
}

/// How `resolve` picks among multiple bindings for one logical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// First binding in registration order.
    #[default]
    First,
    /// Rotate through the bindings; the cursor is per logical name.
    RoundRobin,
    /// Minimum `input_per_1k + output_per_1k`; absent prices count as 0.0,
    /// ties break by registration order.
    Cheapest,
}

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    bindings: HashMap<String, Vec<Binding>>,
    cursors: Mutex<HashMap<String, usize>>,
    policy: SelectionPolicy,
}

impl ProviderRegistry {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy, ..Default::default() }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Register a provider's models. Every name and alias gets the binding
    /// appended, preserving registration order.
    pub fn add(&mut self, provider_key: impl Into<String>, models: Vec<ModelEntry>) {
        let provider_key = provider_key.into();
        for entry in models {
            let binding = Binding {
                provider_key: provider_key.clone(),
                model: entry.name.clone(),
                price: entry.price_table(),
            };
            self.bindings
                .entry(entry.name.clone())
                .or_default()
                .push(binding.clone());
            for alias in &entry.aliases {
                self.bindings
                    .entry(alias.clone())
                    .or_default()
                    .push(binding.clone());
            }
        }
    }

    /// All provider keys that appear in any binding.
    pub fn provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .bindings
            .values()
            .flatten()
            .map(|b| b.provider_key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Ordered binding list for a logical name, if registered.
    pub fn resolve_all(&self, logical: &str) -> Option<&[Binding]> {
        self.bindings.get(logical).map(|v| v.as_slice())
    }

    /// Pick one binding for a logical name according to the policy.
    pub fn resolve(&self, logical: &str) -> Result<Binding, Error> {
        let list = self
            .bindings
            .get(logical)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::config(format!("unknown model {logical:?}")))?;

        let binding = match self.policy {
            SelectionPolicy::First => &list[0],
            SelectionPolicy::RoundRobin => {
                let mut cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
                let cursor = cursors.entry(logical.to_string()).or_insert(0);
                let picked = &list[*cursor % list.len()];
                *cursor = cursor.wrapping_add(1);
                picked
            }
            SelectionPolicy::Cheapest => {
                // Strict less-than keeps the earliest registration on ties.
                let mut best = &list[0];
                let mut best_rate = combined_rate(best);
                for candidate in &list[1..] {
                    let rate = combined_rate(candidate);
                    if rate < best_rate {
                        best = candidate;
                        best_rate = rate;
                    }
                }
                best
            }
        };
        Ok(binding.clone())
    }

    /// Pricing for an exact `(provider, model)` pair, used by direct
    /// addressing.
    pub fn lookup_price(&self, provider_key: &str, model: &str) -> Option<PriceTable> {
        self.bindings.get(model).and_then(|list| {
            list.iter()
                .find(|b| b.provider_key == provider_key && b.model == model)
                .and_then(|b| b.price)
        })
    }
}

fn combined_rate(binding: &Binding) -> f64 {
    binding.price.map(|p| p.combined()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(policy: SelectionPolicy) -> ProviderRegistry {
        let mut reg = ProviderRegistry::new(policy);
        reg.add(
            "alpha",
            vec![ModelEntry::new("alpha-large").alias("fast").price(0.03, 0.06)],
        );
        reg.add(
            "beta",
            vec![ModelEntry::new("beta-small").alias("fast").price(0.001, 0.002)],
        );
        reg
    }

    #[test]
    fn first_policy_returns_registration_order() {
        let reg = registry(SelectionPolicy::First);
        assert_eq!(reg.resolve("fast").unwrap().provider_key, "alpha");
    }

    #[test]
    fn cheapest_policy_picks_lowest_combined_rate() {
        let reg = registry(SelectionPolicy::Cheapest);
        let binding = reg.resolve("fast").unwrap();
        assert_eq!(binding.provider_key, "beta");
        assert_eq!(binding.model, "beta-small");
    }

    #[test]
    fn cheapest_ties_break_by_registration_order() {
        let mut reg = ProviderRegistry::new(SelectionPolicy::Cheapest);
        reg.add("one", vec![ModelEntry::new("m-one").alias("tied").price(0.01, 0.01)]);
        reg.add("two", vec![ModelEntry::new("m-two").alias("tied").price(0.01, 0.01)]);
        assert_eq!(reg.resolve("tied").unwrap().provider_key, "one");
    }

    #[test]
    fn round_robin_rotates_per_logical_name() {
        let reg = registry(SelectionPolicy::RoundRobin);
        let a = reg.resolve("fast").unwrap();
        let b = reg.resolve("fast").unwrap();
        let c = reg.resolve("fast").unwrap();
        assert_eq!(a.provider_key, "alpha");
        assert_eq!(b.provider_key, "beta");
        assert_eq!(c.provider_key, "alpha");
        // Single-binding name keeps its own cursor.
        assert_eq!(reg.resolve("alpha-large").unwrap().provider_key, "alpha");
        assert_eq!(reg.resolve("alpha-large").unwrap().provider_key, "alpha");
    }

    #[test]
    fn unknown_logical_name_is_a_config_error() {
        let reg = registry(SelectionPolicy::First);
        let err = reg.resolve("nope").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConfigError);
    }

    #[test]
    fn alias_resolves_to_a_registered_concrete_name() {
        let reg = registry(SelectionPolicy::First);
        let names: Vec<String> = reg
            .resolve_all("fast")
            .unwrap()
            .iter()
            .map(|b| b.model.clone())
            .collect();
        let resolved = reg.resolve("fast").unwrap();
        assert!(names.contains(&resolved.model));
    }

    #[test]
    fn binding_key_is_provider_colon_model() {
        assert_eq!(Binding::new("x", "m").key(), "x:m");
    }

    #[test]
    fn lookup_price_matches_exact_pair() {
        let reg = registry(SelectionPolicy::First);
        let price = reg.lookup_price("beta", "beta-small").unwrap();
        assert_eq!(price.input_per_1k, 0.001);
        assert!(reg.lookup_price("beta", "alpha-large").is_none());
    }
}
