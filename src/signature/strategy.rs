//! Template strategy selection.
//!
//! Each strategy pairs a matcher (dose-form keywords, route keywords, PRN
//! flag, device dosing) with a template key, a verb and a priority. The
//! highest-priority match wins; a tie at the top is an error, not a coin flip.

use serde::{Deserialize, Serialize};

use super::catalog::{
    DEFAULT_TEMPLATE, DEVICE_TEMPLATE, INJECTION_TEMPLATE, LIQUID_TEMPLATE, ORAL_TABLET_TEMPLATE,
    PRN_TEMPLATE,
};
use super::SignatureError;

/// Criteria a request must meet. Empty keyword lists and `None` flags match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyMatcher {
    pub dose_form_keywords: Vec<String>,
    pub route_keywords: Vec<String>,
    pub as_needed: Option<bool>,
    pub device_dosing: Option<bool>,
}

impl StrategyMatcher {
    pub fn dose_forms(mut self, keywords: &[&str]) -> Self {
        self.dose_form_keywords = keywords.iter().map(|k| k.to_lowercase()).collect();
        self
    }

    pub fn routes(mut self, keywords: &[&str]) -> Self {
        self.route_keywords = keywords.iter().map(|k| k.to_lowercase()).collect();
        self
    }

    pub fn as_needed(mut self, flag: bool) -> Self {
        self.as_needed = Some(flag);
        self
    }

    pub fn device_dosing(mut self, flag: bool) -> Self {
        self.device_dosing = Some(flag);
        self
    }

    pub fn matches(&self, request: &StrategyRequest<'_>) -> bool {
        let dose_form = request.dose_form.to_lowercase();
        let route = request.route.to_lowercase();
        contains_any(&dose_form, &self.dose_form_keywords)
            && contains_any(&route, &self.route_keywords)
            && self.as_needed.map_or(true, |flag| flag == request.as_needed)
            && self
                .device_dosing
                .map_or(true, |flag| flag == request.device_dosing)
    }
}

fn contains_any(haystack: &str, keywords: &[String]) -> bool {
    keywords.is_empty() || keywords.iter().any(|k| haystack.contains(k.as_str()))
}

/// What selection sees of a signature request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyRequest<'a> {
    pub dose_form: &'a str,
    /// Canonical route code.
    pub route: &'a str,
    pub as_needed: bool,
    /// Dose expressed in a dispenser unit (clicks, drops) rather than a dose form.
    pub device_dosing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStrategy {
    pub id: String,
    pub template_key: String,
    /// Verb key the templates translate (take, apply, inject, inhale, instill).
    pub verb: String,
    pub priority: i32,
    pub matcher: StrategyMatcher,
    /// Routes with their own verb (eye drops are instilled) override `verb`.
    #[serde(default)]
    pub route_verbs: bool,
}

impl TemplateStrategy {
    pub fn new(id: &str, template_key: &str, verb: &str, priority: i32, matcher: StrategyMatcher) -> Self {
        Self {
            id: id.into(),
            template_key: template_key.into(),
            verb: verb.into(),
            priority,
            matcher,
            route_verbs: false,
        }
    }

    pub fn with_route_verbs(mut self) -> Self {
        self.route_verbs = true;
        self
    }

    /// Verb key for a canonical route.
    pub fn verb_for(&self, route: &str) -> &str {
        if self.route_verbs {
            if let Some(verb) = route_verb(route) {
                return verb;
            }
        }
        &self.verb
    }
}

/// Administration verb a route implies regardless of dose form.
pub fn route_verb(route: &str) -> Option<&'static str> {
    match route {
        "ophthalmic" | "otic" | "nasal" => Some("instill"),
        "inhalation" => Some("inhale"),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    strategies: Vec<TemplateStrategy>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for strategy in default_strategies() {
            if let Err(e) = registry.register(strategy) {
                tracing::error!(error = %e, "Built-in template strategy rejected");
            }
        }
        registry
    }

    /// Rejects a reused id, and a matcher identical to one already
    /// registered at the same priority.
    pub fn register(&mut self, strategy: TemplateStrategy) -> Result<(), SignatureError> {
        if self.strategies.iter().any(|s| s.id == strategy.id) {
            return Err(SignatureError::DuplicateStrategy { id: strategy.id });
        }
        if let Some(existing) = self
            .strategies
            .iter()
            .find(|s| s.priority == strategy.priority && s.matcher == strategy.matcher)
        {
            return Err(SignatureError::PriorityConflict {
                id: strategy.id,
                existing: existing.id.clone(),
                priority: strategy.priority,
            });
        }
        tracing::debug!(id = %strategy.id, priority = strategy.priority, "Template strategy registered");
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TemplateStrategy> {
        self.strategies.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn select(&self, request: &StrategyRequest<'_>) -> Result<&TemplateStrategy, SignatureError> {
        let matching: Vec<&TemplateStrategy> = self
            .strategies
            .iter()
            .filter(|s| s.matcher.matches(request))
            .collect();

        let Some(top) = matching.iter().map(|s| s.priority).max() else {
            return Err(SignatureError::NoMatchingStrategy {
                dose_form: request.dose_form.into(),
                route: request.route.into(),
            });
        };

        let mut best: Vec<&TemplateStrategy> =
            matching.into_iter().filter(|s| s.priority == top).collect();
        if best.len() > 1 {
            let mut candidates: Vec<String> = best.iter().map(|s| s.id.clone()).collect();
            candidates.sort();
            return Err(SignatureError::AmbiguousStrategy {
                candidates,
                priority: top,
            });
        }
        Ok(best.remove(0))
    }
}

pub fn default_strategies() -> Vec<TemplateStrategy> {
    vec![
        TemplateStrategy::new("prn", PRN_TEMPLATE, "take", 100, StrategyMatcher::default().as_needed(true))
            .with_route_verbs(),
        TemplateStrategy::new(
            "device",
            DEVICE_TEMPLATE,
            "apply",
            90,
            StrategyMatcher::default().device_dosing(true),
        )
        .with_route_verbs(),
        TemplateStrategy::new(
            "injection",
            INJECTION_TEMPLATE,
            "inject",
            80,
            StrategyMatcher::default().routes(&[
                "subcutaneous",
                "intramuscular",
                "intravenous",
                "intradermal",
            ]),
        ),
        TemplateStrategy::new(
            "injection-form",
            INJECTION_TEMPLATE,
            "inject",
            79,
            StrategyMatcher::default().dose_forms(&["inject", "prefilled pen", "pen injector", "vial", "syringe"]),
        ),
        TemplateStrategy::new(
            "liquid",
            LIQUID_TEMPLATE,
            "take",
            70,
            StrategyMatcher::default().dose_forms(&[
                "solution",
                "suspension",
                "syrup",
                "elixir",
                "liquid",
            ]),
        ),
        TemplateStrategy::new(
            "inhaler",
            DEFAULT_TEMPLATE,
            "inhale",
            65,
            StrategyMatcher::default().dose_forms(&["inhal", "aerosol", "nebul"]),
        ),
        TemplateStrategy::new(
            "oral-tablet",
            ORAL_TABLET_TEMPLATE,
            "take",
            60,
            StrategyMatcher::default().dose_forms(&["tablet", "capsule", "caplet", "lozenge"]),
        ),
        TemplateStrategy::new(
            "topical",
            DEFAULT_TEMPLATE,
            "apply",
            50,
            StrategyMatcher::default().dose_forms(&["cream", "ointment", "gel", "lotion", "patch"]),
        ),
        TemplateStrategy::new("default", DEFAULT_TEMPLATE, "take", 0, StrategyMatcher::default()),
    ]
}
