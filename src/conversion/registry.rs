//! Tier 1: the dimensional unit registry.
//!
//! A static UCUM-like table. Every unit carries its factor to the base unit of
//! its dimension (g, L, {count}, s), so same-dimension conversion is a single
//! multiplication. Symbols are case-sensitive as in UCUM; synonyms are matched
//! case-insensitively ("ml", "cc", "milliliters" all resolve to `mL`).

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::types::Dimension;
use super::ConversionError;

/// A standard unit row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unit {
    pub symbol: &'static str,
    pub name: &'static str,
    pub dimension: Dimension,
    /// Multiply by this to reach the dimension's base unit.
    pub to_base: f64,
    pub synonyms: &'static [&'static str],
}

static STANDARD_UNITS: &[Unit] = &[
    // Mass (base: g)
    Unit { symbol: "kg", name: "kilogram", dimension: Dimension::Mass, to_base: 1e3, synonyms: &["kilogram", "kilograms", "kgs"] },
    Unit { symbol: "g", name: "gram", dimension: Dimension::Mass, to_base: 1.0, synonyms: &["gram", "grams", "gm", "gms"] },
    Unit { symbol: "mg", name: "milligram", dimension: Dimension::Mass, to_base: 1e-3, synonyms: &["milligram", "milligrams", "mgs"] },
    Unit { symbol: "ug", name: "microgram", dimension: Dimension::Mass, to_base: 1e-6, synonyms: &["microgram", "micrograms", "mcg", "µg", "μg"] },
    Unit { symbol: "ng", name: "nanogram", dimension: Dimension::Mass, to_base: 1e-9, synonyms: &["nanogram", "nanograms"] },
    // Volume (base: L)
    Unit { symbol: "L", name: "liter", dimension: Dimension::Volume, to_base: 1.0, synonyms: &["liter", "liters", "litre", "litres"] },
    Unit { symbol: "dL", name: "deciliter", dimension: Dimension::Volume, to_base: 1e-1, synonyms: &["deciliter", "deciliters"] },
    Unit { symbol: "mL", name: "milliliter", dimension: Dimension::Volume, to_base: 1e-3, synonyms: &["milliliter", "milliliters", "millilitre", "millilitres", "cc", "cm3"] },
    Unit { symbol: "uL", name: "microliter", dimension: Dimension::Volume, to_base: 1e-6, synonyms: &["microliter", "microliters", "µl", "μl", "mcl"] },
    Unit { symbol: "[tsp_us]", name: "teaspoon", dimension: Dimension::Volume, to_base: 4.928_921_593_75e-3, synonyms: &["tsp", "teaspoon", "teaspoons"] },
    Unit { symbol: "[tbs_us]", name: "tablespoon", dimension: Dimension::Volume, to_base: 1.478_676_478_125e-2, synonyms: &["tbsp", "tablespoon", "tablespoons"] },
    // Count (base: {count})
    Unit { symbol: "{count}", name: "count", dimension: Dimension::Count, to_base: 1.0, synonyms: &["count", "each", "ea", "1"] },
    Unit { symbol: "[doz]", name: "dozen", dimension: Dimension::Count, to_base: 12.0, synonyms: &["dozen"] },
    // Time (base: s)
    Unit { symbol: "s", name: "second", dimension: Dimension::Time, to_base: 1.0, synonyms: &["second", "seconds", "sec", "secs"] },
    Unit { symbol: "min", name: "minute", dimension: Dimension::Time, to_base: 60.0, synonyms: &["minute", "minutes", "mins"] },
    Unit { symbol: "h", name: "hour", dimension: Dimension::Time, to_base: 3_600.0, synonyms: &["hour", "hours", "hr", "hrs"] },
    Unit { symbol: "d", name: "day", dimension: Dimension::Time, to_base: 86_400.0, synonyms: &["day", "days"] },
    Unit { symbol: "wk", name: "week", dimension: Dimension::Time, to_base: 604_800.0, synonyms: &["week", "weeks", "wks"] },
];

/// Anything outside letters, digits and UCUM punctuation is malformed.
static UNIT_SYNTAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\p{N}\[\]{}_./%*^'-]+$").unwrap());

/// Minimum Jaro-Winkler similarity for a spelling suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;
const MAX_SUGGESTIONS: usize = 3;

/// Outcome of validating a unit spelling. Never an error: malformed input
/// comes back with `valid = false` and a reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitValidation {
    pub valid: bool,
    pub normalized_form: Option<String>,
    pub error: Option<String>,
    pub suggestions: Vec<String>,
}

impl UnitValidation {
    pub(crate) fn ok(normalized: &str) -> Self {
        Self {
            valid: true,
            normalized_form: Some(normalized.into()),
            error: None,
            suggestions: Vec::new(),
        }
    }

    pub(crate) fn invalid(error: String, suggestions: Vec<String>) -> Self {
        Self {
            valid: false,
            normalized_form: None,
            error: Some(error),
            suggestions,
        }
    }
}

/// Immutable lookup over the standard unit table.
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    units: &'static [Unit],
    by_symbol: HashMap<&'static str, usize>,
    /// Lowercased symbols and synonyms.
    by_spelling: HashMap<String, usize>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        let mut by_symbol = HashMap::new();
        let mut by_spelling = HashMap::new();
        for (idx, unit) in STANDARD_UNITS.iter().enumerate() {
            by_symbol.insert(unit.symbol, idx);
            by_spelling.insert(unit.symbol.to_lowercase(), idx);
            for synonym in unit.synonyms {
                by_spelling.insert(synonym.to_lowercase(), idx);
            }
        }
        Self {
            units: STANDARD_UNITS,
            by_symbol,
            by_spelling,
        }
    }

    pub fn units(&self) -> &'static [Unit] {
        self.units
    }

    /// Resolve any accepted spelling to its unit row.
    pub fn resolve(&self, raw: &str) -> Option<&'static Unit> {
        let trimmed = raw.trim();
        if let Some(&idx) = self.by_symbol.get(trimmed) {
            return Some(&self.units[idx]);
        }
        self.by_spelling
            .get(&trimmed.to_lowercase())
            .map(|&idx| &self.units[idx])
    }

    /// Canonical symbol for a spelling, if known.
    pub fn normalize(&self, raw: &str) -> Option<&'static str> {
        self.resolve(raw).map(|u| u.symbol)
    }

    pub fn validate(&self, raw: &str) -> UnitValidation {
        if let Some(err) = syntax_error(raw) {
            return UnitValidation::invalid(err, Vec::new());
        }
        match self.resolve(raw) {
            Some(unit) => UnitValidation::ok(unit.symbol),
            None => UnitValidation::invalid(
                format!("unknown unit '{}'", raw.trim()),
                self.suggest(raw),
            ),
        }
    }

    /// Symbols sharing the dimension of `raw`, itself included. Empty when unknown.
    pub fn compatible_units(&self, raw: &str) -> Vec<&'static str> {
        match self.resolve(raw) {
            Some(unit) => self
                .units
                .iter()
                .filter(|u| u.dimension == unit.dimension)
                .map(|u| u.symbol)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn are_units_compatible(&self, a: &str, b: &str) -> bool {
        match (self.resolve(a), self.resolve(b)) {
            (Some(a), Some(b)) => a.dimension == b.dimension,
            _ => false,
        }
    }

    /// Factor such that `value_in_from * factor = value_in_to`.
    pub fn conversion_factor(&self, from: &str, to: &str) -> Result<f64, ConversionError> {
        let from_unit = self.require(from)?;
        let to_unit = self.require(to)?;
        if from_unit.dimension != to_unit.dimension {
            return Err(ConversionError::impossible(
                from,
                to,
                format!(
                    "{} measures {}, {} measures {}",
                    from_unit.symbol, from_unit.dimension, to_unit.symbol, to_unit.dimension
                ),
            ));
        }
        Ok(from_unit.to_base / to_unit.to_base)
    }

    pub fn convert(&self, value: f64, from: &str, to: &str) -> Result<f64, ConversionError> {
        Ok(value * self.conversion_factor(from, to)?)
    }

    /// Resolve or fail with `InvalidUnit` carrying suggestions.
    pub fn require(&self, raw: &str) -> Result<&'static Unit, ConversionError> {
        self.resolve(raw).ok_or_else(|| {
            let validation = self.validate(raw);
            ConversionError::InvalidUnit {
                unit: raw.into(),
                validation_error: validation.error,
                suggestions: validation.suggestions,
            }
        })
    }

    /// Closest known spellings, mapped to canonical symbols.
    pub fn suggest(&self, raw: &str) -> Vec<String> {
        let spellings = self
            .by_spelling
            .iter()
            .map(|(spelling, &idx)| (spelling.as_str(), self.units[idx].symbol));
        rank_suggestions(raw, spellings)
    }
}

/// `Some(reason)` when the spelling cannot be a unit at all.
pub(crate) fn syntax_error(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some("unit is empty".into());
    }
    if !UNIT_SYNTAX.is_match(trimmed) {
        return Some(format!("'{trimmed}' contains characters not allowed in a unit"));
    }
    None
}

/// Rank `(spelling, canonical)` candidates by similarity to `raw`; returns
/// distinct canonical symbols, best first.
pub(crate) fn rank_suggestions<'a>(
    raw: &str,
    candidates: impl Iterator<Item = (&'a str, &'a str)>,
) -> Vec<String> {
    let needle = raw.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(f64, &str)> = candidates
        .map(|(spelling, canonical)| (strsim::jaro_winkler(&needle, spelling), canonical))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let mut suggestions: Vec<String> = Vec::new();
    for (_, canonical) in scored {
        if !suggestions.iter().any(|s| s == canonical) {
            suggestions.push(canonical.to_string());
        }
        if suggestions.len() == MAX_SUGGESTIONS {
            break;
        }
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn synonyms_normalize() {
        let registry = UnitRegistry::new();
        assert_eq!(registry.normalize("mL"), Some("mL"));
        assert_eq!(registry.normalize("ml"), Some("mL"));
        assert_eq!(registry.normalize(" cc "), Some("mL"));
        assert_eq!(registry.normalize("mcg"), Some("ug"));
        assert_eq!(registry.normalize("µg"), Some("ug"));
        assert_eq!(registry.normalize("Milligrams"), Some("mg"));
        assert_eq!(registry.normalize("hours"), Some("h"));
        assert_eq!(registry.normalize("furlong"), None);
    }

    #[test]
    fn mass_conversions() {
        let registry = UnitRegistry::new();
        assert!(approx(registry.convert(500.0, "mg", "g").unwrap(), 0.5));
        assert!(approx(registry.convert(1.0, "g", "mcg").unwrap(), 1_000_000.0));
        assert!(approx(registry.convert(2.5, "kg", "mg").unwrap(), 2_500_000.0));
    }

    #[test]
    fn volume_and_time_conversions() {
        let registry = UnitRegistry::new();
        assert!(approx(registry.convert(1.0, "L", "mL").unwrap(), 1000.0));
        assert!(approx(registry.convert(1.0, "tsp", "mL").unwrap(), 4.92892159375));
        assert!(approx(registry.convert(1.0, "d", "h").unwrap(), 24.0));
        assert!(approx(registry.convert(90.0, "min", "h").unwrap(), 1.5));
    }

    #[test]
    fn incompatible_dimensions_are_impossible() {
        let registry = UnitRegistry::new();
        let err = registry.convert(1.0, "mg", "h").unwrap_err();
        match err {
            ConversionError::ImpossibleConversion { from, to, reason } => {
                assert_eq!(from, "mg");
                assert_eq!(to, "h");
                assert!(reason.contains("mass"));
                assert!(reason.contains("time"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_unit_is_invalid_with_suggestions() {
        let registry = UnitRegistry::new();
        let err = registry.convert(1.0, "milligramz", "g").unwrap_err();
        match err {
            ConversionError::InvalidUnit {
                unit, suggestions, ..
            } => {
                assert_eq!(unit, "milligramz");
                assert_eq!(suggestions.first().map(String::as_str), Some("mg"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn validate_soft_fails() {
        let registry = UnitRegistry::new();
        let empty = registry.validate("   ");
        assert!(!empty.valid);
        assert_eq!(empty.error.as_deref(), Some("unit is empty"));

        let garbage = registry.validate("m g!");
        assert!(!garbage.valid);
        assert!(garbage.error.unwrap().contains("not allowed"));

        let ok = registry.validate("ml");
        assert!(ok.valid);
        assert_eq!(ok.normalized_form.as_deref(), Some("mL"));
    }

    #[test]
    fn compatible_units_share_dimension() {
        let registry = UnitRegistry::new();
        let mass = registry.compatible_units("mg");
        assert!(mass.contains(&"kg"));
        assert!(mass.contains(&"ug"));
        assert!(!mass.contains(&"mL"));
        assert!(registry.compatible_units("nope").is_empty());
    }

    #[test]
    fn are_units_compatible_checks_dimension() {
        let registry = UnitRegistry::new();
        assert!(registry.are_units_compatible("mg", "kg"));
        assert!(registry.are_units_compatible("ml", "L"));
        assert!(!registry.are_units_compatible("mg", "mL"));
        assert!(!registry.are_units_compatible("mg", "unknown"));
    }

    #[test]
    fn every_spelling_resolves_to_its_row() {
        let registry = UnitRegistry::new();
        for unit in registry.units() {
            assert_eq!(registry.normalize(unit.symbol), Some(unit.symbol));
            for synonym in unit.synonyms {
                assert_eq!(registry.normalize(synonym), Some(unit.symbol), "{synonym}");
            }
        }
    }
}
