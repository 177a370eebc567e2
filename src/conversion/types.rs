use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::confidence::ConfidenceScore;

// ═══════════════════════════════════════════════════════════
// Quantities
// ═══════════════════════════════════════════════════════════

/// Dimension class of a standard unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Mass,
    Volume,
    Count,
    Time,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mass => "mass",
            Self::Volume => "volume",
            Self::Count => "count",
            Self::Time => "time",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value with its unit spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: String,
}

impl Quantity {
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", format_number(self.value), self.unit)
    }
}

/// Active ingredient per dispensing unit, e.g. 500 mg / 1 tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrengthRatio {
    pub numerator: Quantity,
    pub denominator: Quantity,
}

impl StrengthRatio {
    pub fn new(numerator: Quantity, denominator: Quantity) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Numerator amount per one denominator unit. `None` when the denominator is not positive.
    pub fn per_unit(&self) -> Option<f64> {
        let den = self.denominator.value;
        (den.is_finite() && den > 0.0 && self.numerator.value.is_finite())
            .then(|| self.numerator.value / den)
    }
}

impl fmt::Display for StrengthRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Render a number without trailing zeros, rounded to 4 decimals.
pub fn format_number(value: f64) -> String {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    if rounded == 0.0 {
        // avoid "-0"
        return "0".into();
    }
    format!("{rounded}")
}

// ═══════════════════════════════════════════════════════════
// Device units
// ═══════════════════════════════════════════════════════════

/// Optional behavior attached to a device unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUnitMetadata {
    /// Dispenser product name, e.g. "Topiclick".
    pub device_name: Option<String>,
    /// Conversions to a non-count dimension go through the medication strength ratio.
    pub requires_strength_ratio: bool,
    /// Each dispense loses some device units to priming.
    pub requires_air_prime: bool,
    /// Extra spellings resolved case-insensitively.
    pub aliases: Vec<String>,
}

/// A non-standard dosing unit.
///
/// `units_per_base` reads "this many device units make one `base_unit`":
/// a Topiclick dispenser has `units_per_base = 4.0` against `mL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUnit {
    pub symbol: String,
    pub plural: String,
    pub base_unit: String,
    /// `None` when the ratio must come from `DispenserMetadata` at conversion time.
    pub units_per_base: Option<f64>,
    /// Smallest deliverable amount (1 click, half a tablet).
    pub granularity: Option<f64>,
    pub metadata: DeviceUnitMetadata,
}

impl DeviceUnit {
    /// A dispenser unit with a fixed ratio to a standard unit.
    pub fn fixed(symbol: &str, plural: &str, base_unit: &str, units_per_base: f64) -> Self {
        Self {
            symbol: symbol.into(),
            plural: plural.into(),
            base_unit: base_unit.into(),
            units_per_base: Some(units_per_base),
            granularity: None,
            metadata: DeviceUnitMetadata::default(),
        }
    }

    /// A dispenser unit whose ratio is only known per call.
    pub fn contextual(symbol: &str, plural: &str, base_unit: &str) -> Self {
        Self {
            units_per_base: None,
            ..Self::fixed(symbol, plural, base_unit, 1.0)
        }
    }

    /// A countable dose form (tablet, capsule, puff). One unit counts as one
    /// `{count}`; mass or volume needs the medication strength ratio.
    pub fn strength_based(symbol: &str, plural: &str) -> Self {
        let mut unit = Self::fixed(symbol, plural, "{count}", 1.0);
        unit.metadata.requires_strength_ratio = true;
        unit
    }

    pub fn with_granularity(mut self, granularity: f64) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn with_device_name(mut self, name: &str) -> Self {
        self.metadata.device_name = Some(name.into());
        self
    }

    pub fn with_air_prime(mut self) -> Self {
        self.metadata.requires_air_prime = true;
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.metadata
            .aliases
            .extend(aliases.iter().map(|a| (*a).to_string()));
        self
    }

    /// Whether a dispenser `device_name` refers to this unit, by symbol or product name.
    pub fn answers_to(&self, name: &str) -> bool {
        let name = name.trim();
        self.symbol.eq_ignore_ascii_case(name)
            || self
                .metadata
                .device_name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
    }

    /// Singular or plural display form for a value.
    pub fn display_for(&self, value: f64) -> &str {
        if value == 1.0 {
            &self.symbol
        } else {
            &self.plural
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════

/// Facts about the physical dispenser in use for one call.
///
/// In a device-to-device conversion these describe the unit `device_name`
/// refers to, or the source unit when no name is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispenserMetadata {
    pub device_name: Option<String>,
    /// Overrides the registered device ratio.
    pub units_per_base: Option<f64>,
    /// Overrides the registered base unit (must be a standard unit).
    pub base_unit: Option<String>,
    /// Device units lost to priming per dispense.
    pub air_prime_loss: Option<f64>,
}

/// Per-call inputs that some conversions need. Built fresh per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionContext {
    pub strength_ratio: Option<StrengthRatio>,
    pub dispenser: Option<DispenserMetadata>,
    /// The caller filled gaps with default assumptions.
    pub used_defaults: bool,
    pub has_lot_specific_data: bool,
    /// Required fields that were silently defaulted before reaching the converter.
    pub defaulted_fields: Vec<String>,
}

impl ConversionContext {
    pub fn with_strength_ratio(mut self, ratio: StrengthRatio) -> Self {
        self.strength_ratio = Some(ratio);
        self
    }

    pub fn with_dispenser(mut self, dispenser: DispenserMetadata) -> Self {
        self.dispenser = Some(dispenser);
        self
    }

    /// Shorthand for a dispenser that only overrides the device ratio.
    pub fn with_ratio(self, units_per_base: f64) -> Self {
        self.with_dispenser(DispenserMetadata {
            units_per_base: Some(units_per_base),
            ..DispenserMetadata::default()
        })
    }

    pub fn with_defaults_used(mut self, used: bool) -> Self {
        self.used_defaults = used;
        self
    }

    pub fn with_lot_specific_data(mut self, has: bool) -> Self {
        self.has_lot_specific_data = has;
        self
    }

    pub fn with_defaulted_field(mut self, field: &str) -> Self {
        self.defaulted_fields.push(field.into());
        self
    }

    /// Names of the context fields that are present, as reported in `MissingContext`.
    pub fn available_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if self.strength_ratio.is_some() {
            fields.push("strengthRatio".to_string());
        }
        if let Some(dispenser) = &self.dispenser {
            if dispenser.device_name.is_some() {
                fields.push("dispenser.deviceName".into());
            }
            if dispenser.units_per_base.is_some() {
                fields.push("dispenser.unitsPerBase".into());
            }
            if dispenser.base_unit.is_some() {
                fields.push("dispenser.baseUnit".into());
            }
            if dispenser.air_prime_loss.is_some() {
                fields.push("dispenser.airPrimeLoss".into());
            }
        }
        if self.has_lot_specific_data {
            fields.push("hasLotSpecificData".into());
        }
        fields
    }

    pub(crate) fn dispenser_ratio(&self) -> Option<f64> {
        self.dispenser.as_ref().and_then(|d| d.units_per_base)
    }

    pub(crate) fn dispenser_base_unit(&self) -> Option<&str> {
        self.dispenser.as_ref().and_then(|d| d.base_unit.as_deref())
    }

    pub(crate) fn air_prime_loss(&self) -> Option<f64> {
        self.dispenser.as_ref().and_then(|d| d.air_prime_loss)
    }
}

/// Per-call overrides of the converter policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionOptions {
    pub enforce_precision: Option<bool>,
    pub precision_tolerance: Option<f64>,
    /// Mark the result as not-to-be-applied.
    pub dry_run: bool,
}

// ═══════════════════════════════════════════════════════════
// Trace
// ═══════════════════════════════════════════════════════════

/// Kind of atomic transformation recorded in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Identity,
    /// Same-dimension standard conversion (mg → g).
    Dimensional,
    /// Device units to their standard base (clicks → mL).
    DeviceToBase,
    /// Standard base to device units (mL → clicks).
    BaseToDevice,
    /// Applies a strength ratio (tablet → mg, mg → mL).
    StrengthRatio,
    AirPrimeAdjustment,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Dimensional => "dimensional",
            Self::DeviceToBase => "device_to_base",
            Self::BaseToDevice => "base_to_device",
            Self::StrengthRatio => "strength_ratio",
            Self::AirPrimeAdjustment => "air_prime_adjustment",
        }
    }

    pub fn involves_device(&self) -> bool {
        matches!(
            self,
            Self::DeviceToBase | Self::BaseToDevice | Self::AirPrimeAdjustment
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionStep {
    pub operation: StepKind,
    pub input: Quantity,
    pub output: Quantity,
    pub factor: f64,
    pub at: DateTime<Utc>,
}

/// Ordered record of the steps one `convert()` call took, plus the context
/// flags the confidence score depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionTrace {
    pub id: Uuid,
    pub steps: Vec<ConversionStep>,
    pub used_defaults: bool,
    pub has_lot_specific_data: bool,
    pub defaulted_fields: Vec<String>,
}

impl ConversionTrace {
    pub fn for_context(context: &ConversionContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            steps: Vec::new(),
            used_defaults: context.used_defaults,
            has_lot_specific_data: context.has_lot_specific_data,
            defaulted_fields: context.defaulted_fields.clone(),
        }
    }

    /// Append a step. Timestamps never go backwards even if the wall clock does.
    pub fn push(&mut self, operation: StepKind, input: Quantity, output: Quantity, factor: f64) {
        let now = Utc::now();
        let at = match self.steps.last() {
            Some(last) if last.at > now => last.at,
            _ => now,
        };
        self.steps.push(ConversionStep {
            operation,
            input,
            output,
            factor,
            at,
        });
    }

    pub fn mark_defaulted(&mut self, field: &str) {
        if !self.defaulted_fields.iter().any(|f| f == field) {
            self.defaulted_fields.push(field.into());
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn final_output(&self) -> Option<&Quantity> {
        self.steps.last().map(|s| &s.output)
    }

    pub fn is_identity(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.operation == StepKind::Identity)
    }

    pub fn involves_device_unit(&self) -> bool {
        self.steps.iter().any(|s| s.operation.involves_device())
    }

    pub fn uses_strength_ratio(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.operation == StepKind::StrengthRatio)
    }
}

/// A completed conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionSuccess {
    pub value: f64,
    pub unit: String,
    pub trace: ConversionTrace,
    pub confidence: ConfidenceScore,
    /// Produced in dry-run mode; callers should not apply it.
    pub dry_run: bool,
}

impl ConversionSuccess {
    pub fn quantity(&self) -> Quantity {
        Quantity::new(self.value, self.unit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_trims_zeros() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(-0.00001), "0");
        assert_eq!(format_number(2500.0), "2500");
    }

    #[test]
    fn strength_per_unit() {
        let ratio = StrengthRatio::new(Quantity::new(500.0, "mg"), Quantity::new(2.0, "tablet"));
        assert_eq!(ratio.per_unit(), Some(250.0));

        let broken = StrengthRatio::new(Quantity::new(500.0, "mg"), Quantity::new(0.0, "tablet"));
        assert_eq!(broken.per_unit(), None);
    }

    #[test]
    fn strength_ratio_display() {
        let ratio = StrengthRatio::new(Quantity::new(500.0, "mg"), Quantity::new(1.0, "tablet"));
        assert_eq!(ratio.to_string(), "500 mg/1 tablet");
    }

    #[test]
    fn trace_timestamps_monotonic() {
        let mut trace = ConversionTrace::for_context(&ConversionContext::default());
        for i in 0..5 {
            trace.push(
                StepKind::Dimensional,
                Quantity::new(i as f64, "mg"),
                Quantity::new(i as f64, "g"),
                0.001,
            );
        }
        assert!(trace.steps.windows(2).all(|w| w[0].at <= w[1].at));
        assert_eq!(trace.final_output().unwrap().unit, "g");
    }

    #[test]
    fn mark_defaulted_dedups() {
        let mut trace = ConversionTrace::for_context(&ConversionContext::default());
        trace.mark_defaulted("dispenser.airPrimeLoss");
        trace.mark_defaulted("dispenser.airPrimeLoss");
        assert_eq!(trace.defaulted_fields.len(), 1);
    }

    #[test]
    fn context_flags_copied_into_trace() {
        let ctx = ConversionContext::default()
            .with_defaults_used(true)
            .with_defaulted_field("strengthRatio");
        let trace = ConversionTrace::for_context(&ctx);
        assert!(trace.used_defaults);
        assert!(!trace.has_lot_specific_data);
        assert_eq!(trace.defaulted_fields, vec!["strengthRatio"]);
    }

    #[test]
    fn available_fields_reports_dispenser_parts() {
        let ctx = ConversionContext::default().with_ratio(4.0);
        assert_eq!(ctx.available_fields(), vec!["dispenser.unitsPerBase"]);
    }

    #[test]
    fn device_display_pluralizes() {
        let click = DeviceUnit::fixed("click", "clicks", "mL", 4.0);
        assert_eq!(click.display_for(1.0), "click");
        assert_eq!(click.display_for(4.0), "clicks");
    }

    #[test]
    fn strength_based_unit_counts() {
        let tablet = DeviceUnit::strength_based("tablet", "tablets");
        assert_eq!(tablet.base_unit, "{count}");
        assert_eq!(tablet.units_per_base, Some(1.0));
        assert!(tablet.metadata.requires_strength_ratio);
    }
}
