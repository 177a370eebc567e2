//! Tier 2: the device unit adapter.
//!
//! Device units (clicks, drops, tablets, puffs) are registered with a ratio to
//! a standard base unit. Conversions go device → base → (Tier 1) → target, and
//! the reverse. Ratios that depend on the product at hand come from the call's
//! `ConversionContext`: the strength ratio for countable dose forms, the
//! dispenser metadata for dispensers without a fixed ratio.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use super::concentration::convert_standard;
use super::registry::{rank_suggestions, syntax_error, Unit, UnitRegistry, UnitValidation};
use super::types::{
    ConversionContext, ConversionTrace, DeviceUnit, Dimension, Quantity, StepKind, StrengthRatio,
};
use super::ConversionError;

/// Standard drop factor: 20 drops per mL.
pub const DROPS_PER_ML: f64 = 20.0;

/// Topiclick dispensers deliver 0.25 mL per click.
pub const TOPICLICK_CLICKS_PER_ML: f64 = 4.0;

/// Result of a Tier 2 conversion before confidence scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConversion {
    pub value: f64,
    pub unit: String,
    pub trace: ConversionTrace,
}

/// Registry and converter for device units.
#[derive(Debug, Clone)]
pub struct DeviceUnitAdapter {
    registry: Arc<UnitRegistry>,
    units: HashMap<String, DeviceUnit>,
    /// Lowercased symbol, plural and aliases → symbol.
    spellings: HashMap<String, String>,
}

impl DeviceUnitAdapter {
    /// Empty adapter.
    pub fn new(registry: Arc<UnitRegistry>) -> Self {
        Self {
            registry,
            units: HashMap::new(),
            spellings: HashMap::new(),
        }
    }

    /// Adapter preloaded with the common dispensing units.
    pub fn with_defaults(registry: Arc<UnitRegistry>) -> Self {
        let mut adapter = Self::new(registry);
        for unit in default_device_units() {
            // Built-in rows are well-formed; a failure here is a table bug.
            if let Err(e) = adapter.register_device_unit(unit) {
                tracing::error!(error = %e, "Built-in device unit rejected");
            }
        }
        adapter
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Add or replace a device unit. Last write wins; the replaced entry is
    /// returned so callers that want duplicate protection can act on it.
    /// A replaced unit's spellings are dropped, and a spelling another unit
    /// already used moves to the new unit.
    ///
    /// Rejects non-positive or non-finite ratios and granularities, and base
    /// units Tier 1 does not know.
    pub fn register_device_unit(
        &mut self,
        unit: DeviceUnit,
    ) -> Result<Option<DeviceUnit>, ConversionError> {
        if let Some(reason) = syntax_error(&unit.symbol) {
            return Err(ConversionError::InvalidUnit {
                unit: unit.symbol,
                validation_error: Some(reason),
                suggestions: Vec::new(),
            });
        }
        if self.registry.resolve(&unit.symbol).is_some() {
            return Err(ConversionError::invalid_value(
                &unit.symbol,
                "symbol is already a standard unit",
            ));
        }
        if let Some(ratio) = unit.units_per_base {
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err(ConversionError::invalid_value(
                    &unit.symbol,
                    format!("conversion ratio must be a positive number, got {ratio}"),
                ));
            }
        }
        if let Some(granularity) = unit.granularity {
            if !granularity.is_finite() || granularity <= 0.0 {
                return Err(ConversionError::invalid_value(
                    &unit.symbol,
                    format!("granularity must be a positive number, got {granularity}"),
                ));
            }
        }
        self.registry.require(&unit.base_unit)?;

        let symbol = unit.symbol.clone();
        if self.units.contains_key(&symbol) {
            self.spellings.retain(|_, owner| *owner != symbol);
        }
        for spelling in std::iter::once(&unit.symbol)
            .chain(std::iter::once(&unit.plural))
            .chain(unit.metadata.aliases.iter())
        {
            let key = spelling.to_lowercase();
            if let Some(owner) = self.spellings.insert(key.clone(), symbol.clone()) {
                if owner != symbol {
                    tracing::warn!(
                        spelling = %key,
                        previous = %owner,
                        symbol = %symbol,
                        "Device unit spelling reassigned"
                    );
                }
            }
        }

        let previous = self.units.insert(symbol.clone(), unit);
        if previous.is_some() {
            tracing::warn!(symbol = %symbol, "Device unit re-registered, previous definition replaced");
        } else {
            tracing::debug!(symbol = %symbol, "Device unit registered");
        }
        Ok(previous)
    }

    pub fn resolve(&self, raw: &str) -> Option<&DeviceUnit> {
        let trimmed = raw.trim();
        self.units.get(trimmed).or_else(|| {
            self.spellings
                .get(&trimmed.to_lowercase())
                .and_then(|symbol| self.units.get(symbol))
        })
    }

    pub fn is_device_unit(&self, raw: &str) -> bool {
        self.resolve(raw).is_some()
    }

    pub fn device_units(&self) -> impl Iterator<Item = &DeviceUnit> {
        self.units.values()
    }

    pub fn validate(&self, raw: &str) -> UnitValidation {
        if let Some(err) = syntax_error(raw) {
            return UnitValidation::invalid(err, Vec::new());
        }
        match self.resolve(raw) {
            Some(unit) => UnitValidation::ok(&unit.symbol),
            None => UnitValidation::invalid(
                format!("unknown device unit '{}'", raw.trim()),
                self.suggest(raw),
            ),
        }
    }

    pub fn suggest(&self, raw: &str) -> Vec<String> {
        rank_suggestions(
            raw,
            self.spellings
                .iter()
                .map(|(spelling, symbol)| (spelling.as_str(), symbol.as_str())),
        )
    }

    /// Standalone Tier 2 conversion. At least one side must be a device unit.
    pub fn convert(
        &self,
        value: f64,
        from: &str,
        to: &str,
        context: &ConversionContext,
    ) -> Result<DeviceConversion, ConversionError> {
        let mut trace = ConversionTrace::for_context(context);
        let (value, unit) = self.convert_into(value, from, to, context, &mut trace)?;
        Ok(DeviceConversion { value, unit, trace })
    }

    /// Conversion with steps appended to a caller-owned trace. Returns the
    /// value and the canonical target symbol.
    pub(crate) fn convert_into(
        &self,
        value: f64,
        from: &str,
        to: &str,
        context: &ConversionContext,
        trace: &mut ConversionTrace,
    ) -> Result<(f64, String), ConversionError> {
        match (self.resolve(from), self.resolve(to)) {
            (Some(source), Some(target)) => {
                let out = self.device_to_device(value, source, target, context, trace)?;
                Ok((out, target.symbol.clone()))
            }
            (Some(source), None) => {
                let target = self.registry.require(to)?;
                let out = self.device_to_standard(value, source, target, context, trace)?;
                Ok((out, target.symbol.to_string()))
            }
            (None, Some(target)) => {
                let source = self.registry.require(from)?;
                let out = self.standard_to_device(value, source, target, context, trace)?;
                Ok((out, target.symbol.clone()))
            }
            (None, None) => Err(ConversionError::impossible(
                from,
                to,
                "neither unit is a registered device unit",
            )),
        }
    }

    // ── Legs ─────────────────────────────────────────────

    fn device_to_device(
        &self,
        value: f64,
        source: &DeviceUnit,
        target: &DeviceUnit,
        context: &ConversionContext,
        trace: &mut ConversionTrace,
    ) -> Result<f64, ConversionError> {
        if source.symbol == target.symbol {
            trace.push(
                StepKind::Identity,
                Quantity::new(value, &source.symbol),
                Quantity::new(value, &target.symbol),
                1.0,
            );
            return Ok(value);
        }
        if source.metadata.requires_strength_ratio && target.metadata.requires_strength_ratio {
            return Err(ConversionError::impossible(
                &source.symbol,
                &target.symbol,
                "different dose forms are not interchangeable by count",
            ));
        }

        let dispensing = dispensing_unit(source, target, context);
        let source_context = scoped_context(context, source, dispensing);
        let target_context = scoped_context(context, target, dispensing);

        let bridge = self.entry_unit(target, &target_context)?;
        let at_bridge = self.device_to_standard(value, source, bridge, &source_context, trace)?;
        self.standard_to_device(at_bridge, bridge, target, &target_context, trace)
    }

    fn device_to_standard(
        &self,
        value: f64,
        source: &DeviceUnit,
        target: &'static Unit,
        context: &ConversionContext,
        trace: &mut ConversionTrace,
    ) -> Result<f64, ConversionError> {
        if source.metadata.requires_strength_ratio && target.dimension != Dimension::Count {
            let (ratio, numerator) =
                self.matching_strength(source, &source.symbol, target.symbol, context)?;
            let factor = ratio.numerator.value / ratio.denominator.value;
            let out = value * factor;
            trace.push(
                StepKind::StrengthRatio,
                Quantity::new(value, &source.symbol),
                Quantity::new(out, numerator.symbol),
                factor,
            );
            return convert_standard(&self.registry, out, numerator, target, context, trace);
        }

        let (per_base, base) = self.ratio_for(source, &source.symbol, target.symbol, context)?;
        let mut dispensed = value;
        if source.metadata.requires_air_prime {
            let loss = self.air_prime_loss(context, trace);
            if loss > 0.0 {
                let adjusted = (value - loss).max(0.0);
                trace.push(
                    StepKind::AirPrimeAdjustment,
                    Quantity::new(value, &source.symbol),
                    Quantity::new(adjusted, &source.symbol),
                    if value == 0.0 { 1.0 } else { adjusted / value },
                );
                dispensed = adjusted;
            }
        }

        let factor = 1.0 / per_base;
        let at_base = dispensed * factor;
        trace.push(
            StepKind::DeviceToBase,
            Quantity::new(dispensed, &source.symbol),
            Quantity::new(at_base, base.symbol),
            factor,
        );
        convert_standard(&self.registry, at_base, base, target, context, trace)
    }

    fn standard_to_device(
        &self,
        value: f64,
        source: &'static Unit,
        target: &DeviceUnit,
        context: &ConversionContext,
        trace: &mut ConversionTrace,
    ) -> Result<f64, ConversionError> {
        if target.metadata.requires_strength_ratio && source.dimension != Dimension::Count {
            let (ratio, numerator) =
                self.matching_strength(target, source.symbol, &target.symbol, context)?;
            let at_numerator =
                convert_standard(&self.registry, value, source, numerator, context, trace)?;
            let factor = ratio.denominator.value / ratio.numerator.value;
            let out = at_numerator * factor;
            trace.push(
                StepKind::StrengthRatio,
                Quantity::new(at_numerator, numerator.symbol),
                Quantity::new(out, &target.symbol),
                factor,
            );
            return Ok(out);
        }

        let (per_base, base) = self.ratio_for(target, source.symbol, &target.symbol, context)?;
        let at_base = convert_standard(&self.registry, value, source, base, context, trace)?;
        let out = at_base * per_base;
        trace.push(
            StepKind::BaseToDevice,
            Quantity::new(at_base, base.symbol),
            Quantity::new(out, &target.symbol),
            per_base,
        );

        if target.metadata.requires_air_prime {
            let loss = self.air_prime_loss(context, trace);
            if loss > 0.0 {
                let adjusted = out + loss;
                trace.push(
                    StepKind::AirPrimeAdjustment,
                    Quantity::new(out, &target.symbol),
                    Quantity::new(adjusted, &target.symbol),
                    if out == 0.0 { 1.0 } else { adjusted / out },
                );
                return Ok(adjusted);
            }
        }
        Ok(out)
    }

    // ── Context resolution ───────────────────────────────

    /// Standard unit a conversion into `unit` enters from.
    fn entry_unit(
        &self,
        unit: &DeviceUnit,
        context: &ConversionContext,
    ) -> Result<&'static Unit, ConversionError> {
        if unit.metadata.requires_strength_ratio {
            if let Some(ratio) = context
                .strength_ratio
                .as_ref()
                .filter(|r| self.denominator_matches(r, unit))
            {
                if let Some(numerator) = self.registry.resolve(&ratio.numerator.unit) {
                    return Ok(numerator);
                }
            }
        }
        let base = context.dispenser_base_unit().unwrap_or(&unit.base_unit);
        self.registry.require(base)
    }

    /// Ratio (device units per base) and base unit, context first.
    fn ratio_for(
        &self,
        unit: &DeviceUnit,
        from: &str,
        to: &str,
        context: &ConversionContext,
    ) -> Result<(f64, &'static Unit), ConversionError> {
        let per_base = match context.dispenser_ratio().or(unit.units_per_base) {
            Some(ratio) if ratio.is_finite() && ratio > 0.0 => ratio,
            Some(ratio) => {
                return Err(ConversionError::invalid_value(
                    &unit.symbol,
                    format!("dispenser ratio must be a positive number, got {ratio}"),
                ))
            }
            None => {
                return Err(ConversionError::missing(
                    &["dispenser.unitsPerBase"],
                    from,
                    to,
                    context,
                ))
            }
        };
        let base = context.dispenser_base_unit().unwrap_or(&unit.base_unit);
        Ok((per_base, self.registry.require(base)?))
    }

    /// Strength ratio expressed per `unit`, with its numerator resolved.
    fn matching_strength<'c>(
        &self,
        unit: &DeviceUnit,
        from: &str,
        to: &str,
        context: &'c ConversionContext,
    ) -> Result<(&'c StrengthRatio, &'static Unit), ConversionError> {
        let ratio = context
            .strength_ratio
            .as_ref()
            .ok_or_else(|| ConversionError::missing(&["strengthRatio"], from, to, context))?;

        if !self.denominator_matches(ratio, unit) {
            return Err(ConversionError::impossible(
                from,
                to,
                format!("strength ratio {ratio} is not expressed per {}", unit.symbol),
            ));
        }
        if ratio.per_unit().is_none() || ratio.numerator.value <= 0.0 {
            return Err(ConversionError::impossible(
                from,
                to,
                format!("strength ratio {ratio} must have positive amounts"),
            ));
        }
        let numerator = self.registry.require(&ratio.numerator.unit)?;
        Ok((ratio, numerator))
    }

    /// Denominator names this unit, or is a plain count.
    fn denominator_matches(&self, ratio: &StrengthRatio, unit: &DeviceUnit) -> bool {
        if let Some(device) = self.resolve(&ratio.denominator.unit) {
            return device.symbol == unit.symbol;
        }
        self.registry
            .resolve(&ratio.denominator.unit)
            .is_some_and(|u| u.dimension == Dimension::Count)
    }

    /// Priming loss for this call; absent means zero and is recorded as defaulted.
    fn air_prime_loss(&self, context: &ConversionContext, trace: &mut ConversionTrace) -> f64 {
        match context.air_prime_loss() {
            Some(loss) if loss.is_finite() && loss >= 0.0 => loss,
            _ => {
                trace.mark_defaulted("dispenser.airPrimeLoss");
                0.0
            }
        }
    }
}

/// The unit a call's dispenser metadata describes.
fn dispensing_unit<'u>(
    source: &'u DeviceUnit,
    target: &'u DeviceUnit,
    context: &ConversionContext,
) -> &'u DeviceUnit {
    let named = context
        .dispenser
        .as_ref()
        .and_then(|d| d.device_name.as_deref());
    match named {
        Some(name) if target.answers_to(name) && !source.answers_to(name) => target,
        _ => source,
    }
}

/// Context for one leg: dispenser overrides only reach the dispensing unit.
fn scoped_context<'c>(
    context: &'c ConversionContext,
    unit: &DeviceUnit,
    dispensing: &DeviceUnit,
) -> Cow<'c, ConversionContext> {
    if context.dispenser.is_none() || unit.symbol == dispensing.symbol {
        return Cow::Borrowed(context);
    }
    Cow::Owned(ConversionContext {
        dispenser: None,
        ..context.clone()
    })
}

/// Units every adapter built `with_defaults` knows.
pub fn default_device_units() -> Vec<DeviceUnit> {
    vec![
        DeviceUnit::fixed("click", "clicks", "mL", TOPICLICK_CLICKS_PER_ML)
            .with_granularity(1.0)
            .with_device_name("Topiclick"),
        DeviceUnit::fixed("drop", "drops", "mL", DROPS_PER_ML)
            .with_granularity(1.0)
            .with_aliases(&["gtt", "gtts"]),
        DeviceUnit::strength_based("tablet", "tablets")
            .with_granularity(0.5)
            .with_aliases(&["tab", "tabs"]),
        DeviceUnit::strength_based("capsule", "capsules")
            .with_granularity(1.0)
            .with_aliases(&["cap", "caps"]),
        DeviceUnit::strength_based("puff", "puffs")
            .with_granularity(1.0)
            .with_aliases(&["actuation", "actuations", "spray", "sprays"]),
    ]
}
