//! Unit converter: orchestrates Tier 1 and Tier 2.
//!
//! Every call goes through the same sequence:
//! 1. Input guards (finite value, non-negative tolerance)
//! 2. Unit resolution across both tiers (unknown → `InvalidUnit` + suggestions)
//! 3. Identity short-circuit (returned as given, no precision check)
//! 4. Tier 1 only when both sides are standard, Tier 2 otherwise
//! 5. Rounding to the configured significant digits
//! 6. Precision check against the target's deliverable granularity
//! 7. Confidence scoring of the trace
//!
//! Each call is recorded on the converter's tracer as a `convert` start/end
//! pair with one step event per conversion step. Unit spellings travel in the
//! event data so the timing table keys stay fixed.

use std::sync::Arc;

use super::concentration::convert_standard;
use super::confidence::ConfidenceScoreService;
use super::device::DeviceUnitAdapter;
use super::registry::{syntax_error, UnitRegistry, UnitValidation};
use super::tracer::{ConversionTracer, TraceEvent};
use super::types::{
    ConversionContext, ConversionOptions, ConversionStep, ConversionSuccess, ConversionTrace,
    DeviceUnit, Quantity, StepKind,
};
use super::ConversionError;
use crate::config::{ConverterConfig, EngineConfig};

pub type ConversionResult = Result<ConversionSuccess, ConversionError>;

/// Tracer operation name for every conversion call.
pub const CONVERT_OPERATION: &str = "convert";

/// Which tier a resolved unit belongs to, with its canonical symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side<'a> {
    Standard(&'static str),
    Device(&'a str),
}

impl Side<'_> {
    fn symbol(&self) -> &str {
        match *self {
            Side::Standard(s) => s,
            Side::Device(s) => s,
        }
    }
}

#[derive(Debug)]
pub struct UnitConverter {
    registry: Arc<UnitRegistry>,
    devices: DeviceUnitAdapter,
    confidence: ConfidenceScoreService,
    tracer: ConversionTracer,
    config: ConverterConfig,
}

impl Default for UnitConverter {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl UnitConverter {
    /// Converter with the standard table and the default device units.
    pub fn new(config: &EngineConfig) -> Self {
        let registry = Arc::new(UnitRegistry::new());
        Self {
            devices: DeviceUnitAdapter::with_defaults(Arc::clone(&registry)),
            registry,
            confidence: ConfidenceScoreService::new(),
            tracer: ConversionTracer::new(config.tracer.clone()),
            config: config.converter.clone(),
        }
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    pub fn devices(&self) -> &DeviceUnitAdapter {
        &self.devices
    }

    pub fn tracer(&self) -> &ConversionTracer {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut ConversionTracer {
        &mut self.tracer
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn register_device_unit(
        &mut self,
        unit: DeviceUnit,
    ) -> Result<Option<DeviceUnit>, ConversionError> {
        self.devices.register_device_unit(unit)
    }

    pub fn is_device_unit(&self, raw: &str) -> bool {
        self.registry.resolve(raw).is_none() && self.devices.is_device_unit(raw)
    }

    pub fn device_unit(&self, raw: &str) -> Option<&DeviceUnit> {
        if self.registry.resolve(raw).is_some() {
            return None;
        }
        self.devices.resolve(raw)
    }

    /// Soft validation across both tiers.
    pub fn validate_unit(&self, raw: &str) -> UnitValidation {
        if let Some(err) = syntax_error(raw) {
            return UnitValidation::invalid(err, Vec::new());
        }
        match self.resolve_side(raw) {
            Some(side) => UnitValidation::ok(side.symbol()),
            None => UnitValidation::invalid(
                format!("unknown unit '{}'", raw.trim()),
                self.suggest(raw),
            ),
        }
    }

    /// Standard units sharing a dimension with `raw`, or, for a device unit,
    /// with its base unit (the device unit itself listed first).
    pub fn compatible_units(&self, raw: &str) -> Vec<String> {
        if let Some(device) = self.device_unit(raw) {
            let mut units = vec![device.symbol.clone()];
            units.extend(
                self.registry
                    .compatible_units(&device.base_unit)
                    .into_iter()
                    .map(String::from),
            );
            return units;
        }
        self.registry
            .compatible_units(raw)
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn convert(
        &self,
        value: f64,
        from: &str,
        to: &str,
        context: &ConversionContext,
    ) -> ConversionResult {
        self.convert_with_options(value, from, to, context, &ConversionOptions::default())
    }

    pub fn convert_with_options(
        &self,
        value: f64,
        from: &str,
        to: &str,
        context: &ConversionContext,
        options: &ConversionOptions,
    ) -> ConversionResult {
        self.tracer.trace(TraceEvent::start(CONVERT_OPERATION).with_data(serde_json::json!({
            "value": value,
            "from": from.trim(),
            "to": to.trim(),
        })));

        let result = self.run(value, from, to, context, options);

        match &result {
            Ok(success) => {
                for step in &success.trace.steps {
                    self.tracer
                        .trace(TraceEvent::step(step.operation.as_str(), step_data(step)));
                }
                tracing::debug!(
                    from = %from,
                    to = %to,
                    value = value,
                    result = success.value,
                    steps = success.trace.len(),
                    confidence = success.confidence.score,
                    "Conversion complete"
                );
            }
            Err(e) => {
                self.tracer
                    .trace(TraceEvent::error(CONVERT_OPERATION, e.to_structured()));
                tracing::debug!(
                    from = %from,
                    to = %to,
                    error_type = e.error_type().as_str(),
                    "Conversion failed"
                );
            }
        }

        self.tracer.trace(TraceEvent::end(CONVERT_OPERATION));
        result
    }

    fn run(
        &self,
        value: f64,
        from: &str,
        to: &str,
        context: &ConversionContext,
        options: &ConversionOptions,
    ) -> ConversionResult {
        // ── Guards ──────────────────────────────────────────
        if !value.is_finite() {
            return Err(ConversionError::invalid_value(
                from,
                format!("value must be a finite number, got {value}"),
            ));
        }
        let tolerance = options
            .precision_tolerance
            .unwrap_or(self.config.precision_tolerance);
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ConversionError::invalid_value(
                from,
                format!("precision tolerance must be a non-negative number, got {tolerance}"),
            ));
        }

        // ── Resolution ──────────────────────────────────────
        let source = self
            .resolve_side(from)
            .ok_or_else(|| self.unknown_unit(from))?;
        let target = self.resolve_side(to).ok_or_else(|| self.unknown_unit(to))?;

        let mut trace = ConversionTrace::for_context(context);

        // ── Conversion ──────────────────────────────────────
        let (raw, unit) = if source.symbol() == target.symbol() {
            trace.push(
                StepKind::Identity,
                Quantity::new(value, source.symbol()),
                Quantity::new(value, target.symbol()),
                1.0,
            );
            (value, target.symbol().to_string())
        } else {
            match (source, target) {
                (Side::Standard(f), Side::Standard(t)) => {
                    let from_unit = self.registry.require(f)?;
                    let to_unit = self.registry.require(t)?;
                    let out =
                        convert_standard(&self.registry, value, from_unit, to_unit, context, &mut trace)?;
                    (out, t.to_string())
                }
                _ => self.devices.convert_into(
                    value,
                    source.symbol(),
                    target.symbol(),
                    context,
                    &mut trace,
                )?,
            }
        };

        let converted = round_significant(raw, self.config.significant_digits);
        if let Some(last) = trace.steps.last_mut() {
            last.output.value = converted;
        }

        // ── Precision ───────────────────────────────────────
        let loss = if trace.is_identity() {
            0.0
        } else {
            self.relative_loss(value, converted, target)
        };
        if loss > tolerance {
            let enforce = options
                .enforce_precision
                .unwrap_or(self.config.enforce_precision);
            if enforce {
                return Err(ConversionError::PrecisionError {
                    value,
                    from: source.symbol().to_string(),
                    to: unit,
                    expected_precision: tolerance,
                    actual_precision: loss,
                });
            }
            tracing::warn!(
                from = %source.symbol(),
                to = %unit,
                value = value,
                loss = loss,
                tolerance = tolerance,
                "Conversion exceeds precision tolerance, enforcement disabled"
            );
        }

        let confidence = self.confidence.calculate(&trace);
        Ok(ConversionSuccess {
            value: converted,
            unit,
            trace,
            confidence,
            dry_run: options.dry_run || self.tracer.is_dry_run(),
        })
    }

    // ── Helpers ──────────────────────────────────────────

    /// Standard spellings win over device aliases.
    fn resolve_side<'a>(&'a self, raw: &str) -> Option<Side<'a>> {
        if let Some(unit) = self.registry.resolve(raw) {
            return Some(Side::Standard(unit.symbol));
        }
        self.devices
            .resolve(raw)
            .map(|unit| Side::Device(unit.symbol.as_str()))
    }

    fn suggest(&self, raw: &str) -> Vec<String> {
        let mut suggestions = self.registry.suggest(raw);
        for device in self.devices.suggest(raw) {
            if !suggestions.contains(&device) {
                suggestions.push(device);
            }
        }
        suggestions
    }

    fn unknown_unit(&self, raw: &str) -> ConversionError {
        let validation = self.validate_unit(raw);
        ConversionError::InvalidUnit {
            unit: raw.trim().to_string(),
            validation_error: validation.error,
            suggestions: validation.suggestions,
        }
    }

    /// Relative distance between the converted value and what the target can
    /// actually represent: the nearest deliverable amount for granular device
    /// units, total loss for underflow to zero or overflow.
    fn relative_loss(&self, input: f64, converted: f64, target: Side<'_>) -> f64 {
        if !converted.is_finite() {
            return f64::INFINITY;
        }
        if converted == 0.0 {
            return if input == 0.0 { 0.0 } else { 1.0 };
        }
        let granularity = match target {
            Side::Device(symbol) => self.devices.resolve(symbol).and_then(|d| d.granularity),
            Side::Standard(_) => None,
        };
        match granularity {
            Some(step) => {
                let deliverable = (converted / step).round() * step;
                (converted - deliverable).abs() / converted.abs()
            }
            None => 0.0,
        }
    }
}

fn step_data(step: &ConversionStep) -> serde_json::Value {
    serde_json::json!({
        "input": { "value": step.input.value, "unit": step.input.unit },
        "output": { "value": step.output.value, "unit": step.output.unit },
        "factor": step.factor,
    })
}

/// Round to `digits` significant digits; zero, non-finite values and
/// magnitudes the scale cannot represent pass through unchanged.
fn round_significant(value: f64, digits: u32) -> f64 {
    if value == 0.0 || !value.is_finite() || digits == 0 {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let scale = 10f64.powi(digits as i32 - 1 - magnitude);
    if !scale.is_finite() || scale == 0.0 {
        return value;
    }
    let rounded = (value * scale).round() / scale;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{ConfidenceLevel, ConversionErrorType, StrengthRatio};
    use proptest::prelude::*;

    fn converter() -> UnitConverter {
        UnitConverter::default()
    }

    fn per_tablet(mg: f64) -> ConversionContext {
        ConversionContext::default().with_strength_ratio(StrengthRatio::new(
            Quantity::new(mg, "mg"),
            Quantity::new(1.0, "tablet"),
        ))
    }

    fn assert_final_unit(success: &ConversionSuccess) {
        let last = success.trace.final_output().unwrap();
        assert_eq!(last.unit, success.unit);
        assert_eq!(last.value, success.value);
    }

    #[test]
    fn identity_is_single_step_high_confidence() {
        let result = converter()
            .convert(5.0, "mL", "ml", &ConversionContext::default().with_defaults_used(true))
            .unwrap();
        assert_eq!(result.value, 5.0);
        assert_eq!(result.unit, "mL");
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.trace.steps[0].operation, StepKind::Identity);
        assert_eq!(result.confidence.level, ConfidenceLevel::High);
        assert_final_unit(&result);
    }

    #[test]
    fn fractional_device_identity_skips_granularity() {
        let converter = converter();
        let clicks = converter
            .convert(0.3, "click", "click", &ConversionContext::default())
            .unwrap();
        assert_eq!(clicks.value, 0.3);
        assert_eq!(clicks.trace.len(), 1);
        assert_eq!(clicks.confidence.level, ConfidenceLevel::High);

        let tablets = converter
            .convert(1.25, "tablet", "tablets", &ConversionContext::default())
            .unwrap();
        assert_eq!(tablets.value, 1.25);
        assert_eq!(tablets.unit, "tablet");
        assert_eq!(tablets.trace.steps[0].operation, StepKind::Identity);
    }

    #[test]
    fn device_identity_through_alias() {
        let result = converter()
            .convert(3.0, "gtts", "drop", &ConversionContext::default())
            .unwrap();
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.unit, "drop");
    }

    #[test]
    fn clicks_with_context_ratio() {
        let ctx = ConversionContext::default().with_ratio(4.0);
        let result = converter().convert(4.0, "click", "mL", &ctx).unwrap();
        assert_eq!(result.value, 1.0);
        assert_final_unit(&result);
    }

    #[test]
    fn topiclick_default_ratio_high_confidence() {
        let result = converter()
            .convert(8.0, "click", "mL", &ConversionContext::default())
            .unwrap();
        assert_eq!(result.value, 2.0);
        assert_eq!(result.confidence.level, ConfidenceLevel::High);
    }

    #[test]
    fn standard_dimensional_conversion() {
        let result = converter()
            .convert(1500.0, "mg", "g", &ConversionContext::default())
            .unwrap();
        assert!((result.value - 1.5).abs() < 1e-12);
        assert_eq!(result.confidence.score, 100);
        assert_final_unit(&result);
    }

    #[test]
    fn tablet_without_strength_is_missing_context() {
        let err = converter()
            .convert(1.0, "tablet", "mg", &ConversionContext::default())
            .unwrap_err();
        match err {
            ConversionError::MissingContext {
                required_fields,
                conversion,
                ..
            } => {
                assert_eq!(required_fields, vec!["strengthRatio"]);
                assert_eq!(conversion, "tablet -> mg");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn mass_to_volume_without_context_fails() {
        let err = converter()
            .convert(1.0, "mg", "mL", &ConversionContext::default())
            .unwrap_err();
        assert_eq!(err.error_type(), ConversionErrorType::MissingContext);
    }

    #[test]
    fn tablet_to_mg_with_strength() {
        let result = converter().convert(1.0, "tablet", "mg", &per_tablet(500.0)).unwrap();
        assert_eq!(result.value, 500.0);
        assert_eq!(result.unit, "mg");
        assert!(result.trace.uses_strength_ratio());
    }

    #[test]
    fn tiny_dose_to_tablets_loses_precision() {
        let err = converter()
            .convert(0.001, "mg", "tablet", &per_tablet(500.0))
            .unwrap_err();
        match err {
            ConversionError::PrecisionError {
                expected_precision,
                actual_precision,
                to,
                ..
            } => {
                assert_eq!(expected_precision, 0.01);
                assert_eq!(actual_precision, 1.0);
                assert_eq!(to, "tablet");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn half_tablets_are_deliverable() {
        let result = converter().convert(750.0, "mg", "tablet", &per_tablet(500.0)).unwrap();
        assert_eq!(result.value, 1.5);
    }

    #[test]
    fn precision_policy_is_configurable() {
        let converter = converter();
        let ctx = per_tablet(500.0);

        // 600 mg = 1.2 tablets; nearest deliverable 1.0
        assert!(converter.convert(600.0, "mg", "tablet", &ctx).is_err());

        let lenient = ConversionOptions {
            precision_tolerance: Some(0.2),
            ..Default::default()
        };
        let result = converter
            .convert_with_options(600.0, "mg", "tablet", &ctx, &lenient)
            .unwrap();
        assert!((result.value - 1.2).abs() < 1e-12);

        let disabled = ConversionOptions {
            enforce_precision: Some(false),
            ..Default::default()
        };
        assert!(converter
            .convert_with_options(600.0, "mg", "tablet", &ctx, &disabled)
            .is_ok());
    }

    #[test]
    fn non_finite_value_rejected() {
        for value in [f64::NAN, f64::INFINITY] {
            let err = converter()
                .convert(value, "mg", "g", &ConversionContext::default())
                .unwrap_err();
            assert_eq!(err.error_type(), ConversionErrorType::InvalidUnit);
        }
    }

    #[test]
    fn negative_tolerance_rejected() {
        let options = ConversionOptions {
            precision_tolerance: Some(-0.1),
            ..Default::default()
        };
        let err = converter()
            .convert_with_options(1.0, "mg", "g", &ConversionContext::default(), &options)
            .unwrap_err();
        assert_eq!(err.error_type(), ConversionErrorType::InvalidUnit);
    }

    #[test]
    fn unknown_unit_suggests_from_both_tiers() {
        let converter = converter();
        let err = converter
            .convert(1.0, "mgg", "g", &ConversionContext::default())
            .unwrap_err();
        match err {
            ConversionError::InvalidUnit { suggestions, .. } => {
                assert!(suggestions.contains(&"mg".to_string()))
            }
            other => panic!("unexpected: {other:?}"),
        }

        let err = converter
            .convert(1.0, "clikc", "mL", &ConversionContext::default())
            .unwrap_err();
        match err {
            ConversionError::InvalidUnit { suggestions, .. } => {
                assert!(suggestions.contains(&"click".to_string()))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn incompatible_dimensions_are_impossible() {
        let err = converter()
            .convert(1.0, "mg", "h", &ConversionContext::default())
            .unwrap_err();
        assert_eq!(err.error_type(), ConversionErrorType::ImpossibleConversion);
    }

    #[test]
    fn registered_unit_is_usable() {
        let mut converter = converter();
        converter
            .register_device_unit(DeviceUnit::fixed("scoop", "scoops", "g", 0.25))
            .unwrap();
        assert!(converter.is_device_unit("scoops"));
        let result = converter
            .convert(1.0, "scoop", "g", &ConversionContext::default())
            .unwrap();
        assert_eq!(result.value, 4.0);
    }

    #[test]
    fn validation_and_compatibility() {
        let converter = converter();
        assert_eq!(
            converter.validate_unit("ML").normalized_form.as_deref(),
            Some("mL")
        );
        assert!(converter.validate_unit("tabs").valid);
        assert!(!converter.validate_unit("").valid);

        let compatible = converter.compatible_units("click");
        assert_eq!(compatible[0], "click");
        assert!(compatible.contains(&"L".to_string()));
        assert!(!converter.is_device_unit("mg"));
    }

    #[test]
    fn tracer_records_start_steps_end() {
        let converter = converter();
        converter
            .convert(8.0, "click", "mL", &ConversionContext::default())
            .unwrap();
        let entries = converter.tracer().entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].description, "convert");
        assert_eq!(entries[0].data.as_ref().unwrap()["from"], "click");
        assert_eq!(entries[1].description, "device_to_base");
        assert!(entries[2].duration_ms.is_some());
    }

    #[test]
    fn tracer_records_errors() {
        let converter = converter();
        let _ = converter.convert(1.0, "tablet", "mg", &ConversionContext::default());
        let entries = converter.tracer().entries();
        let error = entries
            .iter()
            .find(|e| e.kind == crate::conversion::TraceEventKind::Error)
            .unwrap();
        assert_eq!(error.data.as_ref().unwrap()["error_type"], "missing_context");
    }

    #[test]
    fn junk_units_do_not_grow_timing_table() {
        let converter = UnitConverter::new(&EngineConfig {
            tracer: crate::config::TracerConfig {
                max_trace_entries: 2,
                ..Default::default()
            },
            ..Default::default()
        });
        for i in 0..500 {
            let _ = converter.convert(1.0, &format!("junk{i}"), "mL", &ConversionContext::default());
        }
        assert_eq!(converter.tracer().len(), 2);
        let summary = converter.tracer().performance_summary();
        assert_eq!(summary.operations.len(), 1);
        assert_eq!(summary.operations[0].name, CONVERT_OPERATION);
        assert_eq!(summary.operations[0].count, 500);
    }

    #[test]
    fn dry_run_flag_propagates() {
        let options = ConversionOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = converter()
            .convert_with_options(1.0, "g", "mg", &ConversionContext::default(), &options)
            .unwrap();
        assert!(result.dry_run);
    }

    #[test]
    fn significant_digit_rounding() {
        assert_eq!(round_significant(0.1 + 0.2, 12), 0.3);
        assert_eq!(round_significant(0.0, 12), 0.0);
        assert_eq!(round_significant(123456.0, 3), 123000.0);
        assert!(round_significant(f64::NAN, 12).is_nan());
    }

    fn standard_pair() -> impl Strategy<Value = (&'static str, &'static str)> {
        prop_oneof![
            Just(("mg", "g")),
            Just(("ug", "mg")),
            Just(("kg", "mg")),
            Just(("mL", "L")),
            Just(("[tsp_us]", "mL")),
            Just(("h", "min")),
            Just(("wk", "d")),
        ]
    }

    proptest! {
        #[test]
        fn standard_round_trip(value in 0.001f64..1.0e6, (a, b) in standard_pair()) {
            let converter = converter();
            let ctx = ConversionContext::default();
            let there = converter.convert(value, a, b, &ctx).unwrap();
            let back = converter.convert(there.value, b, a, &ctx).unwrap();
            prop_assert!((back.value - value).abs() <= value * 1e-9);
        }

        #[test]
        fn click_round_trip(clicks in 1u32..10_000) {
            let converter = converter();
            let ctx = ConversionContext::default();
            let ml = converter.convert(clicks as f64, "click", "mL", &ctx).unwrap();
            let back = converter.convert(ml.value, "mL", "click", &ctx).unwrap();
            prop_assert!((back.value - clicks as f64).abs() < 1e-6);
        }
    }
}
