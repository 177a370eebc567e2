//! Standard-to-standard legs, including mass↔volume through a strength ratio.
//!
//! Shared by the orchestrator (both sides standard) and the device adapter
//! (the standard leg of a device conversion).

use super::registry::{Unit, UnitRegistry};
use super::types::{ConversionContext, ConversionTrace, Dimension, Quantity, StepKind};
use super::ConversionError;

/// Convert between two standard units, recording steps on `trace`.
///
/// Equal units record nothing; callers that need a step for identity add it
/// themselves.
pub(crate) fn convert_standard(
    registry: &UnitRegistry,
    value: f64,
    from: &'static Unit,
    to: &'static Unit,
    context: &ConversionContext,
    trace: &mut ConversionTrace,
) -> Result<f64, ConversionError> {
    if from.symbol == to.symbol {
        return Ok(value);
    }
    if from.dimension == to.dimension {
        return Ok(dimensional_step(value, from, to, trace));
    }
    if is_concentration_pair(from.dimension, to.dimension) {
        return via_strength_ratio(registry, value, from, to, context, trace);
    }
    Err(ConversionError::impossible(
        from.symbol,
        to.symbol,
        format!(
            "{} measures {}, {} measures {}",
            from.symbol, from.dimension, to.symbol, to.dimension
        ),
    ))
}

pub(crate) fn dimensional_step(
    value: f64,
    from: &'static Unit,
    to: &'static Unit,
    trace: &mut ConversionTrace,
) -> f64 {
    let factor = from.to_base / to.to_base;
    let out = value * factor;
    trace.push(
        StepKind::Dimensional,
        Quantity::new(value, from.symbol),
        Quantity::new(out, to.symbol),
        factor,
    );
    out
}

fn is_concentration_pair(a: Dimension, b: Dimension) -> bool {
    matches!(
        (a, b),
        (Dimension::Mass, Dimension::Volume) | (Dimension::Volume, Dimension::Mass)
    )
}

/// from → (ratio side matching `from`) → other ratio side → to.
fn via_strength_ratio(
    registry: &UnitRegistry,
    value: f64,
    from: &'static Unit,
    to: &'static Unit,
    context: &ConversionContext,
    trace: &mut ConversionTrace,
) -> Result<f64, ConversionError> {
    let ratio = context.strength_ratio.as_ref().ok_or_else(|| {
        ConversionError::missing(&["strengthRatio"], from.symbol, to.symbol, context)
    })?;

    let numerator = registry.resolve(&ratio.numerator.unit);
    let denominator = registry.resolve(&ratio.denominator.unit);
    let (numerator, denominator) = match (numerator, denominator) {
        (Some(n), Some(d)) if is_concentration_pair(n.dimension, d.dimension) => (n, d),
        _ => {
            return Err(ConversionError::impossible(
                from.symbol,
                to.symbol,
                format!("strength ratio {ratio} does not relate mass to volume"),
            ))
        }
    };
    if ratio.per_unit().is_none() || ratio.numerator.value <= 0.0 {
        return Err(ConversionError::impossible(
            from.symbol,
            to.symbol,
            format!("strength ratio {ratio} must have positive amounts"),
        ));
    }

    // Orient the ratio so `source` shares the dimension of `from`.
    let (source, source_unit, target, target_unit) = if numerator.dimension == from.dimension {
        (&ratio.numerator, numerator, &ratio.denominator, denominator)
    } else {
        (&ratio.denominator, denominator, &ratio.numerator, numerator)
    };

    let at_source = if from.symbol == source_unit.symbol {
        value
    } else {
        dimensional_step(value, from, source_unit, trace)
    };

    let factor = target.value / source.value;
    let at_target = at_source * factor;
    trace.push(
        StepKind::StrengthRatio,
        Quantity::new(at_source, source_unit.symbol),
        Quantity::new(at_target, target_unit.symbol),
        factor,
    );

    if target_unit.symbol == to.symbol {
        Ok(at_target)
    } else {
        Ok(dimensional_step(at_target, target_unit, to, trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::types::StrengthRatio;

    fn ctx_with(num: (f64, &str), den: (f64, &str)) -> ConversionContext {
        ConversionContext::default().with_strength_ratio(StrengthRatio::new(
            Quantity::new(num.0, num.1),
            Quantity::new(den.0, den.1),
        ))
    }

    fn unit(registry: &UnitRegistry, s: &str) -> &'static Unit {
        registry.resolve(s).unwrap()
    }

    #[test]
    fn mass_to_volume_via_concentration() {
        let registry = UnitRegistry::new();
        let ctx = ctx_with((250.0, "mg"), (5.0, "mL"));
        let mut trace = ConversionTrace::for_context(&ctx);
        let out = convert_standard(
            &registry,
            500.0,
            unit(&registry, "mg"),
            unit(&registry, "mL"),
            &ctx,
            &mut trace,
        )
        .unwrap();
        assert!((out - 10.0).abs() < 1e-9);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.steps[0].operation, StepKind::StrengthRatio);
    }

    #[test]
    fn volume_to_mass_with_unit_legs() {
        let registry = UnitRegistry::new();
        let ctx = ctx_with((50.0, "mg"), (1.0, "mL"));
        let mut trace = ConversionTrace::for_context(&ctx);
        let out = convert_standard(
            &registry,
            0.01,
            unit(&registry, "L"),
            unit(&registry, "g"),
            &ctx,
            &mut trace,
        )
        .unwrap();
        // 10 mL * 50 mg/mL = 500 mg = 0.5 g
        assert!((out - 0.5).abs() < 1e-9);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.final_output().unwrap().unit, "g");
    }

    #[test]
    fn concentration_without_ratio_is_missing_context() {
        let registry = UnitRegistry::new();
        let ctx = ConversionContext::default();
        let mut trace = ConversionTrace::for_context(&ctx);
        let err = convert_standard(
            &registry,
            1.0,
            unit(&registry, "mg"),
            unit(&registry, "mL"),
            &ctx,
            &mut trace,
        )
        .unwrap_err();
        match err {
            ConversionError::MissingContext {
                required_fields, ..
            } => assert_eq!(required_fields, vec!["strengthRatio"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn per_tablet_ratio_cannot_bridge_mass_and_volume() {
        let registry = UnitRegistry::new();
        let ctx = ctx_with((500.0, "mg"), (1.0, "tablet"));
        let mut trace = ConversionTrace::for_context(&ctx);
        let err = convert_standard(
            &registry,
            1.0,
            unit(&registry, "mg"),
            unit(&registry, "mL"),
            &ctx,
            &mut trace,
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::ImpossibleConversion { .. }));
    }

    #[test]
    fn mass_to_time_is_impossible() {
        let registry = UnitRegistry::new();
        let ctx = ConversionContext::default();
        let mut trace = ConversionTrace::for_context(&ctx);
        let err = convert_standard(
            &registry,
            1.0,
            unit(&registry, "mg"),
            unit(&registry, "h"),
            &ctx,
            &mut trace,
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::ImpossibleConversion { .. }));
        assert!(trace.is_empty());
    }
}
