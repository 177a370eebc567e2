//! Signature generator: request in, prose + FHIR `Dosage` out.
//!
//! Steps, in order:
//! 1. Dose sanity and route/dose-form compatibility
//! 2. Dose unit resolution through the converter (device or standard)
//! 3. Dose equivalent in the product's reference unit (best effort, warns on failure)
//! 4. Strategy selection and template rendering
//! 5. FHIR `Dosage` assembly and max-daily-dose check

use serde_json::json;

use super::frequency::{parse_frequency, timing_to_fhir};
use super::route::{RouteValidator, StaticRouteTable};
use super::strategy::{StrategyRegistry, StrategyRequest};
use super::template::{TemplateEngine, TEMPLATE_ERROR_TAG};
use super::catalog::TemplateCatalog;
use super::types::{Medication, MedicationRequestContext, SignatureResult, TemplateData};
use super::SignatureError;
use crate::config::EngineConfig;
use crate::conversion::{
    format_number, ConversionContext, ConversionError, ConversionOptions, DeviceUnit, Quantity,
    UnitConverter,
};

const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";

pub struct SignatureGenerator {
    converter: UnitConverter,
    engine: TemplateEngine,
    strategies: StrategyRegistry,
    routes: Box<dyn RouteValidator>,
}

impl SignatureGenerator {
    /// Built-in catalogs, default strategies and the static route table.
    pub fn new(config: &EngineConfig) -> Result<Self, SignatureError> {
        Ok(Self {
            converter: UnitConverter::new(config),
            engine: TemplateEngine::new(TemplateCatalog::builtin(), &config.templates)?,
            strategies: StrategyRegistry::with_defaults(),
            routes: Box::new(StaticRouteTable::new()),
        })
    }

    pub fn with_parts(
        converter: UnitConverter,
        engine: TemplateEngine,
        strategies: StrategyRegistry,
        routes: Box<dyn RouteValidator>,
    ) -> Self {
        Self {
            converter,
            engine,
            strategies,
            routes,
        }
    }

    pub fn with_route_validator(mut self, routes: impl RouteValidator + 'static) -> Self {
        self.routes = Box::new(routes);
        self
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    pub fn converter_mut(&mut self) -> &mut UnitConverter {
        &mut self.converter
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TemplateEngine {
        &mut self.engine
    }

    pub fn strategies_mut(&mut self) -> &mut StrategyRegistry {
        &mut self.strategies
    }

    /// Shorthand for a scheduled (non-PRN) request with no extras.
    pub fn generate_signature(
        &self,
        medication: &Medication,
        dose: Quantity,
        route: &str,
        frequency: &str,
    ) -> Result<SignatureResult, SignatureError> {
        self.generate(&MedicationRequestContext::new(
            medication.clone(),
            dose,
            route,
            frequency,
        ))
    }

    pub fn generate(
        &self,
        request: &MedicationRequestContext,
    ) -> Result<SignatureResult, SignatureError> {
        let dose = &request.dose;
        if !dose.value.is_finite() || dose.value <= 0.0 {
            return Err(SignatureError::InvalidDose {
                reason: format!("dose must be a positive number, got {}", dose.value),
            });
        }

        // ── Route ───────────────────────────────────────────
        let dose_form = request.medication.dose_form.as_str();
        let validation = self.routes.validate(&request.route, dose_form);
        if !validation.is_valid {
            return Err(SignatureError::IncompatibleRoute {
                route: request.route.clone(),
                dose_form: dose_form.to_string(),
                errors: validation.errors,
                suggested_routes: validation.suggested_routes,
            });
        }
        let mut warnings = validation.warnings;

        let route_code = self
            .routes
            .canonical_route(&request.route)
            .unwrap_or_else(|| request.route.trim().to_lowercase());
        let route_phrase = self
            .routes
            .route_phrase(&route_code)
            .unwrap_or_else(|| request.route.trim().to_string());

        // ── Dose unit ───────────────────────────────────────
        let unit_check = self.converter.validate_unit(&dose.unit);
        let Some(unit) = unit_check.normalized_form else {
            return Err(ConversionError::InvalidUnit {
                unit: dose.unit.clone(),
                validation_error: unit_check.error,
                suggestions: unit_check.suggestions,
            }
            .into());
        };
        let device = self.converter.device_unit(&unit).cloned();
        let device_dosing = device
            .as_ref()
            .is_some_and(|d| !d.metadata.requires_strength_ratio);

        let context = strength_context(&request.medication);
        let dose_equivalent =
            self.dose_equivalent(dose.value, &unit, device.as_ref(), request, &context, &mut warnings);

        // ── Strategy + prose ────────────────────────────────
        let strategy = self.strategies.select(&StrategyRequest {
            dose_form,
            route: &route_code,
            as_needed: request.as_needed,
            device_dosing,
        })?;

        let mut data = TemplateData::new();
        data.set_text("verb", strategy.verb_for(&route_code))
            .set_number("doseValue", dose.value)
            .set_text("route", route_phrase.as_str())
            .set_text("frequency", request.frequency.trim());
        match &device {
            Some(d) => {
                data.set_text("doseUnit", d.display_for(dose.value))
                    .set_text("unitSingular", d.symbol.as_str())
                    .set_text("unitPlural", d.plural.as_str());
            }
            None => {
                data.set_text("doseUnit", unit.as_str())
                    .set_text("unitSingular", unit.as_str())
                    .set_text("unitPlural", unit.as_str());
            }
        }
        data.set_opt("specialInstructions", request.special_instructions.as_deref())
            .set_opt("indication", request.indication.as_deref())
            .set_opt("site", request.site.as_deref());
        if let Some(eq) = &dose_equivalent {
            data.set_text("doseEquivalent", eq.to_string());
        }
        if let Some(max) = &request.max_dose_per_day {
            data.set_text("maxDose", self.display_quantity(max));
        }
        let names: Vec<&str> = request
            .medication
            .ingredient
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        if !names.is_empty() {
            data.set_text("medication", names.join(" / "));
        }

        let human_readable = self.engine.render(&strategy.template_key, &data);
        if human_readable.starts_with(TEMPLATE_ERROR_TAG) {
            warnings.push(format!(
                "Template '{}' could not be rendered",
                strategy.template_key
            ));
        }

        self.check_max_daily_dose(request, &unit, &context, &mut warnings);

        let fhir_representation =
            self.fhir_dosage(request, &human_readable, &route_phrase, &unit, device.is_some());

        tracing::info!(
            strategy = %strategy.id,
            template = %strategy.template_key,
            locale = %self.engine.locale(),
            warnings = warnings.len(),
            "Signature generated"
        );

        Ok(SignatureResult {
            human_readable,
            fhir_representation,
            template_variables: Some(data),
            template_key: strategy.template_key.clone(),
            strategy_id: strategy.id.clone(),
            dose_equivalent,
            warnings,
        })
    }

    // ── Dose equivalent ──────────────────────────────────

    /// Reference unit for the dose: strength numerator for dose forms and
    /// concentrations, base unit for dispensers.
    fn equivalent_target(
        &self,
        unit: &str,
        device: Option<&DeviceUnit>,
        medication: &Medication,
    ) -> Option<String> {
        let strength = medication.primary_strength();
        match device {
            Some(d) if d.metadata.requires_strength_ratio => {
                strength.map(|s| s.numerator.unit.clone())
            }
            Some(d) => Some(d.base_unit.clone()),
            None => {
                let ratio = strength?;
                let registry = self.converter.registry();
                let dose_unit = registry.resolve(unit)?;
                let denominator = registry.resolve(&ratio.denominator.unit)?;
                // mL of a mg/mL product; mg of it is already the reference unit
                (denominator.dimension == dose_unit.dimension
                    && registry.normalize(&ratio.numerator.unit) != Some(dose_unit.symbol))
                .then(|| ratio.numerator.unit.clone())
            }
        }
    }

    fn dose_equivalent(
        &self,
        value: f64,
        unit: &str,
        device: Option<&DeviceUnit>,
        request: &MedicationRequestContext,
        context: &ConversionContext,
        warnings: &mut Vec<String>,
    ) -> Option<Quantity> {
        let needs_strength = device.is_some_and(|d| d.metadata.requires_strength_ratio);
        let Some(target) = self.equivalent_target(unit, device, &request.medication) else {
            if needs_strength {
                warnings.push(format!(
                    "No strength declared for '{}'; dose equivalent unavailable",
                    request.medication.dose_form
                ));
            }
            return None;
        };

        match self.converter.convert(value, unit, &target, context) {
            Ok(success) => Some(success.quantity()),
            Err(e) => {
                tracing::debug!(error_type = e.error_type().as_str(), "Dose equivalent failed");
                warnings.push(format!("Dose equivalent unavailable: {e}"));
                None
            }
        }
    }

    fn check_max_daily_dose(
        &self,
        request: &MedicationRequestContext,
        unit: &str,
        context: &ConversionContext,
        warnings: &mut Vec<String>,
    ) {
        let (Some(max), Some(repeat)) = (
            request.max_dose_per_day.as_ref(),
            parse_frequency(&request.frequency),
        ) else {
            return;
        };
        let daily = request.dose.value * repeat.per_day();
        let options = ConversionOptions {
            enforce_precision: Some(false),
            ..ConversionOptions::default()
        };
        match self
            .converter
            .convert_with_options(daily, unit, &max.unit, context, &options)
        {
            Ok(total) if total.value > max.value => warnings.push(format!(
                "Scheduled daily total {} exceeds the maximum of {} per day",
                self.display_quantity(&total.quantity()),
                self.display_quantity(max)
            )),
            Ok(_) => {}
            Err(e) => warnings.push(format!("Cannot check maximum daily dose: {e}")),
        }
    }

    // ── FHIR ─────────────────────────────────────────────

    fn fhir_dosage(
        &self,
        request: &MedicationRequestContext,
        text: &str,
        route_phrase: &str,
        unit: &str,
        device_unit: bool,
    ) -> serde_json::Value {
        let mut dosage = json!({
            "text": text,
            "timing": timing_to_fhir(&request.frequency),
            "route": { "text": route_phrase },
            "doseAndRate": [{
                "type": { "text": "ordered" },
                "doseQuantity": ucum_quantity(request.dose.value, unit, device_unit),
            }],
        });

        if request.as_needed {
            match &request.indication {
                Some(reason) => dosage["asNeededCodeableConcept"] = json!({ "text": reason }),
                None => dosage["asNeededBoolean"] = json!(true),
            }
        }
        if let Some(site) = &request.site {
            dosage["site"] = json!({ "text": site });
        }
        if let Some(max) = &request.max_dose_per_day {
            let max_unit = self
                .converter
                .validate_unit(&max.unit)
                .normalized_form
                .unwrap_or_else(|| max.unit.clone());
            let max_is_device = self.converter.is_device_unit(&max_unit);
            dosage["maxDosePerPeriod"] = json!({
                "numerator": ucum_quantity(max.value, &max_unit, max_is_device),
                "denominator": ucum_quantity(1.0, "d", false),
            });
        }
        if let Some(instructions) = &request.special_instructions {
            dosage["additionalInstruction"] = json!([{ "text": instructions }]);
        }
        dosage
    }

    /// "8 tablets", "1 mL".
    fn display_quantity(&self, quantity: &Quantity) -> String {
        match self.converter.device_unit(&quantity.unit) {
            Some(d) => format!("{} {}", format_number(quantity.value), d.display_for(quantity.value)),
            None => quantity.to_string(),
        }
    }
}

fn strength_context(medication: &Medication) -> ConversionContext {
    match medication.primary_strength() {
        Some(ratio) => ConversionContext::default().with_strength_ratio(ratio.clone()),
        None => ConversionContext::default(),
    }
}

/// Device units are not UCUM; they go out as UCUM annotations (`{click}`).
fn ucum_quantity(value: f64, unit: &str, device_unit: bool) -> serde_json::Value {
    let code = if device_unit {
        format!("{{{unit}}}")
    } else {
        unit.to_string()
    };
    json!({
        "value": value,
        "unit": unit,
        "system": UCUM_SYSTEM,
        "code": code,
    })
}
