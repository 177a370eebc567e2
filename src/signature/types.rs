use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conversion::{format_number, Quantity, StrengthRatio};

// ═══════════════════════════════════════════════════════════
// Medication
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub strength_ratio: Option<StrengthRatio>,
}

/// Product description supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub dose_form: String,
    #[serde(default)]
    pub ingredient: Vec<Ingredient>,
}

impl Medication {
    pub fn new(dose_form: &str) -> Self {
        Self {
            dose_form: dose_form.into(),
            ingredient: Vec::new(),
        }
    }

    pub fn with_ingredient(mut self, name: &str, strength_ratio: Option<StrengthRatio>) -> Self {
        self.ingredient.push(Ingredient {
            name: name.into(),
            strength_ratio,
        });
        self
    }

    /// Strength of the first ingredient that declares one.
    pub fn primary_strength(&self) -> Option<&StrengthRatio> {
        self.ingredient
            .iter()
            .find_map(|i| i.strength_ratio.as_ref())
    }
}

// ═══════════════════════════════════════════════════════════
// Request
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationRequestContext {
    pub medication: Medication,
    pub dose: Quantity,
    pub route: String,
    pub frequency: String,
    #[serde(default)]
    pub as_needed: bool,
    #[serde(default)]
    pub indication: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub special_instructions: Option<String>,
    /// Upper bound per day.
    #[serde(default)]
    pub max_dose_per_day: Option<Quantity>,
}

impl MedicationRequestContext {
    pub fn new(medication: Medication, dose: Quantity, route: &str, frequency: &str) -> Self {
        Self {
            medication,
            dose,
            route: route.into(),
            frequency: frequency.into(),
            as_needed: false,
            indication: None,
            site: None,
            special_instructions: None,
            max_dose_per_day: None,
        }
    }

    pub fn as_needed_for(mut self, indication: Option<&str>) -> Self {
        self.as_needed = true;
        self.indication = indication.map(String::from);
        self
    }

    pub fn with_site(mut self, site: &str) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn with_special_instructions(mut self, instructions: &str) -> Self {
        self.special_instructions = Some(instructions.into());
        self
    }

    pub fn with_max_dose_per_day(mut self, max: Quantity) -> Self {
        self.max_dose_per_day = Some(max);
        self
    }
}

// ═══════════════════════════════════════════════════════════
// Template data
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Number(f64),
    Text(String),
}

impl TemplateValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Empty text counts as undefined for optional clauses.
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(s) if s.trim().is_empty())
    }
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Named slots for one template render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateData {
    slots: BTreeMap<String, TemplateValue>,
}

impl TemplateData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.slots
            .insert(name.into(), TemplateValue::Text(value.into()));
        self
    }

    pub fn set_number(&mut self, name: &str, value: f64) -> &mut Self {
        self.slots.insert(name.into(), TemplateValue::Number(value));
        self
    }

    /// Sets the slot only when a value is present.
    pub fn set_opt(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.set_text(name, v);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.slots.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════
// Result
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureResult {
    pub human_readable: String,
    /// FHIR R4 `Dosage` element.
    pub fhir_representation: serde_json::Value,
    pub template_variables: Option<TemplateData>,
    pub template_key: String,
    pub strategy_id: String,
    /// The dose in the product's reference unit (1 tablet → 500 mg).
    pub dose_equivalent: Option<Quantity>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_strength_skips_ingredients_without_one() {
        let med = Medication::new("Tablet")
            .with_ingredient("excipient", None)
            .with_ingredient(
                "metformin",
                Some(StrengthRatio::new(
                    Quantity::new(500.0, "mg"),
                    Quantity::new(1.0, "tablet"),
                )),
            );
        assert_eq!(med.primary_strength().unwrap().numerator.value, 500.0);
    }

    #[test]
    fn medication_deserializes_from_external_shape() {
        let json = r#"{
            "dose_form": "Tablet",
            "ingredient": [{
                "name": "amoxicillin",
                "strength_ratio": {
                    "numerator": {"value": 250, "unit": "mg"},
                    "denominator": {"value": 1, "unit": "tablet"}
                }
            }]
        }"#;
        let med: Medication = serde_json::from_str(json).unwrap();
        assert_eq!(med.dose_form, "Tablet");
        assert_eq!(med.primary_strength().unwrap().numerator.unit, "mg");
    }

    #[test]
    fn template_values_display_and_parse() {
        assert_eq!(TemplateValue::Number(1.0).to_string(), "1");
        assert_eq!(TemplateValue::Number(0.25).to_string(), "0.25");
        assert_eq!(TemplateValue::Text("2".into()).as_number(), Some(2.0));
        assert!(TemplateValue::Text("  ".into()).is_blank());
    }

    #[test]
    fn template_data_serializes_flat() {
        let mut data = TemplateData::new();
        data.set_number("doseValue", 2.0).set_text("route", "by mouth");
        data.set_opt("site", None);
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["doseValue"], 2.0);
        assert_eq!(value["route"], "by mouth");
        assert!(value.get("site").is_none());
        assert_eq!(data.len(), 2);
    }
}
