//! Medication signature synthesis.
//!
//! Turns a structured request (medication, dose, route, frequency) into a
//! clinical instruction string and a FHIR `Dosage` element. Pieces:
//! - `strategy`: picks the template pattern (tablet, liquid, injection, PRN, device)
//! - `template` + `catalog`: localized patterns with plural/select/optional clauses
//! - `route`: route ↔ dose-form compatibility, behind the `RouteValidator` trait
//! - `frequency`: common sig frequencies → FHIR `Timing.repeat`
//! - `generator`: ties them to the unit converter for dose equivalents

pub mod types;
pub mod template;
pub mod catalog;
pub mod strategy;
pub mod route;
pub mod frequency;
pub mod generator;

pub use types::*;
pub use template::*;
pub use catalog::*;
pub use strategy::*;
pub use route::*;
pub use frequency::*;
pub use generator::*;

use serde::Serialize;
use thiserror::Error;

use crate::conversion::ConversionError;

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SignatureError {
    #[error("Ambiguous template strategy at priority {priority}: {}", .candidates.join(", "))]
    AmbiguousStrategy {
        candidates: Vec<String>,
        priority: i32,
    },

    #[error("No template strategy matches dose form '{dose_form}' via route '{route}'")]
    NoMatchingStrategy { dose_form: String, route: String },

    #[error("Template strategy '{id}' is already registered")]
    DuplicateStrategy { id: String },

    #[error("Template strategy '{id}' has the same matcher as '{existing}' at priority {priority}")]
    PriorityConflict {
        id: String,
        existing: String,
        priority: i32,
    },

    #[error("Route '{route}' is not compatible with dose form '{dose_form}': {}", .errors.join("; "))]
    IncompatibleRoute {
        route: String,
        dose_form: String,
        errors: Vec<String>,
        suggested_routes: Vec<String>,
    },

    #[error("Invalid dose: {reason}")]
    InvalidDose { reason: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl SignatureError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::AmbiguousStrategy { .. } => "ambiguous_strategy",
            Self::NoMatchingStrategy { .. } => "no_matching_strategy",
            Self::DuplicateStrategy { .. } => "duplicate_strategy",
            Self::PriorityConflict { .. } => "priority_conflict",
            Self::IncompatibleRoute { .. } => "incompatible_route",
            Self::InvalidDose { .. } => "invalid_dose",
            Self::Template(_) => "template",
            Self::Conversion(_) => "conversion",
        }
    }

    pub fn to_structured(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "error_type": self.error_type(),
                "message": self.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_form_is_adjacently_tagged() {
        let err = SignatureError::AmbiguousStrategy {
            candidates: vec!["a".into(), "b".into()],
            priority: 10,
        };
        let value = err.to_structured();
        assert_eq!(value["error_type"], "ambiguous_strategy");
        assert_eq!(value["details"]["priority"], 10);
        assert_eq!(err.to_string(), "Ambiguous template strategy at priority 10: a, b");
    }

    #[test]
    fn conversion_errors_nest_their_own_tag() {
        let err = SignatureError::from(ConversionError::InvalidUnit {
            unit: "zz".into(),
            validation_error: None,
            suggestions: vec![],
        });
        assert_eq!(err.error_type(), "conversion");
        let value = err.to_structured();
        assert_eq!(value["error_type"], "conversion");
        assert_eq!(value["details"]["error_type"], "invalid_unit");
    }
}
