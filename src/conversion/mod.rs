//! Dose unit conversion.
//!
//! Two tiers compose here: the dimensional registry (standard UCUM-like
//! units) and the device unit adapter (clicks, drops, tablets, puffs). The
//! `UnitConverter` orchestrates both, scores every result, and records each
//! call on its `ConversionTracer`.

pub mod types;
pub mod registry;
pub mod concentration;
pub mod device;
pub mod confidence;
pub mod tracer;
pub mod converter;

pub use types::*;
pub use registry::*;
pub use device::*;
pub use confidence::*;
pub use tracer::*;
pub use converter::*;

use serde::Serialize;
use thiserror::Error;

/// Every expected conversion failure. Callers branch on the variant (or on
/// `error_type()`) and can log the `to_structured()` form as-is.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ConversionError {
    #[error("Cannot convert {from} to {to}: {reason}")]
    ImpossibleConversion {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Conversion {conversion} requires context: {}", .required_fields.join(", "))]
    MissingContext {
        required_fields: Vec<String>,
        conversion: String,
        available_context: Vec<String>,
    },

    #[error("Invalid unit '{unit}'{}", .validation_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    InvalidUnit {
        unit: String,
        validation_error: Option<String>,
        suggestions: Vec<String>,
    },

    #[error(
        "Converting {value} {from} to {to} loses precision: {actual_precision:.4} exceeds tolerance {expected_precision:.4}"
    )]
    PrecisionError {
        value: f64,
        from: String,
        to: String,
        /// Maximum relative loss the policy allows.
        expected_precision: f64,
        /// Relative loss the conversion would incur.
        actual_precision: f64,
    },
}

/// Discriminant of `ConversionError`, for callers that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionErrorType {
    ImpossibleConversion,
    MissingContext,
    InvalidUnit,
    PrecisionError,
}

impl ConversionErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImpossibleConversion => "impossible_conversion",
            Self::MissingContext => "missing_context",
            Self::InvalidUnit => "invalid_unit",
            Self::PrecisionError => "precision_error",
        }
    }
}

impl ConversionError {
    pub fn error_type(&self) -> ConversionErrorType {
        match self {
            Self::ImpossibleConversion { .. } => ConversionErrorType::ImpossibleConversion,
            Self::MissingContext { .. } => ConversionErrorType::MissingContext,
            Self::InvalidUnit { .. } => ConversionErrorType::InvalidUnit,
            Self::PrecisionError { .. } => ConversionErrorType::PrecisionError,
        }
    }

    /// Structured form for logs and API payloads.
    pub fn to_structured(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "error_type": self.error_type().as_str(),
                "message": self.to_string(),
            })
        })
    }

    pub(crate) fn impossible(from: &str, to: &str, reason: impl Into<String>) -> Self {
        Self::ImpossibleConversion {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn missing(fields: &[&str], from: &str, to: &str, context: &ConversionContext) -> Self {
        Self::MissingContext {
            required_fields: fields.iter().map(|f| (*f).to_string()).collect(),
            conversion: format!("{from} -> {to}"),
            available_context: context.available_fields(),
        }
    }

    /// Non-finite or otherwise unusable numeric input, reported against the unit it came with.
    pub(crate) fn invalid_value(unit: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUnit {
            unit: unit.into(),
            validation_error: Some(reason.into()),
            suggestions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_form_carries_tag_and_fields() {
        let err = ConversionError::MissingContext {
            required_fields: vec!["strengthRatio".into()],
            conversion: "tablet -> mg".into(),
            available_context: vec![],
        };
        let value = err.to_structured();
        assert_eq!(value["error_type"], "missing_context");
        assert_eq!(value["required_fields"][0], "strengthRatio");
        assert_eq!(value["conversion"], "tablet -> mg");
    }

    #[test]
    fn error_type_matches_variant() {
        let err = ConversionError::impossible("mg", "h", "mass is not time");
        assert_eq!(err.error_type(), ConversionErrorType::ImpossibleConversion);
        assert_eq!(err.error_type().as_str(), "impossible_conversion");
    }

    #[test]
    fn invalid_unit_message_includes_reason() {
        let err = ConversionError::invalid_value("mg", "value must be finite");
        assert_eq!(err.to_string(), "Invalid unit 'mg': value must be finite");

        let bare = ConversionError::InvalidUnit {
            unit: "zz".into(),
            validation_error: None,
            suggestions: vec![],
        };
        assert_eq!(bare.to_string(), "Invalid unit 'zz'");
    }

    #[test]
    fn missing_context_lists_available_fields() {
        let ctx = ConversionContext::default().with_lot_specific_data(true);
        let err = ConversionError::missing(&["strengthRatio"], "tablet", "mg", &ctx);
        match err {
            ConversionError::MissingContext {
                required_fields,
                available_context,
                ..
            } => {
                assert_eq!(required_fields, vec!["strengthRatio"]);
                assert_eq!(available_context, vec!["hasLotSpecificData"]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
