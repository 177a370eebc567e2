pub mod config;
pub mod conversion; // Tier 1 + Tier 2 unit conversion, confidence, tracing
pub mod signature; // Strategy-selected sig templates + FHIR Dosage

pub use config::{ConfigError, EngineConfig};
pub use conversion::{
    ConfidenceLevel, ConfidenceScore, ConversionContext, ConversionError, ConversionResult,
    ConversionSuccess, DeviceUnit, Quantity, StrengthRatio, UnitConverter,
};
pub use signature::{
    Medication, MedicationRequestContext, SignatureError, SignatureGenerator, SignatureResult,
};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honoring `RUST_LOG`, falling back to
/// `config::default_log_filter()`. Returns `false` when a global subscriber
/// is already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init_tracing();
        assert!(!init_tracing());
    }

    #[test]
    fn end_to_end_from_json_config() {
        let config = EngineConfig::from_json_str(
            r#"{"converter": {"precision_tolerance": 0.05}, "templates": {"default_locale": "en"}}"#,
        )
        .unwrap();
        let generator = SignatureGenerator::new(&config).unwrap();
        let medication = Medication::new("Tablet").with_ingredient(
            "lisinopril",
            Some(StrengthRatio::new(
                Quantity::new(10.0, "mg"),
                Quantity::new(1.0, "tablet"),
            )),
        );
        let result = generator
            .generate_signature(&medication, Quantity::new(1.0, "tab"), "PO", "QD")
            .unwrap();
        assert_eq!(result.human_readable, "Take 1 tablet by mouth QD.");
        assert_eq!(result.fhir_representation["timing"]["repeat"]["frequency"], 1);

        let converted = generator
            .converter()
            .convert(20.0, "mg", "tablet", &ConversionContext::default().with_strength_ratio(
                medication.primary_strength().unwrap().clone(),
            ))
            .unwrap();
        assert_eq!(converted.value, 2.0);
        assert_eq!(converted.confidence.level, ConfidenceLevel::High);
    }
}
