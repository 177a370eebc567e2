use serde::{Deserialize, Serialize};

use super::types::{ConversionTrace, StepKind};

/// Score thresholds for confidence levels
pub mod confidence_thresholds {
    /// At or above: high confidence
    pub const HIGH: u8 = 80;

    /// At or above: medium confidence; below is low
    pub const MEDIUM: u8 = 50;
}

/// Score adjustments applied on top of the base score.
pub mod confidence_adjustments {
    pub const USED_DEFAULTS: i32 = -20;
    /// Device or strength conversions without lot-specific data
    pub const NO_LOT_DATA: i32 = -10;
    /// Per required context field that was silently defaulted
    pub const DEFAULTED_FIELD: i32 = -15;
    /// Pure standard-unit conversion
    pub const EXACT_DIMENSIONAL: i32 = 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    pub fn from_score(score: u8) -> Self {
        if score >= confidence_thresholds::HIGH {
            Self::High
        } else if score >= confidence_thresholds::MEDIUM {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub level: ConfidenceLevel,
    pub score: u8,
    /// One entry per adjustment, in the order applied.
    pub rationale: Vec<String>,
}

/// How far each step moves away from the source data.
fn step_cost(kind: StepKind) -> i32 {
    match kind {
        StepKind::Identity => 0,
        StepKind::Dimensional => 2,
        StepKind::DeviceToBase | StepKind::BaseToDevice => 8,
        StepKind::StrengthRatio => 10,
        StepKind::AirPrimeAdjustment => 5,
    }
}

/// Derives reliability scores from conversion traces. Pure: equal traces
/// always score equally.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceScoreService;

impl ConfidenceScoreService {
    pub fn new() -> Self {
        Self
    }

    pub fn calculate(&self, trace: &ConversionTrace) -> ConfidenceScore {
        // Nothing was converted, so nothing the context says can weaken it.
        if trace.is_identity() {
            return ConfidenceScore {
                level: ConfidenceLevel::High,
                score: 100,
                rationale: vec!["Identity conversion: value unchanged".into()],
            };
        }

        let mut rationale = Vec::new();

        let distance: i32 = trace.steps.iter().map(|s| step_cost(s.operation)).sum();
        let mut score = 100 - distance;
        rationale.push(format!(
            "Base score {score} from {} conversion step(s)",
            trace.len()
        ));

        let device_or_strength = trace.involves_device_unit() || trace.uses_strength_ratio();

        if !device_or_strength {
            score += confidence_adjustments::EXACT_DIMENSIONAL;
            rationale.push(format!(
                "+{}: exact dimensional match without device units",
                confidence_adjustments::EXACT_DIMENSIONAL
            ));
        }

        if trace.used_defaults {
            score += confidence_adjustments::USED_DEFAULTS;
            rationale.push(format!(
                "{}: default assumptions were used",
                confidence_adjustments::USED_DEFAULTS
            ));
        }

        if device_or_strength && !trace.has_lot_specific_data {
            score += confidence_adjustments::NO_LOT_DATA;
            rationale.push(format!(
                "{}: no lot-specific data for device or strength conversion",
                confidence_adjustments::NO_LOT_DATA
            ));
        }

        for field in &trace.defaulted_fields {
            score += confidence_adjustments::DEFAULTED_FIELD;
            rationale.push(format!(
                "{}: required context '{field}' was defaulted",
                confidence_adjustments::DEFAULTED_FIELD
            ));
        }

        let score = score.clamp(0, 100) as u8;
        ConfidenceScore {
            level: ConfidenceLevel::from_score(score),
            score,
            rationale,
        }
    }
}
