//! Sig frequency parsing into FHIR `Timing.repeat`.
//!
//! Covers the phrasings that make up most outpatient sigs. Anything else is
//! left as free text on `Timing.code`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TIMES_PER_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s*(?:x|times)\s*(?:a|per)?\s*(?:day|daily)$").unwrap()
});

static EVERY_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:every|q)\s*(\d+(?:\.\d+)?)\s*(hours?|hrs?|h|days?|d|weeks?|wks?|w)$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodUnit {
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
    #[serde(rename = "wk")]
    Week,
}

impl PeriodUnit {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "wk",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word.chars().next()? {
            'h' => Some(Self::Hour),
            'd' => Some(Self::Day),
            'w' => Some(Self::Week),
            _ => None,
        }
    }
}

/// `frequency` events per `period` `period_unit`, optionally tied to a time of day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRepeat {
    pub frequency: u32,
    pub period: f64,
    pub period_unit: PeriodUnit,
    /// FHIR event-timing codes (HS, MORN, EVE).
    pub when: Vec<String>,
}

impl TimingRepeat {
    fn new(frequency: u32, period: f64, period_unit: PeriodUnit) -> Self {
        Self {
            frequency,
            period,
            period_unit,
            when: Vec::new(),
        }
    }

    fn daily(times: u32) -> Self {
        Self::new(times, 1.0, PeriodUnit::Day)
    }

    fn at(mut self, when: &str) -> Self {
        self.when.push(when.into());
        self
    }

    /// Events per day, for max-dose checks.
    pub fn per_day(&self) -> f64 {
        let days = match self.period_unit {
            PeriodUnit::Hour => self.period / 24.0,
            PeriodUnit::Day => self.period,
            PeriodUnit::Week => self.period * 7.0,
        };
        if days <= 0.0 {
            return 0.0;
        }
        self.frequency as f64 / days
    }

    pub fn to_fhir(&self) -> serde_json::Value {
        let mut repeat = serde_json::json!({
            "frequency": self.frequency,
            "period": self.period,
            "periodUnit": self.period_unit.code(),
        });
        if !self.when.is_empty() {
            repeat["when"] = serde_json::json!(self.when);
        }
        repeat
    }
}

/// Parse a frequency phrase. `None` when the phrasing is not recognized.
pub fn parse_frequency(text: &str) -> Option<TimingRepeat> {
    let normalized = text
        .trim()
        .trim_end_matches('.')
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let fixed = match normalized.as_str() {
        "qd" | "daily" | "once daily" | "once a day" | "every day" | "once per day" => {
            Some(TimingRepeat::daily(1))
        }
        "bid" | "b.i.d." | "twice daily" | "twice a day" | "two times daily" | "two times a day" => {
            Some(TimingRepeat::daily(2))
        }
        "tid" | "t.i.d." | "three times daily" | "three times a day" => Some(TimingRepeat::daily(3)),
        "qid" | "q.i.d." | "four times daily" | "four times a day" => Some(TimingRepeat::daily(4)),
        "qhs" | "at bedtime" | "nightly" | "every night" | "at night" => {
            Some(TimingRepeat::daily(1).at("HS"))
        }
        "qam" | "every morning" | "in the morning" => Some(TimingRepeat::daily(1).at("MORN")),
        "qpm" | "every evening" | "in the evening" => Some(TimingRepeat::daily(1).at("EVE")),
        "qod" | "every other day" => Some(TimingRepeat::new(1, 2.0, PeriodUnit::Day)),
        "weekly" | "once weekly" | "once a week" | "every week" => {
            Some(TimingRepeat::new(1, 1.0, PeriodUnit::Week))
        }
        _ => None,
    };
    if fixed.is_some() {
        return fixed;
    }

    if let Some(caps) = TIMES_PER_DAY.captures(&normalized) {
        let times: u32 = caps[1].parse().ok()?;
        return (times > 0).then(|| TimingRepeat::daily(times));
    }

    if let Some(caps) = EVERY_N.captures(&normalized) {
        let period: f64 = caps[1].parse().ok()?;
        let unit = PeriodUnit::from_word(&caps[2])?;
        return (period > 0.0).then(|| TimingRepeat::new(1, period, unit));
    }

    None
}

/// FHIR `Timing` for a frequency phrase; unparsed phrases keep their text.
pub fn timing_to_fhir(text: &str) -> serde_json::Value {
    match parse_frequency(text) {
        Some(repeat) => serde_json::json!({
            "repeat": repeat.to_fhir(),
            "code": { "text": text.trim() },
        }),
        None => serde_json::json!({ "code": { "text": text.trim() } }),
    }
}
