//! Route ↔ dose-form compatibility.
//!
//! Signature generation consults a `RouteValidator`; hosts with their own
//! route metadata implement the trait, everyone else gets `StaticRouteTable`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggested_routes: Vec<String>,
}

pub trait RouteValidator: Send + Sync {
    fn validate(&self, route: &str, dose_form: &str) -> RouteValidation;

    /// Canonical code for a route spelling ("PO" → "oral").
    fn canonical_route(&self, _route: &str) -> Option<String> {
        None
    }

    /// Prose for a canonical route ("oral" → "by mouth").
    fn route_phrase(&self, _code: &str) -> Option<String> {
        None
    }
}

/// (code, prose, accepted spellings)
const ROUTES: &[(&str, &str, &[&str])] = &[
    ("oral", "by mouth", &["oral", "po", "p.o.", "by mouth", "orally", "mouth"]),
    ("sublingual", "under the tongue", &["sublingual", "sl", "under the tongue"]),
    ("buccal", "in the cheek", &["buccal", "in the cheek"]),
    ("topical", "topically", &["topical", "topically", "top", "cutaneous", "on the skin", "external"]),
    ("transdermal", "transdermally", &["transdermal", "transdermally", "td"]),
    ("ophthalmic", "in the eye", &["ophthalmic", "ophth", "eye", "in the eye", "in eye"]),
    ("otic", "in the ear", &["otic", "ear", "in the ear", "auricular"]),
    ("nasal", "in the nose", &["nasal", "intranasal", "in the nose", "nostril"]),
    ("inhalation", "by inhalation", &["inhalation", "inhaled", "by inhalation", "inh", "respiratory"]),
    ("subcutaneous", "subcutaneously", &["subcutaneous", "subcutaneously", "subcut", "sc", "sq", "subq"]),
    ("intramuscular", "intramuscularly", &["intramuscular", "intramuscularly", "im"]),
    ("intravenous", "intravenously", &["intravenous", "intravenously", "iv"]),
    ("intradermal", "intradermally", &["intradermal", "intradermally", "id"]),
    ("rectal", "rectally", &["rectal", "rectally", "pr"]),
    ("vaginal", "vaginally", &["vaginal", "vaginally", "pv"]),
];

/// (dose-form keywords, allowed route codes). First matching family wins.
const FAMILIES: &[(&[&str], &[&str])] = &[
    (
        &["inject", "prefilled pen", "pen injector", "vial", "syringe"],
        &["subcutaneous", "intramuscular", "intravenous", "intradermal"],
    ),
    (&["drop"], &["ophthalmic", "otic", "nasal", "oral"]),
    (&["inhal", "aerosol", "nebul"], &["inhalation", "nasal"]),
    (&["spray"], &["nasal", "sublingual", "topical", "oral"]),
    (&["patch"], &["transdermal", "topical"]),
    (&["suppositor"], &["rectal", "vaginal"]),
    (
        &["cream", "ointment", "gel", "lotion", "foam"],
        &["topical", "vaginal", "rectal"],
    ),
    (
        &["tablet", "capsule", "caplet", "lozenge"],
        &["oral", "sublingual", "buccal"],
    ),
    (
        &["solution", "suspension", "syrup", "elixir", "liquid"],
        &[
            "oral",
            "ophthalmic",
            "otic",
            "nasal",
            "topical",
            "subcutaneous",
            "intramuscular",
            "intravenous",
        ],
    ),
];

#[derive(Debug, Clone)]
pub struct StaticRouteTable {
    /// Lowercased spelling → code.
    synonyms: HashMap<&'static str, &'static str>,
    phrases: HashMap<&'static str, &'static str>,
}

impl Default for StaticRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRouteTable {
    pub fn new() -> Self {
        let mut synonyms = HashMap::new();
        let mut phrases = HashMap::new();
        for (code, phrase, spellings) in ROUTES {
            phrases.insert(*code, *phrase);
            for spelling in *spellings {
                synonyms.insert(*spelling, *code);
            }
        }
        Self { synonyms, phrases }
    }

    pub fn normalize(&self, route: &str) -> Option<&'static str> {
        let key = route.trim().to_lowercase();
        self.synonyms.get(key.as_str()).copied()
    }

    /// Allowed routes for a dose form, `None` when no family matches.
    pub fn allowed_routes(&self, dose_form: &str) -> Option<&'static [&'static str]> {
        let form = dose_form.to_lowercase();
        FAMILIES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| form.contains(k)))
            .map(|(_, routes)| *routes)
    }
}

impl RouteValidator for StaticRouteTable {
    fn validate(&self, route: &str, dose_form: &str) -> RouteValidation {
        let allowed = self.allowed_routes(dose_form);
        let suggested: Vec<String> = allowed
            .map(|routes| routes.iter().map(|r| (*r).to_string()).collect())
            .unwrap_or_default();

        let Some(code) = self.normalize(route) else {
            return RouteValidation {
                is_valid: false,
                errors: vec![format!("Unknown route '{}'", route.trim())],
                warnings: Vec::new(),
                suggested_routes: suggested,
            };
        };

        match allowed {
            Some(routes) if routes.contains(&code) => RouteValidation {
                is_valid: true,
                ..RouteValidation::default()
            },
            Some(_) => RouteValidation {
                is_valid: false,
                errors: vec![format!(
                    "Route '{code}' is not used for dose form '{}'",
                    dose_form.trim()
                )],
                warnings: Vec::new(),
                suggested_routes: suggested,
            },
            None => RouteValidation {
                is_valid: true,
                errors: Vec::new(),
                warnings: vec![format!(
                    "No route constraints known for dose form '{}'",
                    dose_form.trim()
                )],
                suggested_routes: Vec::new(),
            },
        }
    }

    fn canonical_route(&self, route: &str) -> Option<String> {
        self.normalize(route).map(String::from)
    }

    fn route_phrase(&self, code: &str) -> Option<String> {
        self.phrases.get(code).map(|p| (*p).to_string())
    }
}
