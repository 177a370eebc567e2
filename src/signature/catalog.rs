//! Template catalogs: built-in `en`/`fr` patterns plus JSON files on disk.
//!
//! A catalog file is named `<locale>.json` and holds a flat object of
//! template key → pattern. Every pattern is compiled at load time so syntax
//! errors surface before the first render.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::template::{CompiledTemplate, TemplateError};

pub const ORAL_TABLET_TEMPLATE: &str = "ORAL_TABLET_TEMPLATE";
pub const LIQUID_TEMPLATE: &str = "LIQUID_TEMPLATE";
pub const INJECTION_TEMPLATE: &str = "INJECTION_TEMPLATE";
pub const PRN_TEMPLATE: &str = "PRN_TEMPLATE";
pub const DEVICE_TEMPLATE: &str = "DEVICE_TEMPLATE";
pub const DEFAULT_TEMPLATE: &str = "DEFAULT_TEMPLATE";

const VERB_EN: &str = "{verb, select, take {Take} apply {Apply} inject {Inject} inhale {Inhale} instill {Instill} other {Give}}";
const VERB_FR: &str = "{verb, select, take {Prendre} apply {Appliquer} inject {Injecter} inhale {Inhaler} instill {Instiller} other {Administrer}}";

const COUNTED_DOSE: &str =
    " {doseValue} {doseValue, plural, one {{unitSingular}} other {{unitPlural}}}";

fn builtin_en() -> Vec<(&'static str, String)> {
    vec![
        (
            ORAL_TABLET_TEMPLATE,
            [VERB_EN, COUNTED_DOSE, " {route} {frequency}[ {specialInstructions}]."].concat(),
        ),
        (
            LIQUID_TEMPLATE,
            [
                VERB_EN,
                " {doseValue} {doseUnit}[ ({doseEquivalent})] {route} {frequency}[ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            INJECTION_TEMPLATE,
            [
                VERB_EN,
                " {doseValue} {doseUnit}[ ({doseEquivalent})] {route}[ into the {site}] {frequency}[ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            PRN_TEMPLATE,
            [
                VERB_EN,
                COUNTED_DOSE,
                " {route} {frequency} as needed[ for {indication}][. Do not exceed {maxDose} per day][ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            DEVICE_TEMPLATE,
            [
                VERB_EN,
                COUNTED_DOSE,
                "[ ({doseEquivalent})] {route}[ to the {site}] {frequency}[ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            DEFAULT_TEMPLATE,
            [VERB_EN, COUNTED_DOSE, " {route} {frequency}[ {specialInstructions}]."].concat(),
        ),
    ]
}

fn builtin_fr() -> Vec<(&'static str, String)> {
    vec![
        (
            ORAL_TABLET_TEMPLATE,
            [VERB_FR, COUNTED_DOSE, " {route} {frequency}[ {specialInstructions}]."].concat(),
        ),
        (
            LIQUID_TEMPLATE,
            [
                VERB_FR,
                " {doseValue} {doseUnit}[ ({doseEquivalent})] {route} {frequency}[ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            INJECTION_TEMPLATE,
            [
                VERB_FR,
                " {doseValue} {doseUnit}[ ({doseEquivalent})] {route}[ dans {site}] {frequency}[ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            PRN_TEMPLATE,
            [
                VERB_FR,
                COUNTED_DOSE,
                " {route} {frequency} si besoin[ pour {indication}][. Ne pas dépasser {maxDose} par jour][ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            DEVICE_TEMPLATE,
            [
                VERB_FR,
                COUNTED_DOSE,
                "[ ({doseEquivalent})] {route}[ sur {site}] {frequency}[ {specialInstructions}].",
            ]
            .concat(),
        ),
        (
            DEFAULT_TEMPLATE,
            [VERB_FR, COUNTED_DOSE, " {route} {frequency}[ {specialInstructions}]."].concat(),
        ),
    ]
}

/// Locale → (template key → pattern source).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateCatalog {
    locales: BTreeMap<String, HashMap<String, String>>,
}

impl TemplateCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shipped `en` and `fr` catalogs.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for (key, source) in builtin_en() {
            catalog.insert("en", key, &source);
        }
        for (key, source) in builtin_fr() {
            catalog.insert("fr", key, &source);
        }
        catalog
    }

    /// Catalog made only of the `<locale>.json` files in `dir`.
    pub fn load(dir: &Path) -> Result<Self, TemplateError> {
        let mut catalog = Self::new();
        catalog.extend_from_dir(dir)?;
        Ok(catalog)
    }

    /// Merge `<locale>.json` files from `dir`; file entries override existing keys.
    /// Returns the number of templates read.
    pub fn extend_from_dir(&mut self, dir: &Path) -> Result<usize, TemplateError> {
        let read_err = |e: std::io::Error| TemplateError::CatalogRead {
            path: dir.display().to_string(),
            message: e.to_string(),
        };

        let mut files: Vec<_> = std::fs::read_dir(dir)
            .map_err(read_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut count = 0;
        for path in files {
            let Some(locale) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let file_name = path.display().to_string();
            let json = std::fs::read_to_string(&path).map_err(|e| TemplateError::CatalogRead {
                path: file_name.clone(),
                message: e.to_string(),
            })?;
            let templates: HashMap<String, String> =
                serde_json::from_str(&json).map_err(|e| TemplateError::CatalogParse {
                    file: file_name.clone(),
                    message: e.to_string(),
                })?;

            for (key, source) in &templates {
                CompiledTemplate::compile(source).map_err(|e| TemplateError::CatalogParse {
                    file: file_name.clone(),
                    message: format!("{key}: {e}"),
                })?;
            }

            count += templates.len();
            tracing::info!(locale = %locale, templates = templates.len(), "Template catalog loaded");
            self.locales
                .entry(locale.to_string())
                .or_default()
                .extend(templates);
        }
        Ok(count)
    }

    pub fn insert(&mut self, locale: &str, key: &str, source: &str) {
        self.locales
            .entry(locale.into())
            .or_default()
            .insert(key.into(), source.into());
    }

    pub fn get(&self, locale: &str, key: &str) -> Option<&str> {
        self.locales
            .get(locale)
            .and_then(|templates| templates.get(key))
            .map(String::as_str)
    }

    pub fn has_locale(&self, locale: &str) -> bool {
        self.locales.contains_key(locale)
    }

    pub fn locales(&self) -> impl Iterator<Item = &str> {
        self.locales.keys().map(String::as_str)
    }

    pub fn keys(&self, locale: &str) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .locales
            .get(locale)
            .map(|t| t.keys().map(String::as_str).collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_patterns_all_compile() {
        let catalog = TemplateCatalog::builtin();
        for locale in ["en", "fr"] {
            let keys = catalog.keys(locale);
            assert_eq!(keys.len(), 6, "{locale}");
            for key in keys {
                let source = catalog.get(locale, key).unwrap();
                CompiledTemplate::compile(source)
                    .unwrap_or_else(|e| panic!("{locale}/{key}: {e}"));
            }
        }
    }

    #[test]
    fn locales_listed_in_order() {
        let catalog = TemplateCatalog::builtin();
        assert_eq!(catalog.locales().collect::<Vec<_>>(), vec!["en", "fr"]);
        assert!(!catalog.has_locale("de"));
    }

    #[test]
    fn load_reads_locale_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("es.json")).unwrap();
        write!(file, r#"{{"DEFAULT_TEMPLATE": "Tomar {{doseValue}} {{doseUnit}}"}}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = TemplateCatalog::load(dir.path()).unwrap();
        assert!(catalog.has_locale("es"));
        assert_eq!(
            catalog.get("es", DEFAULT_TEMPLATE),
            Some("Tomar {doseValue} {doseUnit}")
        );
        assert_eq!(catalog.locales().count(), 1);
    }

    #[test]
    fn files_override_builtin_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("en.json"),
            r#"{"DEFAULT_TEMPLATE": "Use {doseValue}."}"#,
        )
        .unwrap();

        let mut catalog = TemplateCatalog::builtin();
        assert_eq!(catalog.extend_from_dir(dir.path()).unwrap(), 1);
        assert_eq!(catalog.get("en", DEFAULT_TEMPLATE), Some("Use {doseValue}."));
        assert!(catalog.get("en", ORAL_TABLET_TEMPLATE).is_some());
    }

    #[test]
    fn malformed_pattern_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("en.json"), r#"{"BROKEN": "Take {dose"}"#).unwrap();
        assert!(matches!(
            TemplateCatalog::load(dir.path()),
            Err(TemplateError::CatalogParse { .. })
        ));
    }

    #[test]
    fn invalid_json_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("en.json"), "not json").unwrap();
        assert!(matches!(
            TemplateCatalog::load(dir.path()),
            Err(TemplateError::CatalogParse { .. })
        ));
        assert!(matches!(
            TemplateCatalog::load(&dir.path().join("absent")),
            Err(TemplateError::CatalogRead { .. })
        ));
    }
}
