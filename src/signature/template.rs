//! Template engine: localized sig patterns.
//!
//! Pattern syntax:
//! - `{field}` substitutes a slot
//! - `{field, plural, one {...} other {...} =0 {...}}` picks by plural category; `#` is the number
//! - `{field, select, key {...} other {...}}` picks by text value
//! - `[...]` is an optional clause, dropped when any field inside it is undefined
//! - `\` escapes the next character
//!
//! Compiled patterns are kept in a bounded FIFO cache keyed by (locale, key).
//! Failures never propagate out of `render`: it returns a visibly tagged
//! placeholder instead.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

use super::catalog::TemplateCatalog;
use super::types::{TemplateData, TemplateValue};
use crate::config::TemplateConfig;
use crate::conversion::format_number;

/// Prefix of the string `render` returns on failure.
pub const TEMPLATE_ERROR_TAG: &str = "[TEMPLATE_ERROR";

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum TemplateError {
    #[error("Template syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Missing template field '{field}'")]
    MissingField { field: String },

    #[error("Field '{field}' is not a number")]
    NotANumber { field: String },

    #[error("No template '{key}' for locale '{locale}'")]
    UnknownTemplate { locale: String, key: String },

    #[error("Unknown locale '{locale}'")]
    UnknownLocale { locale: String },

    #[error("Cannot read template catalog {path}: {message}")]
    CatalogRead { path: String, message: String },

    #[error("Cannot parse template catalog {file}: {message}")]
    CatalogParse { file: String, message: String },
}

// ═══════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum PluralKey {
    Exact(f64),
    Category(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Field(String),
    /// `#` inside a plural arm.
    Pound,
    Plural {
        field: String,
        arms: Vec<(PluralKey, Vec<Node>)>,
    },
    Select {
        field: String,
        arms: Vec<(String, Vec<Node>)>,
    },
    Optional(Vec<Node>),
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Syntax {
            position: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expect(&mut self, want: char) -> Result<(), TemplateError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(format!("expected '{want}', found '{c}'"))),
            None => Err(self.error(format!("expected '{want}', found end of template"))),
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && !matches!(c, '{' | '}' | ','))
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// Nodes up to (not including) `until`, or to the end of input.
    fn nodes(&mut self, until: Option<char>, in_plural: bool) -> Result<Vec<Node>, TemplateError> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        loop {
            let Some(c) = self.peek() else {
                if let Some(close) = until {
                    return Err(self.error(format!("unterminated block, expected '{close}'")));
                }
                break;
            };
            if Some(c) == until {
                break;
            }
            match c {
                '\\' => {
                    self.pos += 1;
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.error("dangling escape"))?;
                    text.push(escaped);
                }
                '{' => {
                    flush(&mut text, &mut nodes);
                    nodes.push(self.placeholder(in_plural)?);
                }
                '[' => {
                    flush(&mut text, &mut nodes);
                    self.pos += 1;
                    let inner = self.nodes(Some(']'), in_plural)?;
                    self.expect(']')?;
                    nodes.push(Node::Optional(inner));
                }
                '#' if in_plural => {
                    flush(&mut text, &mut nodes);
                    self.pos += 1;
                    nodes.push(Node::Pound);
                }
                '}' | ']' => return Err(self.error(format!("unexpected '{c}'"))),
                _ => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }

        flush(&mut text, &mut nodes);
        Ok(nodes)
    }

    fn placeholder(&mut self, in_plural: bool) -> Result<Node, TemplateError> {
        self.expect('{')?;
        self.skip_ws();
        let field = self.word();
        if field.is_empty() {
            return Err(self.error("empty field name"));
        }
        self.skip_ws();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(Node::Field(field));
        }

        self.expect(',')?;
        self.skip_ws();
        let kind = self.word();
        self.skip_ws();
        self.expect(',')?;

        let nested_plural = in_plural || kind == "plural";
        let mut arms: Vec<(String, Vec<Node>)> = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(self.error("unterminated placeholder")),
                _ => {}
            }
            let selector = self.word();
            if selector.is_empty() {
                return Err(self.error("expected an arm selector"));
            }
            self.skip_ws();
            self.expect('{')?;
            let body = self.nodes(Some('}'), nested_plural)?;
            self.expect('}')?;
            arms.push((selector, body));
        }

        if !arms.iter().any(|(sel, _)| sel == "other") {
            return Err(self.error(format!("{kind} for '{field}' has no 'other' arm")));
        }

        match kind.as_str() {
            "plural" => {
                let arms = arms
                    .into_iter()
                    .map(|(sel, body)| {
                        let key = match sel.strip_prefix('=') {
                            Some(n) => n
                                .parse::<f64>()
                                .map(PluralKey::Exact)
                                .map_err(|_| self.error(format!("invalid exact selector '{sel}'")))?,
                            None => PluralKey::Category(sel),
                        };
                        Ok((key, body))
                    })
                    .collect::<Result<Vec<_>, TemplateError>>()?;
                Ok(Node::Plural { field, arms })
            }
            "select" => Ok(Node::Select { field, arms }),
            other => Err(self.error(format!(
                "unknown placeholder kind '{other}' in '{}'",
                self.source
            ))),
        }
    }
}

fn flush(text: &mut String, nodes: &mut Vec<Node>) {
    if !text.is_empty() {
        nodes.push(Node::Text(std::mem::take(text)));
    }
}

// ═══════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════

/// CLDR-style plural category for the cardinal rules we ship.
pub fn plural_category(locale: &str, n: f64) -> &'static str {
    let language = locale.split(['-', '_']).next().unwrap_or(locale);
    match language {
        "fr" => {
            if (0.0..2.0).contains(&n) {
                "one"
            } else {
                "other"
            }
        }
        _ => {
            if n == 1.0 {
                "one"
            } else {
                "other"
            }
        }
    }
}

/// A parsed pattern, ready to render any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    nodes: Vec<Node>,
}

impl CompiledTemplate {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let nodes = Parser::new(source).nodes(None, false)?;
        Ok(Self { nodes })
    }

    pub fn render(&self, data: &TemplateData, locale: &str) -> Result<String, TemplateError> {
        let mut out = String::new();
        render_nodes(&self.nodes, data, locale, None, &mut out)?;
        Ok(out)
    }
}

fn lookup<'d>(data: &'d TemplateData, field: &str) -> Result<&'d TemplateValue, TemplateError> {
    data.get(field)
        .filter(|v| !v.is_blank())
        .ok_or_else(|| TemplateError::MissingField {
            field: field.into(),
        })
}

fn render_nodes(
    nodes: &[Node],
    data: &TemplateData,
    locale: &str,
    pound: Option<f64>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Field(field) => out.push_str(&lookup(data, field)?.to_string()),
            Node::Pound => {
                if let Some(n) = pound {
                    out.push_str(&format_number(n));
                }
            }
            Node::Plural { field, arms } => {
                let n = lookup(data, field)?
                    .as_number()
                    .ok_or_else(|| TemplateError::NotANumber {
                        field: field.clone(),
                    })?;
                let category = plural_category(locale, n);
                let body = arms
                    .iter()
                    .find(|(key, _)| matches!(key, PluralKey::Exact(v) if *v == n))
                    .or_else(|| {
                        arms.iter()
                            .find(|(key, _)| matches!(key, PluralKey::Category(c) if c == category))
                    })
                    .or_else(|| {
                        arms.iter()
                            .find(|(key, _)| matches!(key, PluralKey::Category(c) if c == "other"))
                    })
                    .map(|(_, body)| body);
                if let Some(body) = body {
                    render_nodes(body, data, locale, Some(n), out)?;
                }
            }
            Node::Select { field, arms } => {
                let value = lookup(data, field)?.to_string();
                let body = arms
                    .iter()
                    .find(|(key, _)| *key == value)
                    .or_else(|| arms.iter().find(|(key, _)| key == "other"))
                    .map(|(_, body)| body);
                if let Some(body) = body {
                    render_nodes(body, data, locale, pound, out)?;
                }
            }
            Node::Optional(inner) => {
                let mut clause = String::new();
                match render_nodes(inner, data, locale, pound, &mut clause) {
                    Ok(()) => out.push_str(&clause),
                    Err(TemplateError::MissingField { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Formatter cache
// ═══════════════════════════════════════════════════════════

type CacheKey = (String, String);

/// Bounded FIFO: insertion order in `order`, lookups through `index`.
#[derive(Debug)]
pub struct FormatterCache {
    capacity: usize,
    index: HashMap<CacheKey, Arc<CompiledTemplate>>,
    order: VecDeque<CacheKey>,
}

impl FormatterCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            index: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, locale: &str, key: &str) -> Option<Arc<CompiledTemplate>> {
        self.index
            .get(&(locale.to_string(), key.to_string()))
            .cloned()
    }

    pub fn insert(&mut self, locale: &str, key: &str, template: Arc<CompiledTemplate>) {
        let cache_key = (locale.to_string(), key.to_string());
        if self.index.insert(cache_key.clone(), template).is_some() {
            return;
        }
        self.order.push_back(cache_key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.index.remove(&evicted);
            }
        }
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct TemplateEngine {
    catalog: TemplateCatalog,
    locale: String,
    fallback_locale: String,
    cache: Mutex<FormatterCache>,
}

impl TemplateEngine {
    pub fn new(catalog: TemplateCatalog, config: &TemplateConfig) -> Result<Self, TemplateError> {
        if !catalog.has_locale(&config.default_locale) {
            return Err(TemplateError::UnknownLocale {
                locale: config.default_locale.clone(),
            });
        }
        Ok(Self {
            catalog,
            locale: config.default_locale.clone(),
            fallback_locale: config.fallback_locale.clone(),
            cache: Mutex::new(FormatterCache::new(config.max_cache_size)),
        })
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Switch locale; compiled patterns of the previous locale are dropped.
    pub fn set_locale(&mut self, locale: &str) -> Result<(), TemplateError> {
        if !self.catalog.has_locale(locale) {
            return Err(TemplateError::UnknownLocale {
                locale: locale.into(),
            });
        }
        self.locale = locale.into();
        self.lock().clear();
        tracing::info!(locale = %locale, "Template locale changed");
        Ok(())
    }

    pub fn cache_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, FormatterCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn compiled(&self, key: &str) -> Result<Arc<CompiledTemplate>, TemplateError> {
        if let Some(hit) = self.lock().get(&self.locale, key) {
            return Ok(hit);
        }

        let source = match self.catalog.get(&self.locale, key) {
            Some(source) => source,
            None => {
                let fallback = self.catalog.get(&self.fallback_locale, key).ok_or_else(|| {
                    TemplateError::UnknownTemplate {
                        locale: self.locale.clone(),
                        key: key.into(),
                    }
                })?;
                tracing::debug!(
                    key = %key,
                    locale = %self.locale,
                    fallback = %self.fallback_locale,
                    "Template missing in locale, using fallback"
                );
                fallback
            }
        };

        let compiled = Arc::new(CompiledTemplate::compile(source)?);
        self.lock().insert(&self.locale, key, Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn try_render(&self, key: &str, data: &TemplateData) -> Result<String, TemplateError> {
        self.compiled(key)?.render(data, &self.locale)
    }

    /// Render, degrading to `[TEMPLATE_ERROR:<key>] <reason>` on failure.
    pub fn render(&self, key: &str, data: &TemplateData) -> String {
        match self.try_render(key, data) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(key = %key, locale = %self.locale, error = %e, "Template render failed");
                format!("{TEMPLATE_ERROR_TAG}:{key}] {e}")
            }
        }
    }
}
