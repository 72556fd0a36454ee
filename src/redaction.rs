//! PII scrubbing for JSON-shaped values before they cross the trust
//! boundary to storage.
//!
//! The engine walks an arbitrary JSON tree and rebuilds it bottom-up,
//! replacing every flagged span inside every string leaf, at any nesting
//! depth, with `<REDACTED {ENTITY_TYPE}>`. Non-string leaves pass through
//! unchanged. Detection itself is delegated to the [`PiiDetector`]
//! collaborator; this module only owns the traversal and splicing
//! invariants (idempotence, shape preservation, full reachability).

use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};

/// A flagged region of a string, in byte offsets on char boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiSpan {
    /// Start byte offset (inclusive).
    pub start: usize,
    /// End byte offset (exclusive).
    pub end: usize,
    /// Entity label spliced into the replacement marker.
    pub entity: String,
}

impl PiiSpan {
    /// Construct a span.
    pub fn new(start: usize, end: usize, entity: impl Into<String>) -> Self {
        Self {
            start,
            end,
            entity: entity.into(),
        }
    }

    fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// PII detection collaborator.
pub trait PiiDetector: Send + Sync {
    /// Return every flagged span in `text`. Offsets are byte positions on
    /// UTF-8 character boundaries. Spans may overlap; the engine resolves
    /// overlaps.
    fn detect(&self, text: &str) -> Vec<PiiSpan>;

    /// The entity labels this detector can produce.
    fn catalogue(&self) -> Vec<String>;
}

/// Regex-backed detector covering the common entity catalogue.
///
/// Emails, phone numbers, and social security numbers match structurally;
/// person names match against a configured name list (the heavy NLP lives
/// in the external detection service this stands in for).
pub struct PatternDetector {
    patterns: Vec<(String, Regex)>,
}

impl PatternDetector {
    /// Detector with the built-in structural patterns.
    pub fn new() -> Self {
        let patterns = [
            ("EMAIL_ADDRESS", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
            ("US_SSN", r"\b\d{3}-\d{2}-\d{4}\b"),
            (
                "PHONE_NUMBER",
                r"\+?\d{1,3}[-.\s]\d{3}[-.\s]\d{4}\b|\(\d{3}\)\s?\d{3}[-.\s]\d{4}\b|\b\d{3}[-.\s]\d{4}\b",
            ),
        ];
        Self {
            patterns: patterns
                .iter()
                .filter_map(|(entity, pattern)| {
                    Regex::new(pattern).ok().map(|re| ((*entity).to_owned(), re))
                })
                .collect(),
        }
    }

    /// Extend the detector with a person-name list.
    pub fn with_person_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let escaped: Vec<String> = names
            .into_iter()
            .map(|n| regex::escape(n.as_ref()))
            .filter(|n| !n.is_empty())
            .collect();
        if escaped.is_empty() {
            return self;
        }
        let alternation = format!(r"\b(?:{})\b", escaped.join("|"));
        if let Ok(re) = Regex::new(&alternation) {
            self.patterns.push(("PERSON".to_owned(), re));
        }
        self
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiDetector for PatternDetector {
    fn detect(&self, text: &str) -> Vec<PiiSpan> {
        let mut spans = Vec::new();
        for (entity, re) in &self.patterns {
            for m in re.find_iter(text) {
                spans.push(PiiSpan::new(m.start(), m.end(), entity.clone()));
            }
        }
        spans
    }

    fn catalogue(&self) -> Vec<String> {
        self.patterns.iter().map(|(entity, _)| entity.clone()).collect()
    }
}

/// Scrubs JSON-shaped values using a detection collaborator.
pub struct RedactionEngine {
    detector: Arc<dyn PiiDetector>,
}

impl RedactionEngine {
    /// Build an engine over a detector.
    pub fn new(detector: Arc<dyn PiiDetector>) -> Self {
        Self { detector }
    }

    /// The entity labels the current detector can produce, for the
    /// compliance attestation surface. Sorted and deduplicated.
    pub fn entity_catalogue(&self) -> Vec<String> {
        let mut labels = self.detector.catalogue();
        labels.sort();
        labels.dedup();
        labels
    }

    /// Scrub one string.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut spans = self.detector.detect(text);
        if spans.is_empty() {
            return text.to_owned();
        }

        // Overlap resolution: keep the longest span, ties broken by the
        // earliest start, then by detector order for full determinism.
        let mut order: Vec<usize> = (0..spans.len()).collect();
        order.sort_by(|&a, &b| {
            spans[b]
                .len()
                .cmp(&spans[a].len())
                .then(spans[a].start.cmp(&spans[b].start))
                .then(a.cmp(&b))
        });
        let mut kept: Vec<PiiSpan> = Vec::with_capacity(spans.len());
        for idx in order {
            let candidate = &spans[idx];
            if !kept.iter().any(|k| k.overlaps(candidate)) {
                kept.push(candidate.clone());
            }
        }

        // Apply in descending start order so earlier indices stay valid.
        kept.sort_by(|a, b| b.start.cmp(&a.start));
        spans = kept;

        let mut out = text.to_owned();
        for span in &spans {
            if span.end > out.len() || !out.is_char_boundary(span.start) || !out.is_char_boundary(span.end)
            {
                continue;
            }
            out.replace_range(span.start..span.end, &format!("<REDACTED {}>", span.entity));
        }
        out
    }

    /// Scrub an arbitrary JSON-shaped value, rebuilding the tree bottom-up.
    ///
    /// Shape-preserving: the output has the same structure as the input,
    /// with every string leaf replaced by its scrubbed form.
    pub fn scrub_value(&self, value: &Value) -> Value {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
            Value::String(s) => Value::String(self.scrub_text(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.scrub_value(v)).collect())
            }
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (k, v) in fields {
                    out.insert(k.clone(), self.scrub_value(v));
                }
                Value::Object(out)
            }
        }
    }
}
