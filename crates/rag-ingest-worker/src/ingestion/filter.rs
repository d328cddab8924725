//! Event eligibility: which changes are worth sending to the parser

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::types::FileChangeEvent;

/// Media types the parsing service accepts
static DEFAULT_MEDIA_TYPES: Lazy<HashMap<&'static str, bool>> = Lazy::new(|| {
    HashMap::from([
        // Office documents
        ("application/pdf", true),
        ("application/msword", true),
        (
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            true,
        ),
        ("application/vnd.ms-excel", true),
        (
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            true,
        ),
        ("application/vnd.ms-powerpoint", true),
        (
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            true,
        ),
        // Text
        ("text/plain", true),
        ("text/markdown", true),
        ("text/csv", true),
        ("text/html", true),
        ("text/xml", true),
        ("application/xml", true),
        ("application/json", true),
        // Rich text
        ("application/rtf", true),
        // OpenDocument
        ("application/vnd.oasis.opendocument.text", true),
        ("application/vnd.oasis.opendocument.spreadsheet", true),
        ("application/vnd.oasis.opendocument.presentation", true),
    ])
});

/// Why an event is skipped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Ineligible {
    #[error("event kind '{0}' carries no new content")]
    UnsupportedEventKind(String),

    #[error("media type '{0}' is not accepted by the parser")]
    UnsupportedMediaType(String),
}

/// Classifies events as eligible for parsing
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    extra_media_types: HashSet<String>,
}

/// Drop parameters (`; charset=utf-8`) and case
fn normalize(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter that also accepts the given media types
    pub fn with_extra_media_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extra_media_types: types
                .into_iter()
                .map(|t| normalize(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Whether a media type is on the allow-list
    pub fn accepts_media_type(&self, media_type: &str) -> bool {
        let normalized = normalize(media_type);
        DEFAULT_MEDIA_TYPES
            .get(normalized.as_str())
            .copied()
            .unwrap_or(false)
            || self.extra_media_types.contains(&normalized)
    }

    /// Check an event, kind first
    pub fn check(&self, event: &FileChangeEvent) -> Result<(), Ineligible> {
        if !event.kind.is_content_available() {
            return Err(Ineligible::UnsupportedEventKind(event.kind.to_string()));
        }
        if !self.accepts_media_type(&event.file.media_type) {
            return Err(Ineligible::UnsupportedMediaType(
                event.file.media_type.clone(),
            ));
        }
        Ok(())
    }

    pub fn is_eligible(&self, event: &FileChangeEvent) -> bool {
        self.check(event).is_ok()
    }
}
