//! Queue payload decoding

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::types::{EventKind, FileChangeEvent, FileRef, ShareInfo};

/// Payload could not be turned into a file-change event
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

// Wire shapes are lenient; required fields are checked after parsing so
// errors name the field instead of a serde position.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    file: Option<WireFile>,
    #[serde(default)]
    share: Option<WireShare>,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireFile {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    mimetype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireShare {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    share_type: Option<i32>,
    #[serde(default)]
    share_with: Option<String>,
    #[serde(default)]
    permissions: Option<i32>,
}

impl WireShare {
    /// Publishers send an all-empty share object for unshared files
    fn into_share(self) -> Option<ShareInfo> {
        let id = self.id.filter(|id| *id != 0)?;
        Some(ShareInfo {
            id,
            share_type: self.share_type,
            share_with: self.share_with.filter(|s| !s.is_empty()),
            permissions: self.permissions,
        })
    }
}

/// Decode a raw queue payload into a file-change event
///
/// Fails without producing a partial event when the payload is not a JSON
/// object or lacks a file id or path.
pub fn decode_event(payload: &[u8]) -> Result<FileChangeEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let wire: WireEvent = serde_json::from_value(value)?;

    let file = wire.file.ok_or(DecodeError::MissingField("file"))?;
    let id = file.id.ok_or(DecodeError::MissingField("file.id"))?;
    let path = file
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or(DecodeError::MissingField("file.path"))?;

    Ok(FileChangeEvent {
        trace_id: wire.trace_id.unwrap_or_default(),
        event_id: wire.event_id.unwrap_or_default(),
        kind: EventKind::parse(wire.kind.as_deref().unwrap_or_default()),
        tenant: wire.tenant.unwrap_or_default(),
        file: FileRef {
            id,
            path,
            name: file.name.unwrap_or_default(),
            size: file.size.unwrap_or(0),
            media_type: file.mimetype.unwrap_or_default(),
        },
        share: wire.share.and_then(WireShare::into_share),
        received_at: wire.received_at,
    })
}
