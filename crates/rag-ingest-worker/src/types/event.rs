//! File-change events delivered by the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event class names emitted by the file store's event bridge
const NODE_CREATED_EVENT: &str = "OCP\\Files\\Events\\Node\\NodeCreatedEvent";
const NODE_UPDATED_EVENT: &str = "OCP\\Files\\Events\\Node\\NodeUpdatedEvent";
const NODE_DELETED_EVENT: &str = "OCP\\Files\\Events\\Node\\NodeDeletedEvent";

/// Kind of change reported for a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    /// Any other event (metadata-only changes, renames, ...), kept verbatim
    Other(String),
}

impl EventKind {
    /// Map the wire `type` string to an event kind
    ///
    /// Accepts both the full event class names and the short forms.
    pub fn parse(raw: &str) -> Self {
        match raw {
            NODE_CREATED_EVENT | "created" => EventKind::Created,
            NODE_UPDATED_EVENT | "updated" => EventKind::Updated,
            NODE_DELETED_EVENT | "deleted" => EventKind::Deleted,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// Whether this kind means new file content is available
    pub fn is_content_available(&self) -> bool {
        matches!(self, EventKind::Created | EventKind::Updated)
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a file in the remote file store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Numeric file id, stable for the lifetime of the file
    pub id: i64,
    /// Path as reported by the file store, e.g. `/alice/files/report.pdf`
    pub path: String,
    /// Display name
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    /// Media type, e.g. `application/pdf`
    #[serde(rename = "mimetype")]
    pub media_type: String,
}

impl FileRef {
    /// Filename to report to the parser; falls back to the last path segment
    pub fn filename(&self) -> &str {
        if !self.name.is_empty() {
            return &self.name;
        }
        self.path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.path)
    }

    /// Owning user, taken from the first path segment (`/alice/files/...`)
    pub fn owner(&self) -> Option<&str> {
        self.path.split('/').find(|segment| !segment.is_empty())
    }
}

/// Share metadata attached to some events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub id: i64,
    pub share_type: Option<i32>,
    pub share_with: Option<String>,
    pub permissions: Option<i32>,
}

/// A decoded file-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    /// Trace id propagated from the publisher
    pub trace_id: String,
    /// Unique id of this event
    pub event_id: String,
    /// Kind of change
    pub kind: EventKind,
    /// Tenant the file belongs to
    pub tenant: String,
    /// The file that changed
    pub file: FileRef,
    /// Share information, when the publisher included it
    pub share: Option<ShareInfo>,
    /// When the publisher received the event
    pub received_at: Option<DateTime<Utc>>,
}
