//! Commits, event encoding, and stream identity.
//!
//! Events cross the durable-store boundary as [`EventData`]: an event type
//! tag plus a JSON payload, taken apart from the adjacently tagged domain
//! event and reassembled on replay.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::EventSourced;

/// Fixed namespace UUID for deterministic stream ID derivation.
///
/// All stream IDs are UUID v5 values derived from this namespace and the
/// `"{kind}/{id}"` string, so the same entity identity always maps to the
/// same stream, regardless of which process performs the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9a, 0x1e, 0x7c, 0x3b, 0x4d, 0x2f, 0x4a, 0x8e, 0xb5, 0x6c, 0x1f, 0x3d, 0x7e, 0x9a, 0x0b, 0xc4,
]);

/// Derive the durable stream id for an entity.
///
/// # Examples
///
/// ```
/// use eventfold_domain::stream_id;
/// use uuid::Uuid;
///
/// let id = Uuid::new_v4();
/// assert_eq!(stream_id("counter", id), stream_id("counter", id));
/// assert_ne!(stream_id("counter", id), stream_id("order", id));
/// ```
pub fn stream_id(kind: &str, id: Uuid) -> Uuid {
    let name = format!("{kind}/{id}");
    Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
}

/// One serialized event inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Event type tag (the `"type"` of the adjacently tagged enum).
    pub event_type: String,
    /// The `"data"` part of the enum; `null` for fieldless variants.
    pub payload: serde_json::Value,
}

/// An immutable, versioned batch of events appended to one stream.
///
/// For a given `stream_id`, commits form a contiguous sequence of versions
/// starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Idempotency key. Equal to the command id when one was supplied.
    pub commit_id: Uuid,
    pub stream_id: Uuid,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
    pub events: Vec<EventData>,
}

/// Split an adjacently tagged event into its type tag and payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized, or if it
/// does not serialize to an object with a string `"type"` field.
pub fn encode_event<T: EventSourced>(event: &T::Event) -> serde_json::Result<EventData> {
    use serde::ser::Error as _;

    let value = serde_json::to_value(event)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(format!(
            "{} event must serialize to an adjacently tagged object",
            T::KIND
        )));
    };
    let event_type = match obj.remove("type") {
        Some(serde_json::Value::String(tag)) => tag,
        _ => {
            return Err(serde_json::Error::custom(format!(
                "{} event is missing its string 'type' tag",
                T::KIND
            )));
        }
    };
    // Absent for fieldless variants.
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);

    Ok(EventData {
        event_type,
        payload,
    })
}

/// Reassemble a stored event into `T::Event`.
///
/// Returns `None` for an event type `T` does not know (or a payload that no
/// longer matches it), so older code can replay streams written by newer
/// code.
pub fn decode_event<T: EventSourced>(data: &EventData) -> Option<T::Event> {
    let tagged = if data.payload.is_null() {
        serde_json::json!({ "type": data.event_type })
    } else {
        serde_json::json!({
            "type": data.event_type,
            "data": data.payload,
        })
    };

    match serde_json::from_value::<T::Event>(tagged) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(
                kind = T::KIND,
                event_type = %data.event_type,
                error = %e,
                "skipping undecodable event"
            );
            None
        }
    }
}
