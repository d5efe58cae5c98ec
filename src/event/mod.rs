//! CloudEvents helpers shared by ingress and the delivery path.
//!
//! - Hop counter: the `kgcphops` extension bounds how often a reply can be
//!   bounced back into the same tenant. HTTP header transport turns it into
//!   a string, so reads accept either form.
//! - Queue codec: events travel through the queue service in binary mode,
//!   context attributes as `ce-` prefixed message attributes and the payload
//!   as message data. Structured JSON messages are accepted on decode.

pub mod filter;

use std::collections::HashMap;

use cloudevents::event::{ExtensionValue, TryIntoUrl};
use cloudevents::{AttributesReader, AttributesWriter, Data, Event, EventBuilder, EventBuilderV10};

use crate::queue::QueueMessage;

/// Extension carrying the remaining hop budget.
pub const HOPS_ATTRIBUTE: &str = "kgcphops";

/// Hop budget stamped on events entering through ingress.
pub const DEFAULT_HOPS: i64 = 255;

/// Prefix for context attributes in binary mode.
const ATTRIBUTE_PREFIX: &str = "ce-";

/// Message attribute holding the payload media type.
const CONTENT_TYPE: &str = "content-type";

/// Media type marking a structured-mode message.
const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Errors converting between queue messages and events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Unsupported spec version: {0}")]
    SpecVersion(String),

    #[error("Invalid time attribute {value:?}: {source}")]
    Time {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Invalid dataschema attribute {value:?}: {reason}")]
    DataSchema { value: String, reason: String },

    #[error("Invalid event: {0}")]
    Build(#[from] cloudevents::event::EventBuilderError),

    #[error("Invalid structured event: {0}")]
    Structured(#[from] serde_json::Error),
}

// ============================================================================
// Hop counter
// ============================================================================

/// Remaining hops, or `None` when the event carries no (parseable) counter.
pub fn remaining_hops(event: &Event) -> Option<i64> {
    match event.extension(HOPS_ATTRIBUTE)? {
        ExtensionValue::Integer(hops) => Some(*hops),
        ExtensionValue::String(hops) => hops.trim().parse().ok(),
        ExtensionValue::Boolean(_) => None,
    }
}

pub fn set_remaining_hops(event: &mut Event, hops: i64) {
    event.set_extension(HOPS_ATTRIBUTE, hops);
}

pub fn delete_remaining_hops(event: &mut Event) {
    event.remove_extension(HOPS_ATTRIBUTE);
}

// ============================================================================
// Queue codec
// ============================================================================

/// Encode an event as a binary-mode queue message.
pub fn encode_message(event: &Event) -> QueueMessage {
    let mut attributes = HashMap::new();
    let mut put = |name: &str, value: String| {
        attributes.insert(format!("{ATTRIBUTE_PREFIX}{name}"), value);
    };

    put("specversion", event.specversion().to_string());
    put("id", event.id().to_string());
    put("source", event.source().to_string());
    put("type", event.ty().to_string());
    if let Some(subject) = event.subject() {
        put("subject", subject.to_string());
    }
    if let Some(time) = event.time() {
        put("time", time.to_rfc3339());
    }
    if let Some(schema) = event.dataschema() {
        put("dataschema", schema.to_string());
    }
    for (name, value) in event.iter_extensions() {
        put(name, value.to_string());
    }

    if let Some(content_type) = event.datacontenttype() {
        attributes.insert(CONTENT_TYPE.to_string(), content_type.to_string());
    }

    let data = match event.data() {
        Some(Data::Binary(bytes)) => bytes.clone(),
        Some(Data::String(text)) => text.clone().into_bytes(),
        Some(Data::Json(value)) => value.to_string().into_bytes(),
        None => Vec::new(),
    };

    QueueMessage {
        id: String::new(),
        data,
        attributes,
    }
}

/// Decode a queue message in binary or structured mode.
pub fn decode_message(message: &QueueMessage) -> Result<Event, EventError> {
    let content_type = message.attributes.get(CONTENT_TYPE).map(String::as_str);
    if content_type.is_some_and(|ct| ct.starts_with(STRUCTURED_CONTENT_TYPE)) {
        return Ok(serde_json::from_slice(&message.data)?);
    }

    let attr = |name: &str| {
        message
            .attributes
            .get(&format!("{ATTRIBUTE_PREFIX}{name}"))
            .map(String::as_str)
    };

    match attr("specversion") {
        Some("1.0") => {}
        Some(other) => return Err(EventError::SpecVersion(other.to_string())),
        None => return Err(EventError::MissingAttribute("specversion")),
    }

    let mut builder = EventBuilderV10::new()
        .id(attr("id").ok_or(EventError::MissingAttribute("id"))?)
        .source(attr("source").ok_or(EventError::MissingAttribute("source"))?)
        .ty(attr("type").ok_or(EventError::MissingAttribute("type"))?);

    if let Some(subject) = attr("subject") {
        builder = builder.subject(subject);
    }
    if let Some(time) = attr("time") {
        let parsed = chrono::DateTime::parse_from_rfc3339(time).map_err(|source| {
            EventError::Time {
                value: time.to_string(),
                source,
            }
        })?;
        builder = builder.time(parsed.with_timezone(&chrono::Utc));
    }

    for (key, value) in &message.attributes {
        let Some(name) = key.strip_prefix(ATTRIBUTE_PREFIX) else {
            continue;
        };
        if matches!(
            name,
            "specversion" | "id" | "source" | "type" | "subject" | "time" | "dataschema"
        ) {
            continue;
        }
        builder = builder.extension(name, value.as_str());
    }

    if !message.data.is_empty() || content_type.is_some() {
        let content_type = content_type.unwrap_or("application/octet-stream");
        builder = builder.data(content_type, message.data.clone());
    }

    let mut event = builder.build()?;
    if let Some(schema) = attr("dataschema") {
        let url = schema.into_url().map_err(|e| EventError::DataSchema {
            value: schema.to_string(),
            reason: e.to_string(),
        })?;
        event.set_dataschema(Some(url));
    }
    Ok(event)
}
