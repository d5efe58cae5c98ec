//! Exact-match attribute filters.
//!
//! A filter is a plain map of attribute name to required value. An event
//! matches when every filter key is present on the event with exactly that
//! value; attributes not named by the filter are ignored, and an empty filter
//! matches everything.

use std::collections::BTreeMap;

use cloudevents::{AttributesReader, Event};

/// Whether `event` satisfies every entry of `filter`.
pub fn matches(filter: &BTreeMap<String, String>, event: &Event) -> bool {
    filter
        .iter()
        .all(|(name, expected)| attribute(event, name).as_deref() == Some(expected.as_str()))
}

/// String value of a context attribute or extension.
pub fn attribute(event: &Event, name: &str) -> Option<String> {
    match name {
        "id" => Some(event.id().to_string()),
        "type" => Some(event.ty().to_string()),
        "source" => Some(event.source().to_string()),
        "specversion" => Some(event.specversion().to_string()),
        "subject" => event.subject().map(str::to_string),
        "datacontenttype" => event.datacontenttype().map(str::to_string),
        "dataschema" => event.dataschema().map(|s| s.to_string()),
        "time" => event.time().map(|t| t.to_rfc3339()),
        extension => event.extension(extension).map(|v| v.to_string()),
    }
}
