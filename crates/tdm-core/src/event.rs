//! Event descriptions and their validation.

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// Largest accepted fixed payload size of a single event, in VM words.
pub const MAX_EVENT_SIZE: u32 = 32;

/// One entry of a node's event table: a named event with a fixed payload
/// size in VM words (0 for payload-less events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescription {
    pub name: String,
    pub fixed_size: u32,
}

impl EventDescription {
    pub fn new(name: impl Into<String>, fixed_size: u32) -> Self {
        Self {
            name: name.into(),
            fixed_size,
        }
    }
}

/// Checks an event table for shape errors before it is written to a node.
///
/// Rejects empty names, duplicate names and oversized payload sizes.
pub fn validate_events_table(events: &[EventDescription]) -> Result<(), ValueError> {
    for (i, event) in events.iter().enumerate() {
        if event.name.is_empty() {
            return Err(ValueError::InvalidEvent(format!("entry {i} has no name")));
        }
        if event.fixed_size > MAX_EVENT_SIZE {
            return Err(ValueError::InvalidEvent(format!(
                "event {} has size {} (max {MAX_EVENT_SIZE})",
                event.name, event.fixed_size
            )));
        }
        if events[..i].iter().any(|e| e.name == event.name) {
            return Err(ValueError::InvalidEvent(format!(
                "duplicate event name {}",
                event.name
            )));
        }
    }
    Ok(())
}
