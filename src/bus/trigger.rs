//! Fleet-wide trigger events

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TRIGGER_STARTUP: &str = "startup";
pub const TRIGGER_OFFER: &str = "offer";
pub const TRIGGER_ANSWER: &str = "answer";
pub const TRIGGER_BYE: &str = "bye";
pub const TRIGGER_CONNECT: &str = "connect";
pub const TRIGGER_DISCONNECT: &str = "disconnect";
pub const TRIGGER_SESSION: &str = "session";

/// Notification published on `<prefix>.<name>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BusTrigger {
    /// Node that emitted the trigger
    pub id: String,
    pub name: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pipeline: String,
}

/// Subject a trigger is published on
pub fn trigger_subject(prefix: &str, name: &str) -> String {
    format!("{}.{}", prefix, name)
}
