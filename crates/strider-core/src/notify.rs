//! Viewer-facing notification messages.
//!
//! Every message is one JSON object with `type`, an optional `finish` flag,
//! `data` and an optional `detail`. `finish: true` marks the last message of
//! a run.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::route::RouteStep;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Walking,
    Location,
    Error,
    Stopped,
    Success,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<bool>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Notification {
    fn new(kind: NotificationKind, finish: Option<bool>, data: Value, detail: Option<Value>) -> Self {
        Self {
            kind,
            finish,
            data,
            detail,
        }
    }

    /// Sent when a viewer connects.
    pub fn walking(active: bool) -> Self {
        Self::new(NotificationKind::Walking, None, Value::Bool(active), None)
    }

    /// A step was committed upstream. `progress` is in `0.0..=1.0`.
    pub fn location(step: RouteStep, progress: f64) -> Self {
        Self::new(
            NotificationKind::Location,
            Some(false),
            json!({ "lat": step.lat, "lng": step.lng }),
            Some(json!(progress)),
        )
    }

    pub fn step_error(message: impl Into<String>, error_count: u32) -> Self {
        Self::new(
            NotificationKind::Error,
            Some(false),
            Value::String(message.into()),
            Some(json!(error_count)),
        )
    }

    /// The error budget ran out at `last_index`; finalization still follows.
    pub fn budget_exhausted(last_index: usize) -> Self {
        Self::new(NotificationKind::Error, Some(false), json!(last_index), None)
    }

    pub fn stopped(index: usize) -> Self {
        Self::new(NotificationKind::Stopped, Some(false), json!(index), None)
    }

    pub fn success() -> Self {
        Self::new(
            NotificationKind::Success,
            Some(true),
            Value::String("success".into()),
            None,
        )
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(
            NotificationKind::Error,
            Some(true),
            Value::String(message.into()),
            None,
        )
    }

    pub fn stop_echo() -> Self {
        Self::new(NotificationKind::Stop, None, Value::Null, None)
    }

    pub fn is_terminal(&self) -> bool {
        self.finish == Some(true)
    }

    pub fn to_json(&self) -> String {
        // Serializing this struct has no failure path: every field is plain data.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Inbound viewer message, parsed from a text frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewerCommand {
    Pong,
    Stop,
    Other(String),
}

impl ViewerCommand {
    pub fn parse(text: &str) -> Self {
        if text.trim() == "pong" {
            return Self::Pong;
        }
        #[derive(Deserialize)]
        struct Typed {
            #[serde(rename = "type")]
            kind: String,
        }
        match serde_json::from_str::<Typed>(text) {
            Ok(t) if t.kind == "stop" => Self::Stop,
            _ => Self::Other(text.to_string()),
        }
    }
}
