//! Wire types for agent and observer traffic.
//!
//! Every frame on the duplex channel is a JSON text message. Commands flow
//! server → agent as [`CommandEnvelope`]s; events flow server → observers as
//! [`Event`]s; agents report back with loosely structured objects that are
//! classified by [`AgentMessage::parse`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Query parameter naming the connection kind.
pub const PARAM_TYPE: &str = "type";
/// Query parameter carrying the agent identifier.
pub const PARAM_CLIENT_ID: &str = "client_id";
/// Value of [`PARAM_TYPE`] that marks an observer connection.
pub const OBSERVER_TYPE: &str = "web";

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Agent connection without a `client_id` parameter.
pub const CLOSE_MISSING_ID: u16 = 4000;
/// A newer connection took over this identifier.
pub const CLOSE_SUPERSEDED: u16 = 4002;

/// System command asking an agent to disconnect.
pub const OFFLINE_COMMAND: &str = "offline";

/// Command types whose `data.session_id` defaults to the target identifier.
pub const SESSION_COMMANDS: [&str; 4] = [
    "create_pty_session",
    "pty_input",
    "pty_resize",
    "force_kill_session",
];

/// Keys whose presence makes an unknown agent message look like shell output.
const OUTPUT_HINT_KEYS: [&str; 5] = ["command", "output", "stdout", "result", "data"];

/// A command sent to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command type, e.g. `shell_execute`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque command payload.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl CommandEnvelope {
    /// Create a command with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Map::new(),
        }
    }

    /// Add a payload field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Build the `offline` handshake request.
    #[must_use]
    pub fn offline(reason: &str) -> Self {
        Self::new(OFFLINE_COMMAND)
            .with("reason", reason)
            .with("timestamp", unix_millis())
    }

    /// Whether this command type carries a `session_id`.
    #[must_use]
    pub fn needs_session_id(&self) -> bool {
        SESSION_COMMANDS.contains(&self.kind.as_str())
    }

    /// Fill in `data.session_id` with `identifier` if the command type needs
    /// one and the caller left it out. Returns whether a value was injected.
    pub fn inject_session_id(&mut self, identifier: &str) -> bool {
        if !self.needs_session_id() {
            return false;
        }
        match self.data.get("session_id") {
            Some(value) if !value.is_null() => false,
            _ => {
                self.data
                    .insert("session_id".to_string(), Value::from(identifier));
                true
            }
        }
    }
}

/// Events pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An agent came online or went offline.
    ClientStatusChange {
        client_id: String,
        online: bool,
    },
    /// Output relayed from an agent.
    ShellOutput {
        client_id: String,
        /// Raw output, control sequences intact.
        output: String,
        /// Output with control sequences stripped.
        clean_output: String,
        success: bool,
        exit_code: i64,
    },
    /// A live agent was re-keyed to a new identifier.
    AliasUpdated {
        client_id: String,
        #[serde(rename = "oldAlias")]
        old_alias: String,
        #[serde(rename = "newAlias")]
        new_alias: String,
    },
    /// A screenshot was stored for an agent. Produced by the upload side and
    /// broadcast through the registry.
    NewScreenshot {
        client_id: String,
        screenshot_url: String,
        timestamp: u64,
    },
}

impl Event {
    #[must_use]
    pub fn status(client_id: impl Into<String>, online: bool) -> Self {
        Self::ClientStatusChange {
            client_id: client_id.into(),
            online,
        }
    }

    #[must_use]
    pub fn new_screenshot(
        client_id: impl Into<String>,
        screenshot_url: impl Into<String>,
    ) -> Self {
        Self::NewScreenshot {
            client_id: client_id.into(),
            screenshot_url: screenshot_url.into(),
            timestamp: unix_millis(),
        }
    }

    /// The agent this event is about.
    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::ClientStatusChange { client_id, .. }
            | Self::ShellOutput { client_id, .. }
            | Self::AliasUpdated { client_id, .. }
            | Self::NewScreenshot { client_id, .. } => client_id,
        }
    }
}

/// Shell output extracted from an agent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub output: String,
    pub success: bool,
    pub exit_code: i64,
}

impl ShellOutput {
    /// Pull output fields out of an agent message object.
    ///
    /// A nested `data` object is consulted before the top level.
    #[must_use]
    pub fn extract(message: &Map<String, Value>) -> Self {
        let nested = message.get("data").and_then(Value::as_object);
        let scopes: Vec<&Map<String, Value>> = nested.into_iter().chain([message]).collect();

        let output = scopes
            .iter()
            .flat_map(|scope| ["stdout", "output", "result"].map(|key| scope.get(key)))
            .flatten()
            .find(|value| !value.is_null())
            .map(render_output)
            .unwrap_or_default();

        let success = scopes
            .iter()
            .find_map(|scope| scope.get("success").and_then(Value::as_bool))
            .unwrap_or(true);

        let exit_code = scopes
            .iter()
            .flat_map(|scope| ["exit_code", "exitCode"].map(|key| scope.get(key)))
            .flatten()
            .find_map(Value::as_i64)
            .unwrap_or(0);

        Self {
            output,
            success,
            exit_code,
        }
    }

    /// Turn into the observer event for `client_id`.
    #[must_use]
    pub fn into_event(self, client_id: &str) -> Event {
        let clean_output = sanitize(&self.output);
        Event::ShellOutput {
            client_id: client_id.to_string(),
            output: self.output,
            clean_output,
            success: self.success,
            exit_code: self.exit_code,
        }
    }
}

fn render_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A classified frame received from an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    /// Explicit `shell_output` message.
    ShellOutput(ShellOutput),
    /// Message of another type that carries output-like fields. Older agents
    /// report results this way; kept for compatibility.
    UntypedOutput {
        kind: Option<String>,
        output: ShellOutput,
    },
    /// Valid JSON object with nothing to relay.
    Unknown { kind: Option<String> },
}

/// Why an agent frame could not be classified.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object")]
    NotAnObject,
}

impl AgentMessage {
    /// Parse and classify a text frame.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(object) = value else {
            return Err(MessageError::NotAnObject);
        };
        Ok(Self::classify(&object))
    }

    #[must_use]
    pub fn classify(object: &Map<String, Value>) -> Self {
        let kind = object.get("type").and_then(Value::as_str).map(str::to_string);

        if kind.as_deref() == Some("shell_output") {
            return Self::ShellOutput(ShellOutput::extract(object));
        }

        let looks_like_output = OUTPUT_HINT_KEYS
            .iter()
            .any(|key| object.get(*key).is_some_and(is_truthy));
        if looks_like_output {
            Self::UntypedOutput {
                kind,
                output: ShellOutput::extract(object),
            }
        } else {
            Self::Unknown { kind }
        }
    }

    /// The observer event to relay, if any.
    #[must_use]
    pub fn into_event(self, client_id: &str) -> Option<Event> {
        match self {
            Self::ShellOutput(output) | Self::UntypedOutput { output, .. } => {
                Some(output.into_event(client_id))
            }
            Self::Unknown { .. } => None,
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Strip ANSI and VT control sequences from terminal output.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    strip_ansi_escapes::strip_str(raw)
}

/// Milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
