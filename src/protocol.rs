use serde::Serialize;
use serde_json::{Map, Value};

/// One request on the remote-control channel. Serializes to the wire form
/// `{"cmd": "<name>", ...}` consumed by the game's remote-control server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RemoteCommand {
    Ping,
    GetState,
    WaitFrames { frames: u32 },
    SendKey { key: String, action: KeyAction },
    SendText { text: String },
    ConsoleExec { command: String },
    Screenshot { path: String },
    Quit,
}

impl RemoteCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCommand::Ping => "ping",
            RemoteCommand::GetState => "get_state",
            RemoteCommand::WaitFrames { .. } => "wait_frames",
            RemoteCommand::SendKey { .. } => "send_key",
            RemoteCommand::SendText { .. } => "send_text",
            RemoteCommand::ConsoleExec { .. } => "console_exec",
            RemoteCommand::Screenshot { .. } => "screenshot",
            RemoteCommand::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Tap,
    Down,
    Up,
}

impl KeyAction {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "tap" => Ok(KeyAction::Tap),
            "down" => Ok(KeyAction::Down),
            "up" => Ok(KeyAction::Up),
            other => Err(format!(
                "invalid key action: {other} (expected tap|down|up)"
            )),
        }
    }
}

/// A decoded response line. The game defines the result fields; beyond the
/// `ok`/`error` envelope this type treats them as opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    fields: Map<String, Value>,
}

impl RemoteResponse {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn ok(&self) -> bool {
        matches!(self.fields.get("ok"), Some(Value::Bool(true)))
    }

    pub fn error_message(&self) -> Option<&str> {
        self.fields.get("error").and_then(Value::as_str)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_serialize_to_wire_form() {
        let encoded = serde_json::to_value(&RemoteCommand::Ping).expect("encode ping");
        assert_eq!(encoded, json!({"cmd": "ping"}));

        let encoded = serde_json::to_value(&RemoteCommand::WaitFrames { frames: 12 })
            .expect("encode wait_frames");
        assert_eq!(encoded, json!({"cmd": "wait_frames", "frames": 12}));

        let encoded = serde_json::to_value(&RemoteCommand::SendKey {
            key: "escape".to_string(),
            action: KeyAction::Tap,
        })
        .expect("encode send_key");
        assert_eq!(
            encoded,
            json!({"cmd": "send_key", "key": "escape", "action": "tap"})
        );
    }

    #[test]
    fn command_names_match_wire_names() {
        let command = RemoteCommand::ConsoleExec {
            command: "fps".to_string(),
        };
        let encoded = serde_json::to_value(&command).expect("encode");
        assert_eq!(encoded.get("cmd"), Some(&json!(command.name())));
    }

    #[test]
    fn key_action_parses_known_values() {
        assert_eq!(KeyAction::parse("tap"), Ok(KeyAction::Tap));
        assert_eq!(KeyAction::parse("DOWN"), Ok(KeyAction::Down));
        assert_eq!(KeyAction::parse(" up "), Ok(KeyAction::Up));
        assert!(KeyAction::parse("press").is_err());
    }

    #[test]
    fn response_envelope_detects_failure() {
        let fields = json!({"ok": false, "error": "unknown key"});
        let Value::Object(fields) = fields else {
            panic!("expected object");
        };
        let response = RemoteResponse::from_fields(fields);
        assert!(!response.ok());
        assert_eq!(response.error_message(), Some("unknown key"));
    }

    #[test]
    fn response_without_ok_field_is_failure() {
        let Value::Object(fields) = json!({"frame": 7}) else {
            panic!("expected object");
        };
        let response = RemoteResponse::from_fields(fields);
        assert!(!response.ok());
        assert_eq!(response.error_message(), None);
    }
}
