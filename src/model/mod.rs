use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};

/// Correlation id assigned by the controller. Echoed verbatim in every response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One decoded inbound command.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(alias = "requestId")]
    pub id: RequestId,
    pub code: String,
    /// Explicit duration override in milliseconds.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub viewer: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub source_details: Option<Value>,
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            duration: None,
            quantity: None,
            viewer: None,
            parameters: Vec::new(),
            source_details: None,
            received_at: Instant::now(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration.as_millis() as i64);
        self
    }

    pub fn with_viewer(mut self, viewer: impl Into<String>) -> Self {
        self.viewer = Some(viewer.into());
        self
    }

    /// The requested duration when the controller sent a positive one, else `default`.
    pub fn duration_or(&self, default: Duration) -> Duration {
        match self.duration {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => default,
        }
    }

    pub fn viewer_name(&self) -> &str {
        self.viewer
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("The crowd")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectStatus {
    Success,
    Failure,
    Retry,
    Paused,
    Resumed,
    Finished,
    KeepAlive,
}

/// Outbound response frame. Write-once; the controller never acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub status: EffectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn new(request_id: RequestId, status: EffectStatus) -> Self {
        Self {
            request_id: Some(request_id),
            status,
            time_remaining_ms: None,
            message: None,
        }
    }

    pub fn keep_alive() -> Self {
        Self {
            request_id: None,
            status: EffectStatus::KeepAlive,
            time_remaining_ms: None,
            message: None,
        }
    }

    pub fn with_remaining(mut self, remaining: Duration) -> Self {
        self.time_remaining_ms = Some(remaining.as_millis() as u64);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        if !message.is_empty() {
            self.message = Some(message);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Visible,
    NotVisible,
    Selectable,
    NotSelectable,
}

/// Unsolicited client-to-controller notices that are not tied to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notice {
    EffectUpdate { code: String, status: Visibility },
}

#[derive(Debug)]
pub enum Inbound {
    KeepAlive,
    Command(Request),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("invalid command: {reason}")]
    InvalidCommand {
        id: Option<RequestId>,
        reason: String,
    },
}

impl ProtocolError {
    /// The request id the frame carried, when one could be recovered.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::InvalidCommand { id, .. } => id.as_ref(),
            _ => None,
        }
    }
}

/// Classify one complete frame as a keep-alive or a command.
pub fn classify(frame: &[u8]) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_slice(frame)?;
    let Value::Object(map) = &value else {
        return Err(ProtocolError::NotAnObject);
    };

    if is_keep_alive_type(map.get("type")) {
        return Ok(Inbound::KeepAlive);
    }

    let raw_id = map.get("id").or_else(|| map.get("requestId")).cloned();
    if raw_id.is_none() && !map.contains_key("code") {
        return Ok(Inbound::KeepAlive);
    }
    let id = raw_id.and_then(|v| serde_json::from_value::<RequestId>(v).ok());

    serde_json::from_value::<Request>(value)
        .map(Inbound::Command)
        .map_err(|err| ProtocolError::InvalidCommand {
            id,
            reason: err.to_string(),
        })
}

fn is_keep_alive_type(kind: Option<&Value>) -> bool {
    match kind {
        Some(Value::String(s)) => s.eq_ignore_ascii_case("keepalive"),
        Some(Value::Number(n)) => n.as_u64() == Some(255),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_command_with_optional_fields() {
        let frame = br#"{"id":42,"code":"heal_25","viewer":"sam","duration":15000,"sourceDetails":{"kind":"bits"}}"#;
        let Inbound::Command(req) = classify(frame).unwrap() else {
            panic!("expected command");
        };
        assert_eq!(req.id, RequestId::Number(42));
        assert_eq!(req.code, "heal_25");
        assert_eq!(req.viewer_name(), "sam");
        assert_eq!(req.duration_or(Duration::from_secs(1)), Duration::from_secs(15));
        assert!(req.source_details.is_some());
    }

    #[test]
    fn accepts_request_id_alias_and_string_ids() {
        let frame = br#"{"requestId":"abc-1","code":"kill"}"#;
        let Inbound::Command(req) = classify(frame).unwrap() else {
            panic!("expected command");
        };
        assert_eq!(req.id, RequestId::Text("abc-1".to_string()));
    }

    #[test]
    fn classifies_keep_alive_forms() {
        assert!(matches!(classify(b"{}").unwrap(), Inbound::KeepAlive));
        assert!(matches!(
            classify(br#"{"type":255}"#).unwrap(),
            Inbound::KeepAlive
        ));
        assert!(matches!(
            classify(br#"{"type":"KeepAlive","id":0}"#).unwrap(),
            Inbound::KeepAlive
        ));
    }

    #[test]
    fn invalid_command_keeps_recoverable_id() {
        let err = classify(br#"{"id":7}"#).unwrap_err();
        assert_eq!(err.request_id(), Some(&RequestId::Number(7)));

        let err = classify(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject));
        assert!(classify(b"{not json").is_err());
    }

    #[test]
    fn non_positive_duration_falls_back_to_default() {
        let mut req = Request::new(1, "give_buff_speed");
        req.duration = Some(0);
        assert_eq!(req.duration_or(Duration::from_secs(30)), Duration::from_secs(30));
        req.duration = Some(-5);
        assert_eq!(req.duration_or(Duration::from_secs(30)), Duration::from_secs(30));
    }

    #[test]
    fn response_serializes_wire_shape() {
        let resp = Response::new(RequestId::Number(42), EffectStatus::Success)
            .with_remaining(Duration::from_millis(30_000));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"requestId": 42, "status": "Success", "timeRemainingMs": 30000})
        );

        let json = serde_json::to_value(Response::keep_alive()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "KeepAlive"}));
    }

    #[test]
    fn notice_serializes_with_type_tag() {
        let notice = Notice::EffectUpdate {
            code: "spawn_bat".to_string(),
            status: Visibility::NotSelectable,
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "EffectUpdate", "code": "spawn_bat", "status": "NotSelectable"})
        );
    }
}
