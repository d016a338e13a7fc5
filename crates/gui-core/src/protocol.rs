//! Line-delimited JSON protocol
//!
//! One JSON object per line in both directions. Requests are dispatched on
//! their `type` field; every outgoing event is written and flushed as soon
//! as it is produced so the host sees progress step by step.

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::screen::ScreenSize;

/// Parameters of an `init` request
#[derive(Debug, Clone, Deserialize)]
pub struct InitParams {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_url: String,
    #[serde(default)]
    pub model_api_key: String,

    pub ground_provider: String,
    pub ground_url: String,
    pub ground_model: String,
    #[serde(default)]
    pub ground_api_key: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub grounding_width: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub grounding_height: u32,

    #[serde(default = "default_trajectory_length", deserialize_with = "lenient_usize")]
    pub max_trajectory_length: usize,
    #[serde(default = "default_enable_reflection", deserialize_with = "truthy")]
    pub enable_reflection: bool,
}

fn default_trajectory_length() -> usize {
    8
}

fn default_enable_reflection() -> bool {
    true
}

/// Integer given either as a JSON number or a numeric string
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.trunc() as u64))
            .ok_or_else(|| D::Error::custom(format!("invalid integer: {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("invalid integer: {:?}", s))),
        other => Err(D::Error::custom(format!("invalid integer: {}", other))),
    }
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = lenient_u64(deserializer)?;
    u32::try_from(value).map_err(|_| D::Error::custom(format!("integer out of range: {}", value)))
}

fn lenient_usize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = lenient_u64(deserializer)?;
    usize::try_from(value).map_err(|_| D::Error::custom(format!("integer out of range: {}", value)))
}

/// Boolean by JSON truthiness: `0`, `""`, `null`, `[]` and `{}` are false
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    })
}

/// Parameters of a `run` request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub query: Option<String>,
}

/// A decoded input line
#[derive(Debug, Clone)]
pub enum Request {
    Init(Value),
    Run(RunParams),
    Stop,
    /// Any other `type`, carried as its JSON rendering
    Unknown(String),
}

impl Request {
    /// Decode one trimmed, non-empty line
    ///
    /// Returns `None` for text that is not JSON at all. `init` parameters are
    /// left undecoded so field errors surface from the init handler.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;

        let kind = value.get("type").cloned().unwrap_or(Value::Null);
        let request = match kind.as_str() {
            Some("init") => Request::Init(value),
            Some("run") => {
                let query = value
                    .get("query")
                    .and_then(|q| q.as_str())
                    .map(|q| q.to_string());
                Request::Run(RunParams { query })
            }
            Some("stop") => Request::Stop,
            Some(other) => Request::Unknown(other.to_string()),
            None => Request::Unknown(kind.to_string()),
        };

        Some(request)
    }
}

/// Outgoing events, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Inited {
        screen: ScreenSize,
        scaled: ScreenSize,
    },
    Screenshot {
        step: usize,
        scaled: ScreenSize,
    },
    Predicting {
        step: usize,
    },
    Action {
        code: String,
        info: Value,
        step: usize,
    },
    Done {
        info: Value,
    },
    Fail {
        info: Value,
    },
    Wait {
        seconds: f64,
    },
    Next,
    Timeout {
        steps: usize,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
    },
    PredictError {
        error: String,
        step: usize,
    },
    ExecError {
        error: String,
        code: String,
        step: usize,
    },
    Stopped,
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
            step: None,
        }
    }

    /// The `type` tag this event serializes with
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Inited { .. } => "inited",
            Event::Screenshot { .. } => "screenshot",
            Event::Predicting { .. } => "predicting",
            Event::Action { .. } => "action",
            Event::Done { .. } => "done",
            Event::Fail { .. } => "fail",
            Event::Wait { .. } => "wait",
            Event::Next => "next",
            Event::Timeout { .. } => "timeout",
            Event::Error { .. } => "error",
            Event::PredictError { .. } => "predict_error",
            Event::ExecError { .. } => "exec_error",
            Event::Stopped => "stopped",
        }
    }
}

/// Writes events as newline-delimited JSON
pub struct EventWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> EventWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one event and flush
    pub async fn send(&mut self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;

        self.inner.write_all(json.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;

        trace!(event = event.kind(), "Sent event");
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn init_value(extra: Value) -> Value {
        let mut base = json!({
            "type": "init",
            "ground_provider": "huggingface",
            "ground_url": "http://localhost:8080",
            "ground_model": "ui-tars-1.5-7b",
            "grounding_width": 1920,
            "grounding_height": "1080"
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        base
    }

    #[test]
    fn test_init_defaults() {
        let params: InitParams = serde_json::from_value(init_value(json!({}))).unwrap();
        assert_eq!(params.provider, None);
        assert_eq!(params.model_url, "");
        assert_eq!(params.grounding_width, 1920);
        assert_eq!(params.grounding_height, 1080);
        assert_eq!(params.max_trajectory_length, 8);
        assert!(params.enable_reflection);
    }

    #[test]
    fn test_init_missing_required_field() {
        let mut value = init_value(json!({}));
        value.as_object_mut().unwrap().remove("ground_url");

        let err = serde_json::from_value::<InitParams>(value).unwrap_err();
        assert!(err.to_string().contains("ground_url"));
    }

    #[test]
    fn test_init_truthy_reflection() {
        let params: InitParams =
            serde_json::from_value(init_value(json!({"enable_reflection": 0}))).unwrap();
        assert!(!params.enable_reflection);

        let params: InitParams =
            serde_json::from_value(init_value(json!({"enable_reflection": "yes"}))).unwrap();
        assert!(params.enable_reflection);
    }

    #[test]
    fn test_init_rejects_bad_dimension() {
        let value = init_value(json!({"grounding_width": "wide"}));
        assert!(serde_json::from_value::<InitParams>(value).is_err());
    }

    #[test]
    fn test_request_parse() {
        assert!(Request::parse("{not json").is_none());
        assert!(matches!(Request::parse(r#"{"type":"stop"}"#), Some(Request::Stop)));

        match Request::parse(r#"{"type":"run","query":"open firefox"}"#) {
            Some(Request::Run(params)) => assert_eq!(params.query.as_deref(), Some("open firefox")),
            other => panic!("unexpected {:?}", other),
        }

        match Request::parse(r#"{"type":"pause"}"#) {
            Some(Request::Unknown(kind)) => assert_eq!(kind, "pause"),
            other => panic!("unexpected {:?}", other),
        }

        match Request::parse(r#"{"query":"x"}"#) {
            Some(Request::Unknown(kind)) => assert_eq!(kind, "null"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(Event::Next).unwrap();
        assert_eq!(json, json!({"type": "next"}));

        let json = serde_json::to_value(Event::error("Invalid JSON")).unwrap();
        assert_eq!(json, json!({"type": "error", "message": "Invalid JSON"}));

        let json = serde_json::to_value(Event::ExecError {
            error: "boom".into(),
            code: "pyautogui.click(1, 2)".into(),
            step: 4,
        })
        .unwrap();
        assert_eq!(json["type"], "exec_error");
        assert_eq!(json["step"], 4);

        for event in [Event::Next, Event::Stopped, Event::Wait { seconds: 1.0 }] {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind());
        }

        let json = serde_json::to_value(Event::Inited {
            screen: ScreenSize::new(3840, 2160),
            scaled: ScreenSize::new(2400, 1350),
        })
        .unwrap();
        assert_eq!(json["scaled"], json!({"width": 2400, "height": 1350}));
    }

    #[tokio::test]
    async fn test_writer_emits_lines() {
        let mut writer = EventWriter::new(Vec::new());
        writer.send(&Event::Predicting { step: 0 }).await.unwrap();
        writer.send(&Event::Stopped).await.unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec![r#"{"type":"predicting","step":0}"#, r#"{"type":"stopped"}"#]);
    }
}
