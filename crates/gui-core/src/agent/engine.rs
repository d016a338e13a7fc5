//! Hosted chat-model client
//!
//! Two wire formats cover the providers the bridge accepts: the OpenAI
//! `/chat/completions` shape (OpenAI and every compatible server) and the
//! Anthropic `/messages` shape.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Duration;
use tracing::debug;

use super::EngineParams;

const MAX_TOKENS: u32 = 2048;
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    /// Any other OpenAI-compatible server; needs an explicit base URL
    Compatible,
}

impl Provider {
    pub fn from_engine_type(engine_type: &str) -> Self {
        match engine_type.to_ascii_lowercase().as_str() {
            "openai" => Provider::OpenAi,
            "anthropic" => Provider::Anthropic,
            _ => Provider::Compatible,
        }
    }

    fn default_base_url(self, engine_type: &str) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::Anthropic => Some("https://api.anthropic.com/v1"),
            Provider::Compatible => match engine_type {
                "open_router" | "openrouter" => Some("https://openrouter.ai/api/v1"),
                _ => None,
            },
        }
    }

    fn api_key_env(engine_type: &str) -> &'static str {
        match engine_type.to_ascii_lowercase().as_str() {
            "anthropic" => "ANTHROPIC_API_KEY",
            "open_router" | "openrouter" => "OPENROUTER_API_KEY",
            "huggingface" => "HF_TOKEN",
            "azure" => "AZURE_OPENAI_API_KEY",
            _ => "OPENAI_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversation turn, optionally carrying a PNG screenshot
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub image: Option<Vec<u8>>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, png: Vec<u8>) -> Self {
        self.image = Some(png);
        self
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Client for one hosted model
#[derive(Debug, Clone)]
pub struct ChatEngine {
    provider: Provider,
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ChatEngine {
    pub fn new(params: EngineParams, timeout: Duration) -> Result<Self> {
        let provider = Provider::from_engine_type(&params.engine_type);

        let base_url = if params.base_url.is_empty() {
            provider
                .default_base_url(&params.engine_type)
                .with_context(|| {
                    format!("A base URL is required for provider {:?}", params.engine_type)
                })?
                .to_string()
        } else {
            params.base_url.trim_end_matches('/').to_string()
        };

        let api_key = if params.api_key.is_empty() {
            std::env::var(Provider::api_key_env(&params.engine_type)).unwrap_or_default()
        } else {
            params.api_key
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            provider,
            model: params.model,
            base_url,
            api_key,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Send a conversation and return the reply text
    pub async fn complete(&self, system: &str, messages: &[ChatMessage]) -> Result<String> {
        debug!(
            model = %self.model,
            provider = ?self.provider,
            messages = messages.len(),
            "Requesting completion"
        );

        match self.provider {
            Provider::Anthropic => self.complete_anthropic(system, messages).await,
            Provider::OpenAi | Provider::Compatible => self.complete_openai(system, messages).await,
        }
    }

    async fn complete_openai(&self, system: &str, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = openai_body(&self.model, system, messages);

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let resp: OpenAiResponse = request
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?
            .error_for_status()
            .context("Model request failed")?
            .json()
            .await
            .context("Failed to parse completion response")?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Completion response had no content")
    }

    async fn complete_anthropic(&self, system: &str, messages: &[ChatMessage]) -> Result<String> {
        if self.api_key.is_empty() {
            bail!("No API key for anthropic: pass one or set ANTHROPIC_API_KEY");
        }

        let url = format!("{}/messages", self.base_url);
        let body = anthropic_body(&self.model, system, messages);

        let resp: AnthropicResponse = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?
            .error_for_status()
            .context("Model request failed")?
            .json()
            .await
            .context("Failed to parse messages response")?;

        let text: String = resp
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();

        if text.is_empty() {
            bail!("Messages response had no text");
        }
        Ok(text)
    }
}

fn openai_body(model: &str, system: &str, messages: &[ChatMessage]) -> Value {
    let mut wire = vec![json!({"role": "system", "content": system})];

    for message in messages {
        let content = match message.image {
            Some(ref png) => json!([
                {"type": "text", "text": message.content},
                {
                    "type": "image_url",
                    "image_url": {"url": format!("data:image/png;base64,{}", BASE64.encode(png))}
                }
            ]),
            None => json!(message.content),
        };
        wire.push(json!({"role": message.role.as_str(), "content": content}));
    }

    json!({
        "model": model,
        "messages": wire,
        "max_tokens": MAX_TOKENS,
        "temperature": 0.0,
    })
}

fn anthropic_body(model: &str, system: &str, messages: &[ChatMessage]) -> Value {
    let wire: Vec<Value> = messages
        .iter()
        .map(|message| {
            let mut blocks = Vec::new();
            if let Some(ref png) = message.image {
                blocks.push(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": "image/png", "data": BASE64.encode(png)}
                }));
            }
            blocks.push(json!({"type": "text", "text": message.content}));
            json!({"role": message.role.as_str(), "content": blocks})
        })
        .collect();

    json!({
        "model": model,
        "system": system,
        "max_tokens": MAX_TOKENS,
        "messages": wire,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(engine_type: &str, base_url: &str) -> EngineParams {
        EngineParams {
            engine_type: engine_type.to_string(),
            model: "test-model".to_string(),
            base_url: base_url.to_string(),
            api_key: "sk-test".to_string(),
        }
    }

    #[test]
    fn test_provider_defaults() {
        let engine = ChatEngine::new(params("openai", ""), Duration::from_secs(5)).unwrap();
        assert_eq!(engine.provider(), Provider::OpenAi);
        assert_eq!(engine.base_url, "https://api.openai.com/v1");

        let engine =
            ChatEngine::new(params("vllm", "http://localhost:8000/v1/"), Duration::from_secs(5)).unwrap();
        assert_eq!(engine.provider(), Provider::Compatible);
        assert_eq!(engine.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn test_compatible_provider_needs_url() {
        let err = ChatEngine::new(params("huggingface", ""), Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("base URL"));
    }

    #[test]
    fn test_openai_body_with_image() {
        let messages = vec![
            ChatMessage::assistant("clicked"),
            ChatMessage::user("next?").with_image(vec![1, 2, 3]),
        ];
        let body = openai_body("gpt-4o", "be brief", &messages);

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "clicked");
        let parts = &body["messages"][2]["content"];
        assert_eq!(parts[0]["text"], "next?");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AQID");
    }

    #[test]
    fn test_anthropic_body_puts_system_outside() {
        let messages = vec![ChatMessage::user("where?").with_image(vec![1, 2, 3])];
        let body = anthropic_body("claude", "be brief", &messages);

        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][0]["content"][0]["source"]["data"], "AQID");
        assert_eq!(body["messages"][0]["content"][1]["text"], "where?");
    }

    #[test]
    fn test_parse_openai_response() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        let resp: OpenAiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hi"));
    }
}
