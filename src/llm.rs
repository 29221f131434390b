use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::LlmSettings;
use crate::error::VerifyError;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Output of one tool call, sent back to the model.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: String,
}

/// One user-side turn of a chat session.
#[derive(Debug, Clone)]
pub enum Turn {
    Prompt(String),
    ToolResults(Vec<ToolResult>),
}

/// Either a text payload or a list of requested tools (occasionally both).
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub system: String,
    /// Function definitions in chat-completions `tools` format. Empty disables tools.
    pub tools: Vec<Value>,
    /// JSON schema the final text reply must follow.
    pub response_schema: Option<Value>,
    /// Use the cheaper quick model instead of the main one.
    pub quick: bool,
}

#[async_trait]
pub trait ChatSession: Send {
    async fn send(&mut self, turn: Turn) -> Result<ModelReply, VerifyError>;
}

pub trait ChatModel: Send + Sync {
    fn open_session(&self, options: SessionOptions) -> Box<dyn ChatSession>;

    /// Fails when a credential the model needs is missing.
    fn check_credentials(&self) -> Result<(), VerifyError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl Message {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    quick_model: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn from_settings(settings: &LlmSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
            quick_model: settings.quick_model.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    async fn complete(
        &self,
        options: &SessionOptions,
        messages: &[Message],
    ) -> Result<Message, VerifyError> {
        let model = if options.quick {
            &self.quick_model
        } else {
            &self.model
        };
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": 0.1,
            "max_tokens": 2048,
        });
        if !options.tools.is_empty() {
            body["tools"] = Value::Array(options.tools.clone());
            body["tool_choice"] = Value::String("auto".to_string());
        }
        if let Some(schema) = &options.response_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": "verification", "schema": schema },
            });
        }

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let excerpt: String = text.chars().take(300).collect();
            return Err(VerifyError::Model(format!(
                "completion request failed with {}: {}",
                status, excerpt
            )));
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)
            .map_err(|e| VerifyError::Model(format!("unparseable completion: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| VerifyError::Model("completion had no choices".to_string()))
    }
}

impl ChatModel for LlmClient {
    fn open_session(&self, options: SessionOptions) -> Box<dyn ChatSession> {
        let messages = vec![Message::text("system", options.system.clone())];
        Box::new(OpenAiSession {
            client: self.clone(),
            options,
            messages,
        })
    }

    fn check_credentials(&self) -> Result<(), VerifyError> {
        match &self.api_key {
            Some(_) => Ok(()),
            None => Err(VerifyError::MissingCredential("LLM_API_KEY")),
        }
    }
}

/// Stateful conversation: the full message history is resent every turn.
struct OpenAiSession {
    client: LlmClient,
    options: SessionOptions,
    messages: Vec<Message>,
}

#[async_trait]
impl ChatSession for OpenAiSession {
    async fn send(&mut self, turn: Turn) -> Result<ModelReply, VerifyError> {
        match turn {
            Turn::Prompt(prompt) => self.messages.push(Message::text("user", prompt)),
            Turn::ToolResults(results) => {
                for r in results {
                    self.messages.push(Message {
                        role: "tool".to_string(),
                        content: Some(r.output),
                        tool_calls: None,
                        tool_call_id: Some(r.call_id),
                        name: Some(r.name),
                    });
                }
            }
        }

        let reply = self.client.complete(&self.options, &self.messages).await?;

        let tool_calls: Vec<ToolCall> = reply
            .tool_calls
            .iter()
            .flatten()
            .map(|c| ToolCall {
                id: c.id.clone(),
                name: c.function.name.clone(),
                arguments: serde_json::from_str(&c.function.arguments)
                    .unwrap_or_else(|_| Value::String(c.function.arguments.clone())),
            })
            .collect();
        let text = reply.content.clone().filter(|t| !t.trim().is_empty());

        debug!(
            history = self.messages.len(),
            tool_calls = tool_calls.len(),
            text_len = text.as_deref().map(str::len).unwrap_or(0),
            "model turn complete"
        );

        self.messages.push(Message {
            role: "assistant".to_string(),
            content: reply.content,
            tool_calls: reply.tool_calls,
            tool_call_id: None,
            name: None,
        });

        Ok(ModelReply { text, tool_calls })
    }
}
