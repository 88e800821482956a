//! Client for the local inference service used by classifier stages 2 and
//! 3 and by the inference health check.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// A function the model may call, in the OpenAI/Ollama tool schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// A model endpoint able to answer prompts.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Ask the model to call `function`. Returns its arguments object, or
    /// `None` when the model answered without calling it.
    async fn call_function(&self, prompt: &str, function: &FunctionSpec) -> Result<Option<Value>>;

    /// Free-form completion.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Settings for [`OllamaBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_OLLAMA_URL.to_string(),
            model: "llama3.1".to_string(),
            timeout_secs: 30,
        }
    }
}

/// [`InferenceBackend`] for an Ollama server.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaBackend {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("{url} returned {status}: {text}");
        }
        Ok(text)
    }
}

/// Pull the arguments of the first call to `function` out of a chat reply.
///
/// Models without native tool support sometimes answer with the arguments
/// object as plain JSON content; that is accepted too.
fn extract_function_arguments(body: &str, function: &str) -> Result<Option<Value>> {
    let reply: ChatResponse =
        serde_json::from_str(body).context("failed to parse chat response")?;

    if let Some(calls) = reply.message.tool_calls {
        for call in calls {
            if call.function.name == function {
                return Ok(Some(call.function.arguments));
            }
        }
    }

    match serde_json::from_str::<Value>(reply.message.content.trim()) {
        Ok(value @ Value::Object(_)) => Ok(Some(value)),
        _ => Ok(None),
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        if !response.status().is_success() {
            bail!("{url} returned {}", response.status());
        }
        Ok(())
    }

    async fn call_function(&self, prompt: &str, function: &FunctionSpec) -> Result<Option<Value>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "tools": [{"type": "function", "function": function}],
            "stream": false,
        });
        let text = self.post("/api/chat", &body).await?;
        debug!(body_len = text.len(), function = %function.name, "inference function reply");
        extract_function_arguments(&text, &function.name)
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let text = self.post("/api/generate", &body).await?;
        let reply: GenerateResponse =
            serde_json::from_str(&text).context("failed to parse generate response")?;
        Ok(reply.response)
    }
}
