//! LLM execution collaborator
//!
//! The engine hands an agent configuration, the model ids to try (preference
//! first, then fallback), and the resolved input map; the executor owns the
//! HTTP calls, per-(provider, model) client caching, model fallback, and
//! structured-output validation. Failures only surface after every model in
//! the list has been tried.

use crate::engine::output::validate_structured_output;
use crate::ir::{CompiledSpec, ResolvedAgent, ResolvedProvider, ResolvedSchema};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Fallback when the API reports no token counts
const CHARS_PER_TOKEN: f64 = 3.0;

/// Default generation cap for APIs that require one
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Token usage statistics for one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    /// Estimate from character counts when the API omits usage
    pub fn estimate(prompt_len: usize, response_len: usize) -> Self {
        Self::new(
            (prompt_len as f64 / CHARS_PER_TOKEN).ceil() as u64,
            (response_len as f64 / CHARS_PER_TOKEN).ceil() as u64,
        )
    }
}

/// Result of one successful LLM execution
#[derive(Debug, Clone)]
pub struct LlmOutcome {
    /// Response text, or the validated object for structured output
    pub response: Value,
    /// Model that actually answered (after any fallback)
    pub model: String,
    pub provider: String,
    pub usage: Option<TokenUsage>,
    pub structured: bool,
}

/// The LLM collaborator boundary. Fallback across the supplied model list
/// happens inside the executor; the engine treats the call as atomic.
#[async_trait]
pub trait LlmExecutor: Send + Sync {
    async fn execute(
        &self,
        agent: &ResolvedAgent,
        models: &[String],
        input: &Map<String, Value>,
    ) -> Result<LlmOutcome>;
}

// ============================================================================
// HTTP EXECUTOR
// ============================================================================

/// Executes agents against provider chat APIs (OpenAI-style and
/// Anthropic-style). Clients are cached per provider:model.
pub struct HttpLlmExecutor {
    providers: BTreeMap<String, ResolvedProvider>,
    schemas: BTreeMap<String, ResolvedSchema>,
    clients: DashMap<String, reqwest::Client>,
}

impl HttpLlmExecutor {
    pub fn from_spec(spec: &CompiledSpec) -> Self {
        Self {
            providers: spec.providers.clone(),
            schemas: spec.schemas.clone(),
            clients: DashMap::new(),
        }
    }

    fn client(&self, provider: &str, model: &str) -> reqwest::Client {
        let key = format!("{}:{}", provider, model);
        if let Some(hit) = self.clients.get(&key) {
            tracing::debug!(provider, model, "llm client cache hit");
            return hit.clone();
        }
        let client = reqwest::Client::new();
        self.clients.insert(key, client.clone());
        client
    }

    fn output_schema<'a>(&'a self, agent: &ResolvedAgent) -> Option<&'a ResolvedSchema> {
        agent
            .output_schema_name
            .as_deref()
            .and_then(|name| self.schemas.get(name))
    }

    /// System prompt (instructions plus the structured-output contract) and
    /// user message built from the resolved input.
    fn build_prompt(
        &self,
        agent: &ResolvedAgent,
        input: &Map<String, Value>,
        schema: Option<&ResolvedSchema>,
    ) -> (Option<String>, String) {
        let mut system = if agent.instructions.is_empty() {
            None
        } else {
            Some(agent.instructions.clone())
        };

        if let Some(schema) = schema {
            let contract = schema_instruction(schema);
            system = Some(match system {
                Some(text) => format!("{}\n\n{}", text, contract),
                None => contract,
            });
        }

        let user = if input.is_empty() {
            "Please proceed with your task.".to_string()
        } else {
            let rendered = serde_json::to_string_pretty(&Value::Object(input.clone()))
                .unwrap_or_default();
            format!("Input:\n{}", rendered)
        };

        (system, user)
    }

    async fn try_model(
        &self,
        agent: &ResolvedAgent,
        model: &str,
        input: &Map<String, Value>,
    ) -> Result<LlmOutcome> {
        let provider = self
            .providers
            .get(&agent.provider_name)
            .ok_or_else(|| anyhow!("Provider '{}' not found", agent.provider_name))?;

        let api_key = provider
            .api_key
            .value
            .clone()
            .ok_or_else(|| anyhow!("API key for provider '{}' not resolved", provider.name))?;

        let schema = self.output_schema(agent);
        let (system, user) = self.build_prompt(agent, input, schema);
        let client = self.client(&provider.name, model);

        tracing::debug!(
            provider = %provider.name,
            model,
            structured = schema.is_some(),
            "sending LLM request"
        );

        let (content, usage) = match provider.provider_type.as_str() {
            "openai" => {
                self.call_openai(&client, &api_key, agent, model, system, user, schema.is_some())
                    .await?
            }
            "anthropic" => {
                self.call_anthropic(&client, &api_key, agent, model, system, user)
                    .await?
            }
            other => bail!(
                "Provider type '{}' is not supported (expected openai or anthropic)",
                other
            ),
        };

        let (response, structured) = match schema {
            Some(schema) => {
                let payload: Value = serde_json::from_str(content.trim())
                    .with_context(|| format!("Model '{}' returned invalid JSON", model))?;
                validate_structured_output(schema, &payload)?;
                (payload, true)
            }
            None => (Value::String(content), false),
        };

        Ok(LlmOutcome {
            response,
            model: model.to_string(),
            provider: provider.name.clone(),
            usage,
            structured,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_openai(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        agent: &ResolvedAgent,
        model: &str,
        system: Option<String>,
        user: String,
        json_mode: bool,
    ) -> Result<(String, Option<TokenUsage>)> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        let prompt_len = user.len();
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user,
        });

        let payload = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            max_tokens: agent.params.max_tokens,
            temperature: agent.params.temperature,
            top_p: agent.params.top_p,
            response_format: json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let response = client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error ({}): {}", status, error_text);
        }

        let api_response: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI API response")?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let usage = api_response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .or_else(|| Some(TokenUsage::estimate(prompt_len, content.len())));

        Ok((content, usage))
    }

    async fn call_anthropic(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        agent: &ResolvedAgent,
        model: &str,
        system: Option<String>,
        user: String,
    ) -> Result<(String, Option<TokenUsage>)> {
        let prompt_len = user.len();
        let payload = AnthropicRequest {
            model: model.to_string(),
            max_tokens: agent.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: user,
            }],
            temperature: agent.params.temperature,
            top_p: agent.params.top_p,
        };

        let response = client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("Anthropic API error ({}): {}", status, error_text);
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;

        let content = api_response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        let usage = api_response
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .or_else(|| Some(TokenUsage::estimate(prompt_len, content.len())));

        Ok((content, usage))
    }
}

#[async_trait]
impl LlmExecutor for HttpLlmExecutor {
    async fn execute(
        &self,
        agent: &ResolvedAgent,
        models: &[String],
        input: &Map<String, Value>,
    ) -> Result<LlmOutcome> {
        let mut last_error: Option<anyhow::Error> = None;

        for model in models {
            match self.try_model(agent, model, input).await {
                Ok(outcome) => {
                    tracing::info!(
                        agent = %agent.name,
                        model = %outcome.model,
                        "LLM execution succeeded"
                    );
                    return Ok(outcome);
                }
                Err(error) => {
                    tracing::warn!(
                        agent = %agent.name,
                        model = %model,
                        error = %error,
                        "model failed, trying next"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(anyhow!(
            "All models failed for agent '{}'. Last error: {}",
            agent.name,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "no models to try".to_string())
        ))
    }
}

/// Render the structured-output contract for a schema as prompt text
fn schema_instruction(schema: &ResolvedSchema) -> String {
    let fields: Vec<String> = schema
        .fields
        .iter()
        .map(|(name, field)| {
            if field.field_type == "list" {
                format!(
                    "{} (list of {})",
                    name,
                    field.item_type.as_deref().unwrap_or("string")
                )
            } else {
                format!("{} ({})", name, field.field_type)
            }
        })
        .collect();

    format!(
        "Respond with a single JSON object containing exactly these fields: {}. \
         Do not include any other fields or text outside the JSON object.",
        fields.join(", ")
    )
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

// ============================================================================
// MOCK EXECUTOR
// ============================================================================

/// One recorded call to the mock executor
#[derive(Debug, Clone)]
pub struct MockLlmCall {
    pub agent: String,
    pub model: String,
    pub input: Map<String, Value>,
}

/// Mock executor with a FIFO response queue, configurable failing models,
/// and full call recording. Essential for engine tests and CI.
pub struct MockLlmExecutor {
    responses: Mutex<Vec<Value>>,
    default_response: Value,
    failing_models: Mutex<std::collections::HashSet<String>>,
    calls: Mutex<Vec<MockLlmCall>>,
}

impl MockLlmExecutor {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            default_response: Value::String("Mock response".to_string()),
            failing_models: Mutex::new(std::collections::HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<Value>) -> Self {
        let executor = Self::new();
        *executor.responses.lock().expect("mock poisoned") = responses;
        executor
    }

    pub fn with_default(mut self, response: Value) -> Self {
        self.default_response = response;
        self
    }

    /// Make a specific model id fail, to exercise fallback
    pub fn fail_model(self, model: impl Into<String>) -> Self {
        self.failing_models
            .lock()
            .expect("mock poisoned")
            .insert(model.into());
        self
    }

    pub fn queue_response(&self, response: Value) {
        self.responses.lock().expect("mock poisoned").push(response);
    }

    pub fn calls(&self) -> Vec<MockLlmCall> {
        self.calls.lock().expect("mock poisoned").clone()
    }

    pub fn last_call(&self) -> Option<MockLlmCall> {
        self.calls.lock().expect("mock poisoned").last().cloned()
    }
}

impl Default for MockLlmExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmExecutor for MockLlmExecutor {
    async fn execute(
        &self,
        agent: &ResolvedAgent,
        models: &[String],
        input: &Map<String, Value>,
    ) -> Result<LlmOutcome> {
        let failing = self.failing_models.lock().expect("mock poisoned").clone();
        let model = models
            .iter()
            .find(|m| !failing.contains(*m))
            .ok_or_else(|| anyhow!("All models failed for agent '{}'", agent.name))?
            .clone();

        self.calls.lock().expect("mock poisoned").push(MockLlmCall {
            agent: agent.name.clone(),
            model: model.clone(),
            input: input.clone(),
        });

        let response = {
            let mut queue = self.responses.lock().expect("mock poisoned");
            if queue.is_empty() {
                self.default_response.clone()
            } else {
                queue.remove(0)
            }
        };

        let response_len = response.as_str().map(str::len).unwrap_or(0);
        Ok(LlmOutcome {
            structured: !response.is_string(),
            response,
            model,
            provider: agent.provider_name.clone(),
            usage: Some(TokenUsage::estimate(64, response_len)),
        })
    }
}
