use std::time::Duration;

use async_trait::async_trait;
use concierge_core::config::{LlmConfig, LlmProvider};
use concierge_core::{AgentId, ApplicationError, ConversationId};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm::{
    ClassificationRequest, ClassifierReply, ConversationApi, ConversationEntry, ConversationOutput,
    ConversationReply, ConversationRequest, MessageRole, ToolCall, WorkflowClassifier,
};
use crate::tools::ToolDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 250, max_delay_ms: 4_000 }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1_u64 << attempt.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms))
    }
}

enum CallError {
    Retryable(String),
    Fatal(String),
}

/// Authenticated JSON POSTs against an OpenAI-style API root.
#[derive(Clone)]
struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    retry: RetryPolicy,
}

impl HttpTransport {
    fn from_config(config: &LlmConfig) -> Result<Self, ApplicationError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|error| ApplicationError::Configuration(format!("http client: {error}")))?;
        Ok(Self {
            client,
            base_url: config.resolved_base_url(),
            api_key: config.api_key.clone(),
            retry: RetryPolicy { max_retries: config.max_retries, ..RetryPolicy::default() },
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ApplicationError> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0;
        loop {
            match self.send_once(&url, body).await {
                Ok(value) => return Ok(value),
                Err(CallError::Retryable(message)) if attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        event_name = "llm.request_retry",
                        path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "llm request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(CallError::Retryable(message) | CallError::Fatal(message)) => {
                    return Err(ApplicationError::Provider(format!("POST {path}: {message}")));
                }
            }
        }
    }

    async fn send_once(&self, url: &str, body: &Value) -> Result<Value, CallError> {
        let mut request = self.client.post(url).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }
        let response = request.send().await.map_err(|error| {
            if error.is_timeout() || error.is_connect() {
                CallError::Retryable(error.to_string())
            } else {
                CallError::Fatal(error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("status {status}: {}", detail.chars().take(300).collect::<String>());
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                CallError::Retryable(message)
            } else {
                CallError::Fatal(message)
            });
        }
        response.json::<Value>().await.map_err(|error| CallError::Fatal(format!("invalid json body: {error}")))
    }
}

/// Client for Mistral's stateful conversations API.
pub struct MistralClient {
    http: HttpTransport,
    model: String,
}

impl MistralClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ApplicationError> {
        Ok(Self { http: HttpTransport::from_config(config)?, model: config.model.clone() })
    }
}

#[async_trait]
impl ConversationApi for MistralClient {
    async fn start_conversation(
        &self,
        agent_id: &AgentId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        let mut body = json!({
            "agent_id": agent_id.as_str(),
            "inputs": conversation_inputs(&request.inputs),
            "store": store,
        });
        attach_turn_options(&mut body, request);
        let response = self.http.post_json("/conversations", &body).await?;
        parse_conversation_reply(&response)
    }

    async fn append_conversation(
        &self,
        conversation_id: &ConversationId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        let mut body = json!({
            "inputs": conversation_inputs(&request.inputs),
            "store": store,
        });
        attach_turn_options(&mut body, request);
        let response =
            self.http.post_json(&format!("/conversations/{}", conversation_id.as_str()), &body).await?;
        parse_conversation_reply(&response)
    }
}

#[async_trait]
impl WorkflowClassifier for MistralClient {
    async fn classify_workflow(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassifierReply, ApplicationError> {
        let response = self
            .http
            .post_json("/chat/completions", &classification_body(&self.model, request))
            .await
            .map_err(|error| ApplicationError::Classification(error.to_string()))?;
        Ok(parse_classifier_reply(&response))
    }
}

/// Conversation API emulated over plain chat completions for providers without
/// server-side conversations. Transcripts live in memory and the id rotates on
/// every successful append, like the hosted API. A transcript is dropped when
/// its id is rotated out or released by the session manager.
pub struct CompletionsClient {
    http: HttpTransport,
    model: String,
    transcripts: DashMap<ConversationId, Vec<Value>>,
}

impl CompletionsClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ApplicationError> {
        Ok(Self {
            http: HttpTransport::from_config(config)?,
            model: config.model.clone(),
            transcripts: DashMap::new(),
        })
    }

    async fn complete(
        &self,
        mut transcript: Vec<Value>,
        request: &ConversationRequest,
    ) -> Result<ConversationReply, ApplicationError> {
        if let Some(instructions) = &request.instructions {
            let has_system = transcript.first().is_some_and(|first| first["role"] == "system");
            if has_system {
                transcript[0]["content"] = json!(instructions);
            } else {
                transcript.insert(0, json!({"role": "system", "content": instructions}));
            }
        }
        transcript.extend(chat_messages(&request.inputs));

        let mut body = json!({"model": self.model, "messages": transcript});
        if !request.tools.is_empty() {
            body["tools"] = tool_definitions(&request.tools);
        }
        let response = self.http.post_json("/chat/completions", &body).await?;
        let message = response["choices"][0]["message"].clone();
        if message.is_null() {
            return Err(ApplicationError::Provider("completion without a message".to_owned()));
        }

        let outputs = chat_outputs(&message);
        transcript.push(message);
        let conversation_id = ConversationId::new(format!("local-{}", Uuid::new_v4().simple()));
        self.transcripts.insert(conversation_id.clone(), transcript);
        Ok(ConversationReply { conversation_id, outputs })
    }
}

#[async_trait]
impl ConversationApi for CompletionsClient {
    async fn start_conversation(
        &self,
        agent_id: &AgentId,
        request: &ConversationRequest,
        _store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        debug!(event_name = "llm.local_conversation_started", agent_id = %agent_id, "local transcript started");
        self.complete(Vec::new(), request).await
    }

    async fn append_conversation(
        &self,
        conversation_id: &ConversationId,
        request: &ConversationRequest,
        _store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        let transcript =
            self.transcripts.get(conversation_id).map(|transcript| transcript.value().clone()).ok_or_else(
                || ApplicationError::Provider(format!("unknown local conversation `{conversation_id}`")),
            )?;
        let reply = self.complete(transcript, request).await?;
        self.transcripts.remove(conversation_id);
        Ok(reply)
    }

    fn release_conversation(&self, conversation_id: &ConversationId) {
        if self.transcripts.remove(conversation_id).is_some() {
            debug!(
                event_name = "llm.local_conversation_released",
                conversation_id = %conversation_id,
                "local transcript dropped"
            );
        }
    }
}

#[async_trait]
impl WorkflowClassifier for CompletionsClient {
    async fn classify_workflow(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassifierReply, ApplicationError> {
        let response = self
            .http
            .post_json("/chat/completions", &classification_body(&self.model, request))
            .await
            .map_err(|error| ApplicationError::Classification(error.to_string()))?;
        Ok(parse_classifier_reply(&response))
    }
}

/// Provider client matching the configured provider.
pub enum ProviderClient {
    Mistral(MistralClient),
    Completions(CompletionsClient),
}

impl ProviderClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ApplicationError> {
        match config.provider {
            LlmProvider::Mistral => MistralClient::from_config(config).map(Self::Mistral),
            LlmProvider::OpenAi | LlmProvider::Ollama => {
                CompletionsClient::from_config(config).map(Self::Completions)
            }
        }
    }
}

#[async_trait]
impl ConversationApi for ProviderClient {
    async fn start_conversation(
        &self,
        agent_id: &AgentId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        match self {
            Self::Mistral(client) => client.start_conversation(agent_id, request, store).await,
            Self::Completions(client) => client.start_conversation(agent_id, request, store).await,
        }
    }

    async fn append_conversation(
        &self,
        conversation_id: &ConversationId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        match self {
            Self::Mistral(client) => client.append_conversation(conversation_id, request, store).await,
            Self::Completions(client) => client.append_conversation(conversation_id, request, store).await,
        }
    }

    fn release_conversation(&self, conversation_id: &ConversationId) {
        match self {
            Self::Mistral(client) => client.release_conversation(conversation_id),
            Self::Completions(client) => client.release_conversation(conversation_id),
        }
    }
}

#[async_trait]
impl WorkflowClassifier for ProviderClient {
    async fn classify_workflow(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassifierReply, ApplicationError> {
        match self {
            Self::Mistral(client) => client.classify_workflow(request).await,
            Self::Completions(client) => client.classify_workflow(request).await,
        }
    }
}

fn attach_turn_options(body: &mut Value, request: &ConversationRequest) {
    if let Some(instructions) = &request.instructions {
        body["instructions"] = json!(instructions);
    }
    if !request.tools.is_empty() {
        body["tools"] = tool_definitions(&request.tools);
    }
}

pub fn tool_definitions(tools: &[ToolDescriptor]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect(),
    )
}

pub fn conversation_inputs(entries: &[ConversationEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|entry| match entry {
                ConversationEntry::UserMessage(content) => {
                    json!({"type": "message.input", "role": "user", "content": content})
                }
                ConversationEntry::ToolResult { tool_call_id, result, .. } => {
                    json!({"type": "function.result", "tool_call_id": tool_call_id, "result": result})
                }
            })
            .collect(),
    )
}

pub fn parse_conversation_reply(response: &Value) -> Result<ConversationReply, ApplicationError> {
    let conversation_id = response["conversation_id"]
        .as_str()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApplicationError::Provider("conversation reply without an id".to_owned()))?;

    let outputs = response["outputs"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry["type"].as_str() {
                    Some("message.output") => Some(ConversationOutput::Message(message_text(&entry["content"]))),
                    Some("function.call") => Some(ConversationOutput::ToolCall(ToolCall {
                        id: entry["tool_call_id"].as_str().unwrap_or_default().to_owned(),
                        name: entry["name"].as_str().unwrap_or_default().to_owned(),
                        arguments: parse_arguments_field(&entry["arguments"]),
                    })),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ConversationReply { conversation_id: ConversationId::new(conversation_id), outputs })
}

pub fn classification_body(model: &str, request: &ClassificationRequest) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.instructions})];
    messages.extend(request.history.iter().map(|message| {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        json!({"role": role, "content": message.content})
    }));
    messages.push(json!({"role": "user", "content": request.message}));

    json!({
        "model": model,
        "temperature": request.temperature,
        "messages": messages,
        "tools": tool_definitions(std::slice::from_ref(&request.tool)),
        "tool_choice": "any",
    })
}

pub fn parse_classifier_reply(response: &Value) -> ClassifierReply {
    let message = &response["choices"][0]["message"];
    let tool_arguments = message["tool_calls"]
        .as_array()
        .and_then(|calls| calls.first())
        .map(|call| parse_arguments_field(&call["function"]["arguments"]));
    let content = Some(message_text(&message["content"])).filter(|text| !text.trim().is_empty());
    ClassifierReply { tool_arguments, content }
}

fn chat_messages(entries: &[ConversationEntry]) -> Vec<Value> {
    entries
        .iter()
        .map(|entry| match entry {
            ConversationEntry::UserMessage(content) => json!({"role": "user", "content": content}),
            ConversationEntry::ToolResult { tool_call_id, name, result } => {
                json!({"role": "tool", "tool_call_id": tool_call_id, "name": name, "content": result})
            }
        })
        .collect()
}

fn chat_outputs(message: &Value) -> Vec<ConversationOutput> {
    let mut outputs = Vec::new();
    let text = message_text(&message["content"]);
    if !text.trim().is_empty() {
        outputs.push(ConversationOutput::Message(text));
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        outputs.extend(calls.iter().map(|call| {
            ConversationOutput::ToolCall(ToolCall {
                id: call["id"].as_str().unwrap_or_default().to_owned(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_owned(),
                arguments: parse_arguments_field(&call["function"]["arguments"]),
            })
        }));
    }
    outputs
}

/// Content is either a plain string or a list of typed chunks.
fn message_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(chunks) => chunks
            .iter()
            .filter_map(|chunk| match chunk["type"].as_str() {
                Some("text") => chunk["text"].as_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Tool arguments arrive JSON-encoded as a string; malformed payloads are kept
/// raw so the caller can report them.
fn parse_arguments_field(arguments: &Value) -> Value {
    match arguments {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
        Value::Null => json!({}),
        other => other.clone(),
    }
}
