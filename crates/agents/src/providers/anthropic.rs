use {async_trait::async_trait, secrecy::ExposeSecret, serde_json::Value};

use tracing::{debug, trace};

use crate::{
    error::AdapterError,
    model::{
        ChatMessage, ContentPart, ModelResponse, Role, StopReason, ThinkingPart, TokenUsage,
        ToolDefinition,
    },
};

use super::{
    ProviderAdapter, ProviderId, ProviderSettings, RequestOptions, collect_system_text, count,
    new_synthetic_tool_call_id, non_system, send_json,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            base_url: settings.resolve_base_url(ProviderId::Anthropic),
            client: settings.build_client(),
        }
    }

    async fn try_send(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &RequestOptions,
        with_thinking: bool,
    ) -> Result<ModelResponse, AdapterError> {
        let body = build_request_body(messages, tools, options, with_thinking);

        debug!(
            model = %options.model,
            messages_count = messages.len(),
            tools_count = tools.len(),
            max_tokens = body["max_tokens"].as_u64().unwrap_or(0),
            thinking = body.get("thinking").is_some(),
            "anthropic request"
        );
        trace!(body = %body, "anthropic request body");

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", options.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let resp = send_json(request, ProviderId::Anthropic).await?;
        trace!(response = %resp, "anthropic raw response");

        Ok(parse_response(&resp))
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn supports_image_output(&self) -> bool {
        false
    }

    async fn send_chat_request(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
    ) -> ModelResponse {
        self.try_send(messages, &[], options, false)
            .await
            .unwrap_or_else(Into::into)
    }

    async fn send_tool_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &RequestOptions,
    ) -> ModelResponse {
        self.try_send(messages, tools, options, true)
            .await
            .unwrap_or_else(Into::into)
    }

    async fn send_image_request(
        &self,
        _messages: &[ChatMessage],
        _options: &RequestOptions,
    ) -> ModelResponse {
        AdapterError::UnsupportedOperation("anthropic models cannot generate images".into()).into()
    }
}

fn build_request_body(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    options: &RequestOptions,
    with_thinking: bool,
) -> Value {
    let thinking = with_thinking && options.thinking_budget > 0;
    let max_tokens = if thinking {
        options.effective_max_tokens()
    } else {
        options.max_tokens
    };

    let mut body = serde_json::json!({
        "model": options.model,
        "max_tokens": max_tokens,
        "messages": to_anthropic_messages(messages),
    });

    if let Some(system) = collect_system_text(messages) {
        body["system"] = Value::String(system);
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(to_anthropic_tools(tools));
    }
    if thinking {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": options.thinking_budget,
        });
    }
    body
}

fn to_anthropic_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

/// Convert the conversation to Anthropic `messages`.
///
/// System messages go to the top-level `system` field instead. Messages left
/// without any block (e.g. only ephemeral thinking) are skipped because the
/// API rejects empty content.
fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<Value> {
    non_system(messages)
        .filter_map(|msg| {
            let blocks: Vec<Value> = msg.parts.iter().filter_map(to_anthropic_block).collect();
            if blocks.is_empty() {
                return None;
            }
            let role = match msg.role() {
                Role::Assistant => "assistant",
                _ => "user",
            };
            Some(serde_json::json!({"role": role, "content": blocks}))
        })
        .collect()
}

fn image_block(media_type: &str, data: &str) -> Value {
    serde_json::json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": media_type,
            "data": data,
        }
    })
}

fn to_anthropic_block(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } => {
            (!text.is_empty()).then(|| serde_json::json!({"type": "text", "text": text}))
        },
        ContentPart::Image(img) => Some(image_block(&img.media_type, &img.base64_data)),
        ContentPart::ToolUse {
            call_id,
            tool_name,
            arguments,
            ..
        } => Some(serde_json::json!({
            "type": "tool_use",
            "id": call_id,
            "name": tool_name,
            "input": arguments,
        })),
        ContentPart::ToolResult {
            call_id,
            success,
            text,
            image,
            ..
        } => {
            let mut content = Vec::new();
            if let Some(text) = text {
                content.push(serde_json::json!({"type": "text", "text": text}));
            }
            if let Some(img) = image {
                content.push(image_block(&img.media_type, &img.base64_data));
            }
            Some(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
                "is_error": !success,
            }))
        },
        ContentPart::Thinking(thinking) => to_thinking_block(thinking),
    }
}

/// Redacted blobs are always echoed; plain thinking only with its signature
/// (the API rejects unsigned thinking). Ephemeral parts never leave.
fn to_thinking_block(thinking: &ThinkingPart) -> Option<Value> {
    if thinking.is_ephemeral {
        return None;
    }
    if thinking.is_redacted {
        return thinking
            .redacted_data
            .as_ref()
            .map(|data| serde_json::json!({"type": "redacted_thinking", "data": data}));
    }
    let signature = thinking.signature.as_ref()?;
    Some(serde_json::json!({
        "type": "thinking",
        "thinking": thinking.text.as_deref().unwrap_or(""),
        "signature": signature,
    }))
}

fn parse_content_block(block: &Value) -> Option<ContentPart> {
    match block["type"].as_str().unwrap_or("") {
        "text" => Some(ContentPart::text(block["text"].as_str().unwrap_or(""))),
        "tool_use" => {
            let id = block["id"].as_str().unwrap_or("");
            let arguments = match &block["input"] {
                Value::Null => serde_json::json!({}),
                input => input.clone(),
            };
            Some(ContentPart::ToolUse {
                call_id: if id.is_empty() {
                    new_synthetic_tool_call_id()
                } else {
                    id.to_string()
                },
                tool_name: block["name"].as_str().unwrap_or("").to_string(),
                arguments,
                thought_signature: None,
            })
        },
        "thinking" => Some(ContentPart::Thinking(ThinkingPart::signed(
            block["thinking"].as_str().unwrap_or(""),
            block["signature"].as_str().map(str::to_string),
        ))),
        "redacted_thinking" => Some(ContentPart::Thinking(ThinkingPart::redacted(
            block["data"].as_str().unwrap_or(""),
        ))),
        _ => None,
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

fn parse_response(resp: &Value) -> ModelResponse {
    let parts: Vec<ContentPart> = resp["content"]
        .as_array()
        .map(|blocks| blocks.iter().filter_map(parse_content_block).collect())
        .unwrap_or_default();

    let usage = TokenUsage {
        cache_read_tokens: count(&resp["usage"]["cache_read_input_tokens"]),
        ..TokenUsage::from_counts(
            count(&resp["usage"]["input_tokens"]),
            count(&resp["usage"]["output_tokens"]),
            None,
        )
    };

    ModelResponse::from_parts(
        parts,
        map_stop_reason(resp["stop_reason"].as_str().unwrap_or("")),
        usage,
    )
}
