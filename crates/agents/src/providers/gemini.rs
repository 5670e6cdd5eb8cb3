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
    is_synthetic_tool_call_id, new_synthetic_tool_call_id, non_system, optional_count,
    send_json,
};

pub struct GeminiAdapter {
    base_url: String,
    client: reqwest::Client,
}

/// Which `generateContent` variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Chat,
    Tools,
    Image,
}

impl GeminiAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            base_url: settings.resolve_base_url(ProviderId::Gemini),
            client: settings.build_client(),
        }
    }

    async fn try_send(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &RequestOptions,
        kind: RequestKind,
    ) -> Result<ModelResponse, AdapterError> {
        let body = build_request_body(messages, tools, options, kind);

        debug!(
            model = %options.model,
            kind = ?kind,
            contents_count = body["contents"].as_array().map_or(0, Vec::len),
            tools_count = tools.len(),
            "gemini generateContent request"
        );
        trace!(body = %body, "gemini request body");

        let request = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, options.model
            ))
            .header("x-goog-api-key", options.api_key.expose_secret())
            .json(&body);

        let resp = send_json(request, ProviderId::Gemini).await?;
        trace!(response = %resp, "gemini raw response");

        parse_response(&resp)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn supports_image_output(&self) -> bool {
        true
    }

    async fn send_chat_request(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
    ) -> ModelResponse {
        self.try_send(messages, &[], options, RequestKind::Chat)
            .await
            .unwrap_or_else(Into::into)
    }

    async fn send_tool_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &RequestOptions,
    ) -> ModelResponse {
        self.try_send(messages, tools, options, RequestKind::Tools)
            .await
            .unwrap_or_else(Into::into)
    }

    async fn send_image_request(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
    ) -> ModelResponse {
        self.try_send(messages, &[], options, RequestKind::Image)
            .await
            .unwrap_or_else(Into::into)
    }
}

fn build_request_body(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    options: &RequestOptions,
    kind: RequestKind,
) -> Value {
    let thinking = kind == RequestKind::Tools && options.thinking_budget > 0;
    let mut contents = to_gemini_contents(messages);
    let system = collect_system_text(messages);

    let max_tokens = if thinking {
        options.effective_max_tokens()
    } else {
        options.max_tokens
    };

    let mut generation_config = serde_json::json!({ "maxOutputTokens": max_tokens });
    if thinking {
        generation_config["thinkingConfig"] = serde_json::json!({
            "thinkingBudget": options.thinking_budget,
            "includeThoughts": true,
        });
    }

    let mut body = serde_json::json!({});
    match (kind, system) {
        // Image models reject systemInstruction.
        (RequestKind::Image, Some(system)) => fold_system_text(&system, &mut contents),
        (_, Some(system)) => {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
        },
        (_, None) => {},
    }
    if kind == RequestKind::Image {
        generation_config["responseModalities"] = serde_json::json!(["TEXT", "IMAGE"]);
    }
    if !tools.is_empty() {
        body["tools"] = to_gemini_tools(tools);
    }
    body["contents"] = Value::Array(contents);
    body["generationConfig"] = generation_config;
    body
}

/// Fold system text into the first message. Merged into its leading text
/// part when there is one, otherwise inserted at the front, so any image
/// parts stay after the instruction and attached to their message.
fn fold_system_text(system: &str, contents: &mut Vec<Value>) {
    let Some(parts) = contents
        .first_mut()
        .and_then(|c| c["parts"].as_array_mut())
    else {
        contents.push(serde_json::json!({"role": "user", "parts": [{"text": system}]}));
        return;
    };
    match parts.first_mut() {
        Some(first) if first["text"].is_string() => {
            let merged = format!("{system}\n\n{}", first["text"].as_str().unwrap_or(""));
            first["text"] = Value::String(merged);
        },
        _ => parts.insert(0, serde_json::json!({"text": system})),
    }
}

fn to_gemini_tools(tools: &[ToolDefinition]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "parameters": convert_json_schema_types(&t.parameters),
            })
        })
        .collect();
    serde_json::json!([{ "functionDeclarations": declarations }])
}

/// Upper-case JSON Schema `type` names (`object` → `OBJECT`) through nested
/// `properties` and `items`.
fn convert_json_schema_types(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(key, value)| {
                    let converted = match (key.as_str(), value) {
                        ("type", Value::String(t)) => Value::String(t.to_uppercase()),
                        ("properties", Value::Object(props)) => Value::Object(
                            props
                                .iter()
                                .map(|(k, v)| (k.clone(), convert_json_schema_types(v)))
                                .collect(),
                        ),
                        ("items", _) => convert_json_schema_types(value),
                        _ => value.clone(),
                    };
                    (key.clone(), converted)
                })
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(convert_json_schema_types).collect()),
        _ => schema.clone(),
    }
}

/// Convert the conversation to Gemini `contents` (roles `user` / `model`).
fn to_gemini_contents(messages: &[ChatMessage]) -> Vec<Value> {
    non_system(messages)
        .filter_map(|msg| {
            let parts: Vec<Value> = msg.parts.iter().flat_map(to_gemini_parts).collect();
            if parts.is_empty() {
                return None;
            }
            let role = match msg.role() {
                Role::Assistant => "model",
                _ => "user",
            };
            Some(serde_json::json!({"role": role, "parts": parts}))
        })
        .collect()
}

fn inline_data(media_type: &str, data: &str) -> Value {
    serde_json::json!({"inlineData": {"mimeType": media_type, "data": data}})
}

/// Echo a call id Gemini issued. Ids we synthesized never reach the wire.
fn set_vendor_id(target: &mut Value, call_id: &str) {
    if !call_id.is_empty() && !is_synthetic_tool_call_id(call_id) {
        target["id"] = Value::String(call_id.to_string());
    }
}

/// Thinking never goes back to Gemini: its thoughts are display-only and
/// other vendors' signatures mean nothing to it.
fn to_gemini_parts(part: &ContentPart) -> Vec<Value> {
    match part {
        ContentPart::Text { text } if !text.is_empty() => vec![serde_json::json!({"text": text})],
        ContentPart::Text { .. } | ContentPart::Thinking(_) => vec![],
        ContentPart::Image(img) => vec![inline_data(&img.media_type, &img.base64_data)],
        ContentPart::ToolUse {
            call_id,
            tool_name,
            arguments,
            thought_signature,
        } => {
            let mut call = serde_json::json!({
                "functionCall": {"name": tool_name, "args": arguments},
            });
            set_vendor_id(&mut call["functionCall"], call_id);
            if let Some(signature) = thought_signature {
                call["thoughtSignature"] = Value::String(signature.clone());
            }
            vec![call]
        },
        ContentPart::ToolResult {
            call_id,
            tool_name,
            success,
            text,
            image,
        } => {
            let content = text.clone().unwrap_or_default();
            let response = if *success {
                serde_json::json!({"content": content})
            } else {
                serde_json::json!({"error": content})
            };
            let mut function_response = serde_json::json!({
                "functionResponse": {"name": tool_name, "response": response},
            });
            set_vendor_id(&mut function_response["functionResponse"], call_id);
            let mut parts = vec![function_response];
            if let Some(img) = image {
                parts.push(inline_data(&img.media_type, &img.base64_data));
            }
            parts
        },
    }
}

fn parse_part(part: &Value) -> Option<ContentPart> {
    if let Some(call) = part.get("functionCall") {
        let id = call["id"].as_str().unwrap_or("");
        let arguments = match &call["args"] {
            Value::Null => serde_json::json!({}),
            args => args.clone(),
        };
        return Some(ContentPart::ToolUse {
            call_id: if id.is_empty() {
                new_synthetic_tool_call_id()
            } else {
                id.to_string()
            },
            tool_name: call["name"].as_str().unwrap_or("").to_string(),
            arguments,
            thought_signature: part["thoughtSignature"].as_str().map(str::to_string),
        });
    }
    if let Some(data) = part.get("inlineData") {
        return Some(ContentPart::image(
            data["mimeType"].as_str().unwrap_or("image/png"),
            data["data"].as_str().unwrap_or(""),
        ));
    }
    let text = part["text"].as_str()?;
    if part["thought"].as_bool() == Some(true) {
        return Some(ContentPart::Thinking(ThinkingPart::ephemeral(text)));
    }
    Some(ContentPart::text(text))
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

/// Finish reasons for a candidate withheld by a content filter.
fn is_content_block(reason: &str) -> bool {
    matches!(
        reason,
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII" | "IMAGE_SAFETY"
    )
}

fn parse_response(resp: &Value) -> Result<ModelResponse, AdapterError> {
    let candidate = &resp["candidates"][0];
    if candidate.is_null()
        && let Some(reason) = resp["promptFeedback"]["blockReason"].as_str()
    {
        return Err(AdapterError::Decode(format!("prompt blocked: {reason}")));
    }
    let finish_reason = candidate["finishReason"].as_str().unwrap_or("");
    if is_content_block(finish_reason) {
        return Err(AdapterError::Decode(format!("response blocked: {finish_reason}")));
    }

    let parts: Vec<ContentPart> = candidate["content"]["parts"]
        .as_array()
        .map(|parts| parts.iter().filter_map(parse_part).collect())
        .unwrap_or_default();

    let meta = &resp["usageMetadata"];
    let usage = TokenUsage {
        cache_read_tokens: count(&meta["cachedContentTokenCount"]),
        reasoning_tokens: count(&meta["thoughtsTokenCount"]),
        ..TokenUsage::from_counts(
            count(&meta["promptTokenCount"]),
            count(&meta["candidatesTokenCount"]).saturating_add(count(&meta["thoughtsTokenCount"])),
            optional_count(&meta["totalTokenCount"]),
        )
    };

    Ok(ModelResponse::from_parts(
        parts,
        map_finish_reason(finish_reason),
        usage,
    ))
}
