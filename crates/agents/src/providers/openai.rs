use {
    async_trait::async_trait,
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    secrecy::ExposeSecret,
    serde_json::Value,
};

use tracing::{debug, trace, warn};

use crate::{
    error::AdapterError,
    model::{
        ChatMessage, ContentPart, ImageData, ModelResponse, Role, StopReason, TokenUsage,
        ToolDefinition, join_text,
    },
};

use super::{
    ProviderAdapter, ProviderId, ProviderSettings, RequestOptions, collect_system_text, count,
    last_input_image, new_synthetic_tool_call_id, non_system, optional_count, send_json,
};

pub struct OpenAiAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            base_url: settings.resolve_base_url(ProviderId::OpenAi),
            client: settings.build_client(),
        }
    }

    async fn try_send(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &RequestOptions,
        with_reasoning: bool,
    ) -> Result<ModelResponse, AdapterError> {
        let body = build_request_body(messages, tools, options, with_reasoning);

        debug!(
            model = %options.model,
            messages_count = body["messages"].as_array().map_or(0, Vec::len),
            tools_count = tools.len(),
            reasoning_effort = body["reasoning_effort"].as_str().unwrap_or("none"),
            "openai chat request"
        );
        trace!(body = %body, "openai request body");

        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(options.api_key.expose_secret())
            .json(&body);

        let resp = send_json(request, ProviderId::OpenAi).await?;
        trace!(response = %resp, "openai raw response");

        Ok(parse_response(&resp))
    }

    /// Generate an image, or edit the most recent input image when the
    /// conversation carries one.
    async fn try_send_image(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
    ) -> Result<ModelResponse, AdapterError> {
        let prompt = image_prompt(messages);
        if prompt.is_empty() {
            return Err(AdapterError::InvalidRequest(
                "image request needs a text prompt".into(),
            ));
        }

        let request = match last_input_image(messages) {
            Some(image) => {
                debug!(
                    model = %options.model,
                    media_type = %image.media_type,
                    "openai image edit request"
                );
                let bytes = BASE64
                    .decode(image.base64_data.as_bytes())
                    .map_err(|e| AdapterError::InvalidRequest(format!("input image: {e}")))?;
                let image_part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(format!("image.{}", extension_for(&image.media_type)))
                    .mime_str(&image.media_type)?;
                let form = reqwest::multipart::Form::new()
                    .text("model", options.model.clone())
                    .text("prompt", prompt)
                    .text("n", "1")
                    .part("image", image_part);
                self.client
                    .post(format!("{}/v1/images/edits", self.base_url))
                    .bearer_auth(options.api_key.expose_secret())
                    .multipart(form)
            },
            None => {
                debug!(model = %options.model, "openai image generation request");
                let mut body = serde_json::json!({
                    "model": options.model,
                    "prompt": prompt,
                    "n": 1,
                });
                // dall-e models return URLs unless asked otherwise.
                if options.model.starts_with("dall-e") {
                    body["response_format"] = Value::String("b64_json".into());
                }
                self.client
                    .post(format!("{}/v1/images/generations", self.base_url))
                    .bearer_auth(options.api_key.expose_secret())
                    .json(&body)
            },
        };

        let resp = send_json(request, ProviderId::OpenAi).await?;
        parse_image_response(&resp)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn supports_image_output(&self) -> bool {
        true
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
        messages: &[ChatMessage],
        options: &RequestOptions,
    ) -> ModelResponse {
        self.try_send_image(messages, options)
            .await
            .unwrap_or_else(Into::into)
    }
}

/// Map a token budget onto OpenAI's coarse reasoning levels.
fn reasoning_effort(budget: u32) -> &'static str {
    match budget {
        0..=2048 => "low",
        2049..=8192 => "medium",
        _ => "high",
    }
}

fn build_request_body(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    options: &RequestOptions,
    with_reasoning: bool,
) -> Value {
    let reasoning = with_reasoning && options.thinking_budget > 0;
    let max_tokens = if reasoning {
        options.effective_max_tokens()
    } else {
        options.max_tokens
    };

    let mut body = serde_json::json!({
        "model": options.model,
        "max_completion_tokens": max_tokens,
        "messages": to_openai_messages(messages),
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(to_openai_tools(tools));
    }
    if reasoning {
        body["reasoning_effort"] = Value::String(reasoning_effort(options.thinking_budget).into());
    }
    body
}

fn to_openai_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn image_url_part(image: &ImageData) -> Value {
    serde_json::json!({
        "type": "image_url",
        "image_url": {"url": image.data_url()},
    })
}

/// Convert the conversation to Chat Completions `messages`.
///
/// - all system text becomes one leading `system` message
/// - each `tool_result` part becomes a `tool` message right after the
///   assistant turn; result images follow in a `user` message because tool
///   messages cannot carry images
/// - `tool_use` parts become `tool_calls` with JSON-string arguments
/// - thinking parts are not sent
fn to_openai_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(system) = collect_system_text(messages) {
        out.push(serde_json::json!({"role": "system", "content": system}));
    }

    for msg in non_system(messages) {
        match msg.role() {
            Role::Assistant => {
                if let Some(assistant) = to_assistant_message(&msg.parts) {
                    out.push(assistant);
                }
            },
            _ => push_user_message(&msg.parts, &mut out),
        }
    }
    out
}

fn to_assistant_message(parts: &[ContentPart]) -> Option<Value> {
    let text = join_text(parts);
    let tool_calls: Vec<Value> = parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolUse {
                call_id,
                tool_name,
                arguments,
                ..
            } => Some(serde_json::json!({
                "id": call_id,
                "type": "function",
                "function": {
                    "name": tool_name,
                    "arguments": arguments.to_string(),
                }
            })),
            _ => None,
        })
        .collect();

    if text.is_none() && tool_calls.is_empty() {
        return None;
    }
    let mut msg = serde_json::json!({
        "role": "assistant",
        "content": text,
    });
    if !tool_calls.is_empty() {
        msg["tool_calls"] = Value::Array(tool_calls);
    }
    Some(msg)
}

fn push_user_message(parts: &[ContentPart], out: &mut Vec<Value>) {
    let mut content = Vec::new();
    let mut result_images = Vec::new();

    for part in parts {
        match part {
            ContentPart::Text { text } => {
                content.push(serde_json::json!({"type": "text", "text": text}));
            },
            ContentPart::Image(img) => content.push(image_url_part(img)),
            ContentPart::ToolResult {
                call_id,
                tool_name,
                success,
                text,
                image,
            } => {
                let body = text.clone().unwrap_or_default();
                let body = if *success {
                    body
                } else {
                    format!("Error: {body}")
                };
                out.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": body,
                }));
                if let Some(img) = image {
                    result_images.push(serde_json::json!({
                        "type": "text",
                        "text": format!("Image returned by {tool_name} ({call_id}):"),
                    }));
                    result_images.push(image_url_part(img));
                }
            },
            ContentPart::ToolUse { .. } | ContentPart::Thinking(_) => {},
        }
    }

    content.extend(result_images);
    if !content.is_empty() {
        out.push(serde_json::json!({"role": "user", "content": content}));
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

fn parse_tool_call(tc: &Value) -> ContentPart {
    let raw_args = tc["function"]["arguments"].as_str().unwrap_or("{}");
    let arguments = serde_json::from_str(raw_args).unwrap_or_else(|e| {
        warn!(error = %e, arguments = %raw_args, "unparseable tool call arguments");
        serde_json::json!({})
    });
    let id = tc["id"].as_str().unwrap_or("");
    ContentPart::ToolUse {
        call_id: if id.is_empty() {
            new_synthetic_tool_call_id()
        } else {
            id.to_string()
        },
        tool_name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
        arguments,
        thought_signature: None,
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        cache_read_tokens: count(&usage["prompt_tokens_details"]["cached_tokens"]),
        reasoning_tokens: count(&usage["completion_tokens_details"]["reasoning_tokens"]),
        ..TokenUsage::from_counts(
            count(&usage["prompt_tokens"]),
            count(&usage["completion_tokens"]),
            optional_count(&usage["total_tokens"]),
        )
    }
}

fn parse_response(resp: &Value) -> ModelResponse {
    let choice = &resp["choices"][0];
    let message = &choice["message"];

    let mut parts = Vec::new();
    if let Some(text) = message["content"].as_str()
        && !text.is_empty()
    {
        parts.push(ContentPart::text(text));
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        parts.extend(tool_calls.iter().map(parse_tool_call));
    }

    ModelResponse::from_parts(
        parts,
        map_finish_reason(choice["finish_reason"].as_str().unwrap_or("")),
        parse_usage(&resp["usage"]),
    )
}

fn parse_image_response(resp: &Value) -> Result<ModelResponse, AdapterError> {
    let entry = &resp["data"][0];
    let b64 = entry["b64_json"]
        .as_str()
        .ok_or_else(|| AdapterError::Decode("image response has no b64_json data".into()))?;

    let mut parts = Vec::new();
    if let Some(revised) = entry["revised_prompt"].as_str() {
        parts.push(ContentPart::text(revised));
    }
    parts.push(ContentPart::image("image/png", b64));

    let usage = TokenUsage::from_counts(
        count(&resp["usage"]["input_tokens"]),
        count(&resp["usage"]["output_tokens"]),
        optional_count(&resp["usage"]["total_tokens"]),
    );
    Ok(ModelResponse::from_parts(parts, StopReason::EndTurn, usage))
}

/// Prompt for image endpoints: system text, then the latest user text.
fn image_prompt(messages: &[ChatMessage]) -> String {
    let user_text = messages
        .iter()
        .rev()
        .filter(|m| m.role() == Role::User)
        .find_map(ChatMessage::text)
        .unwrap_or_default();
    match collect_system_text(messages) {
        Some(system) if !user_text.is_empty() => format!("{system}\n\n{user_text}"),
        Some(system) => system,
        None => user_text,
    }
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::{super::test_support::start_json_mock, *};

    fn options() -> RequestOptions {
        RequestOptions::new("gpt-4o", "sk-test").with_max_tokens(1000)
    }

    fn adapter(base_url: &str) -> OpenAiAdapter {
        OpenAiAdapter::new(ProviderSettings {
            base_url: Some(base_url.to_string()),
            timeout: None,
        })
    }

    fn tool_use(id: &str) -> ContentPart {
        ContentPart::ToolUse {
            call_id: id.into(),
            tool_name: "zone".into(),
            arguments: serde_json::json!({"area": [1, 2, 3, 4]}),
            thought_signature: None,
        }
    }

    #[test]
    fn reasoning_effort_levels() {
        assert_eq!(reasoning_effort(1), "low");
        assert_eq!(reasoning_effort(2048), "low");
        assert_eq!(reasoning_effort(2049), "medium");
        assert_eq!(reasoning_effort(8192), "medium");
        assert_eq!(reasoning_effort(8193), "high");
    }

    #[test]
    fn system_messages_merge_into_one() {
        let msgs = to_openai_messages(&[
            ChatMessage::system("A"),
            ChatMessage::user("hi"),
            ChatMessage::system("B"),
        ]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "A\n\nB");
        assert_eq!(msgs[1]["content"][0]["text"], "hi");
    }

    #[test]
    fn tool_round_trip_encoding() {
        let msgs = to_openai_messages(&[
            ChatMessage::user("zone it"),
            ChatMessage::assistant(vec![
                ContentPart::Thinking(crate::model::ThinkingPart::ephemeral("hmm")),
                ContentPart::text("Zoning."),
                tool_use("call_a"),
                tool_use("call_b"),
            ]),
            ChatMessage::new(
                Role::User,
                vec![
                    ContentPart::ToolResult {
                        call_id: "call_a".into(),
                        tool_name: "zone".into(),
                        success: true,
                        text: Some("ok".into()),
                        image: Some(ImageData::new("image/png", "QUJD")),
                    },
                    ContentPart::ToolResult {
                        call_id: "call_b".into(),
                        tool_name: "zone".into(),
                        success: false,
                        text: Some("overlap".into()),
                        image: None,
                    },
                ],
            ),
        ]);

        assert_eq!(msgs.len(), 5);
        let assistant = &msgs[1];
        assert_eq!(assistant["content"], "Zoning.");
        assert_eq!(assistant["tool_calls"][0]["id"], "call_a");
        let args: Value =
            serde_json::from_str(
                assistant["tool_calls"][0]["function"]["arguments"]
                    .as_str()
                    .unwrap()
            )
                .unwrap();
        assert_eq!(args, serde_json::json!({"area": [1, 2, 3, 4]}));

        assert_eq!(msgs[2]["role"], "tool");
        assert_eq!(msgs[2]["tool_call_id"], "call_a");
        assert_eq!(msgs[2]["content"], "ok");
        assert_eq!(msgs[3]["tool_call_id"], "call_b");
        assert_eq!(msgs[3]["content"], "Error: overlap");

        assert_eq!(msgs[4]["role"], "user");
        assert_eq!(
            msgs[4]["content"][1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
    }

    #[test]
    fn thinking_only_assistant_message_is_dropped() {
        let msgs = to_openai_messages(&[ChatMessage::assistant(vec![ContentPart::Thinking(
            crate::model::ThinkingPart::signed("x", Some("s".into())),
        )])]);
        assert!(msgs.is_empty());
    }

    #[test]
    fn body_sets_reasoning_only_for_tool_requests() {
        let opts = options().with_thinking_budget(4000);
        let body = build_request_body(&[ChatMessage::user("x")], &[], &opts, true);
        assert_eq!(body["reasoning_effort"], "medium");
        assert_eq!(body["max_completion_tokens"], 5024);

        let body = build_request_body(&[ChatMessage::user("x")], &[], &opts, false);
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(body["max_completion_tokens"], 1000);
    }

    #[test]
    fn parse_tool_calls_and_usage() {
        let resp = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "zone", "arguments": "{\"a\":1}"}},
                        {"id": "", "type": "function", "function": {"name": "dig", "arguments": "not json"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 40,
                "completion_tokens": 10,
                "total_tokens": 55,
                "prompt_tokens_details": {"cached_tokens": 32},
                "completion_tokens_details": {"reasoning_tokens": 5}
            }
        });
        let parsed = parse_response(&resp);
        assert_eq!(parsed.stop_reason, StopReason::ToolUse);
        assert_eq!(parsed.tool_calls.len(), 2);
        assert_eq!(parsed.tool_calls[0].arguments["a"], 1);
        assert!(parsed.tool_calls[1].id.starts_with("call_"));
        assert_eq!(parsed.tool_calls[1].arguments, serde_json::json!({}));
        assert!(parsed.text_content.is_none());
        assert_eq!(parsed.usage.input_tokens, 40);
        assert_eq!(parsed.usage.output_tokens, 15);
        assert_eq!(parsed.usage.total(), 55);
        assert_eq!(parsed.usage.cache_read_tokens, 32);
        assert_eq!(parsed.usage.reasoning_tokens, 5);
    }

    #[test]
    fn length_with_tool_calls_is_max_tokens() {
        let resp = serde_json::json!({
            "choices": [{
                "message": {
                    "content": "partial",
                    "tool_calls": [{"id": "call_1", "function": {"name": "zone", "arguments": "{\"a\""}}]
                },
                "finish_reason": "length"
            }]
        });
        let parsed = parse_response(&resp);
        assert_eq!(parsed.stop_reason, StopReason::MaxTokens);
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.usage, TokenUsage::default());
    }

    #[test]
    fn missing_fields_parse_to_empty_success() {
        let parsed = parse_response(&serde_json::json!({}));
        assert!(parsed.success);
        assert_eq!(parsed.stop_reason, StopReason::EndTurn);
        assert!(parsed.assistant_parts.is_empty());
    }

    #[tokio::test]
    async fn chat_request_against_mock() {
        let (base_url, captured) = start_json_mock(
            "/v1/chat/completions",
            serde_json::json!({
                "choices": [{"message": {"content": "Hello"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
            }),
        )
        .await;

        let resp = adapter(&base_url)
            .send_chat_request(&[ChatMessage::user("hi")], &options())
            .await;
        assert!(resp.success, "{:?}", resp.error_message);
        assert_eq!(resp.text_content.as_deref(), Some("Hello"));

        let reqs = captured.lock().unwrap();
        assert_eq!(reqs[0].header("authorization"), Some("Bearer sk-test"));
        let body = reqs[0].body.as_ref().unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(body["max_completion_tokens"], 1000);
    }

    #[tokio::test]
    async fn image_generation_uses_json_endpoint() {
        let (base_url, captured) = start_json_mock(
            "/v1/images/generations",
            serde_json::json!({"data": [{"b64_json": "UE5H", "revised_prompt": "a fort"}]}),
        )
        .await;

        let resp = adapter(&base_url)
            .send_image_request(
                &[ChatMessage::system("pixel art"), ChatMessage::user("a fort")],
                &RequestOptions::new("gpt-image-1", "sk-test"),
            )
            .await;
        assert!(resp.success, "{:?}", resp.error_message);
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert!(
            resp.assistant_parts
                .contains(&ContentPart::image("image/png", "UE5H"))
        );

        let reqs = captured.lock().unwrap();
        let body = reqs[0].body.as_ref().unwrap();
        assert_eq!(body["prompt"], "pixel art\n\na fort");
        assert!(body.get("response_format").is_none());
    }

    #[tokio::test]
    async fn image_edit_uses_multipart() {
        let (base_url, captured) = start_json_mock(
            "/v1/images/edits",
            serde_json::json!({"data": [{"b64_json": "RURJVA=="}]}),
        )
        .await;

        let messages = vec![ChatMessage::new(
            Role::User,
            vec![
                ContentPart::text("add a moat"),
                ContentPart::image("image/png", BASE64.encode(b"PNGDATA")),
            ],
        )];
        let resp = adapter(&base_url)
            .send_image_request(&messages, &RequestOptions::new("gpt-image-1", "sk-test"))
            .await;
        assert!(resp.success, "{:?}", resp.error_message);

        let reqs = captured.lock().unwrap();
        assert!(reqs[0].content_type.starts_with("multipart/form-data"));
        let raw = String::from_utf8_lossy(&reqs[0].raw);
        assert!(raw.contains("add a moat"));
        assert!(raw.contains("PNGDATA"));
        assert!(raw.contains("filename=\"image.png\""));
    }

    #[tokio::test]
    async fn image_edit_rejects_bad_base64() {
        let messages = vec![ChatMessage::new(
            Role::User,
            vec![ContentPart::text("edit"), ContentPart::image("image/png", "!!!")],
        )];
        let resp = adapter("http://127.0.0.1:1")
            .send_image_request(&messages, &options())
            .await;
        assert!(!resp.success);
        assert!(resp.error_message.unwrap().contains("invalid request"));
    }
}
