//! Provider-agnostic conversation model.
//!
//! Every adapter translates to and from these types; nothing here knows about
//! any vendor's wire format.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Base64-encoded image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub media_type: String,
    pub base64_data: String,
}

impl ImageData {
    pub fn new(media_type: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            base64_data: base64_data.into(),
        }
    }

    /// `data:` URL form used by OpenAI-style image inputs.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.base64_data)
    }
}

/// A reasoning trace emitted by the model.
///
/// `signature` and `redacted_data` are opaque vendor blobs: they are stored
/// and replayed verbatim, never inspected. Ephemeral parts are display-only
/// and adapters must never send them back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingPart {
    pub text: Option<String>,
    pub signature: Option<String>,
    pub redacted_data: Option<String>,
    pub is_redacted: bool,
    pub is_ephemeral: bool,
}

impl ThinkingPart {
    pub fn signed(text: impl Into<String>, signature: Option<String>) -> Self {
        Self {
            text: Some(text.into()),
            signature,
            ..Default::default()
        }
    }

    pub fn redacted(data: impl Into<String>) -> Self {
        Self {
            redacted_data: Some(data.into()),
            is_redacted: true,
            ..Default::default()
        }
    }

    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            is_ephemeral: true,
            ..Default::default()
        }
    }
}

/// One typed unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image(ImageData),
    ToolUse {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
        /// Opaque signature Gemini requires echoed with the call.
        thought_signature: Option<String>,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        success: bool,
        text: Option<String>,
        image: Option<ImageData>,
    },
    Thinking(ThinkingPart),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self::Image(ImageData::new(media_type, base64_data))
    }

    /// The call this part requests, if it is a `tool_use` part.
    pub fn as_tool_call(&self) -> Option<ToolCall> {
        match self {
            Self::ToolUse {
                call_id,
                tool_name,
                arguments,
                ..
            } => Some(ToolCall {
                id: call_id.clone(),
                name: tool_name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        }
    }
}

/// A message in the conversation. The role is fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    role: Role,
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    /// Fold tool results into one user message, preserving their order.
    pub fn tool_results(results: &[ToolResult]) -> Self {
        Self::new(
            Role::User,
            results.iter().map(ToolResult::to_content_part).collect(),
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Concatenated text of all `text` parts, if any.
    pub fn text(&self) -> Option<String> {
        join_text(&self.parts)
    }

    pub fn has_image(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::Image(_)))
    }
}

pub(crate) fn join_text(parts: &[ContentPart]) -> Option<String> {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .fold(None, |acc: Option<String>, text| {
            Some(match acc {
                Some(existing) => existing + text,
                None => text.to_string(),
            })
        })
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub content: String,
    pub image: Option<ImageData>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            content: content.into(),
            image: None,
        }
    }

    pub fn failure(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(call, message)
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }

    pub fn to_content_part(&self) -> ContentPart {
        ContentPart::ToolResult {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            success: self.success,
            text: (!self.content.is_empty()).then(|| self.content.clone()),
            image: self.image.clone(),
        }
    }
}

/// Canonical termination cause of one model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

/// Token counts for one request. Absent vendor fields are 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub reasoning_tokens: u32,
}

impl TokenUsage {
    /// Build from vendor counts. When the vendor reports a total, output is
    /// derived from it so `input + output == total` holds exactly.
    pub fn from_counts(input: u32, output: u32, total: Option<u32>) -> Self {
        let output_tokens = match total {
            Some(total) if total >= input => total - input,
            _ => output,
        };
        Self {
            input_tokens: input,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(rhs.cache_read_tokens);
        self.reasoning_tokens = self.reasoning_tokens.saturating_add(rhs.reasoning_tokens);
    }
}

/// Normalized result of one adapter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub text_content: Option<String>,
    pub stop_reason: StopReason,
    pub tool_calls: Vec<ToolCall>,
    pub assistant_parts: Vec<ContentPart>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    /// Failed response; newlines in the message are flattened to spaces.
    pub fn failure(message: impl Into<String>) -> Self {
        let message: String = message.into();
        let flat = message
            .split(['\r', '\n'])
            .filter(|line| !line.trim().is_empty())
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            success: false,
            error_message: Some(flat),
            text_content: None,
            stop_reason: StopReason::Error,
            tool_calls: Vec::new(),
            assistant_parts: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    /// Successful response built from parsed assistant parts.
    ///
    /// `vendor_stop` is the adapter's mapping of the vendor finish reason. The
    /// result satisfies `stop_reason == ToolUse` iff `tool_calls` is
    /// non-empty; on length truncation the partial tool calls are dropped.
    pub fn from_parts(
        mut parts: Vec<ContentPart>,
        vendor_stop: StopReason,
        usage: TokenUsage,
    ) -> Self {
        if vendor_stop == StopReason::MaxTokens {
            parts.retain(|p| !matches!(p, ContentPart::ToolUse { .. }));
        }
        let tool_calls: Vec<ToolCall> = parts
            .iter()
            .filter_map(ContentPart::as_tool_call)
            .collect();
        let stop_reason = if !tool_calls.is_empty() {
            StopReason::ToolUse
        } else if vendor_stop == StopReason::ToolUse {
            StopReason::EndTurn
        } else {
            vendor_stop
        };
        Self {
            success: true,
            error_message: None,
            text_content: join_text(&parts),
            stop_reason,
            tool_calls,
            assistant_parts: parts,
            usage,
        }
    }
}
