pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    relay_config::{AgentConfig, RelayConfig},
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{
    error::AdapterError,
    model::{ChatMessage, ContentPart, ImageData, ModelResponse, Role, ToolDefinition},
};

pub use {anthropic::AnthropicAdapter, gemini::GeminiAdapter, openai::OpenAiAdapter};

/// Minimum visible-output allowance kept on top of a thinking budget.
pub const THINKING_OUTPUT_RESERVE: u32 = 1024;

/// Keep synthetic tool-call IDs OpenAI-compatible (`maxLength: 40`).
const SYNTHETIC_TOOL_CALL_ID_MAX_LEN: usize = 40;
const SYNTHETIC_TOOL_CALL_ID_PREFIX: &str = "call_";

/// Known Anthropic Claude models. Current models listed first.
const ANTHROPIC_MODELS: &[&str] = &[
    "claude-opus-4-5-20251101",
    "claude-sonnet-4-5-20250929",
    "claude-haiku-4-5-20251001",
    "claude-opus-4-1-20250805",
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-3-haiku-20240307",
];

const OPENAI_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "gpt-4.1-mini",
    "o3",
    "o3-mini",
    "o4-mini",
    "gpt-image-1",
];

const GEMINI_MODELS: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
    "gemini-2.5-flash-image-preview",
];

/// Identity of a supported vendor. Closed set; adapters are resolved by this
/// value, never by inspecting the adapter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    Anthropic,
    OpenAi,
    Gemini,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [Self::Anthropic, Self::OpenAi, Self::Gemini];

    /// Config key for this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAi => "https://api.openai.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
        }
    }

    /// Static model catalog, most capable first.
    pub fn models(&self) -> &'static [&'static str] {
        match self {
            Self::Anthropic => ANTHROPIC_MODELS,
            Self::OpenAi => OPENAI_MODELS,
            Self::Gemini => GEMINI_MODELS,
        }
    }

    pub fn default_model(&self) -> &'static str {
        self.models().first().copied().unwrap_or_default()
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// Per-request values supplied by the caller. The core never sources or
/// validates credentials; the key is passed through as an opaque secret.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub model: String,
    pub api_key: Secret<String>,
    pub max_tokens: u32,
    /// Reasoning budget in tokens; 0 disables thinking.
    pub thinking_budget: u32,
}

impl RequestOptions {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let defaults = AgentConfig::default();
        Self::from_agent_config(model, api_key, &defaults)
    }

    pub fn from_agent_config(
        model: impl Into<String>,
        api_key: impl Into<String>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            model: model.into(),
            api_key: Secret::new(api_key.into()),
            max_tokens: config.max_tokens,
            thinking_budget: config.thinking_budget,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_thinking_budget(mut self, budget: u32) -> Self {
        self.thinking_budget = budget;
        self
    }

    /// `max_tokens`, raised so a thinking budget never starves visible output.
    pub fn effective_max_tokens(&self) -> u32 {
        if self.thinking_budget == 0 {
            return self.max_tokens;
        }
        self.max_tokens
            .max(self.thinking_budget.saturating_add(THINKING_OUTPUT_RESERVE))
    }
}

/// Vendor adapter capability.
///
/// Implementations never fail with `Err`: transport errors, non-2xx statuses
/// and unsupported operations all come back as a failed [`ModelResponse`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    fn supports_image_output(&self) -> bool;

    /// Single-shot request without a tool catalog. The thinking budget is
    /// not applied.
    async fn send_chat_request(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
    ) -> ModelResponse;

    async fn send_tool_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &RequestOptions,
    ) -> ModelResponse;

    async fn send_image_request(
        &self,
        messages: &[ChatMessage],
        options: &RequestOptions,
    ) -> ModelResponse;

    fn list_available_models(&self) -> Vec<String> {
        self.id().models().iter().map(|m| m.to_string()).collect()
    }
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    /// HTTP client timeout; `None` leaves reqwest's default (no timeout).
    pub timeout: Option<Duration>,
}

impl ProviderSettings {
    pub(crate) fn resolve_base_url(&self, id: ProviderId) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(id.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    pub(crate) fn build_client(&self) -> reqwest::Client {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "failed to build HTTP client, using defaults");
            reqwest::Client::new()
        })
    }
}

/// Lazily builds and caches one adapter per provider.
///
/// Adapters carry no per-call state, so a cached instance is shared by every
/// concurrent run.
pub struct ProviderRegistry {
    settings: HashMap<ProviderId, ProviderSettings>,
    disabled: HashSet<ProviderId>,
    adapters: Mutex<HashMap<ProviderId, Arc<dyn ProviderAdapter>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            settings: HashMap::new(),
            disabled: HashSet::new(),
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Registry honoring per-provider base URLs, the enabled flag and the
    /// request timeout from config.
    pub fn from_config(config: &RelayConfig) -> Self {
        let timeout = (config.agent.request_timeout_secs > 0)
            .then(|| Duration::from_secs(config.agent.request_timeout_secs));
        let mut registry = Self::new();
        for id in ProviderId::ALL {
            if !config.providers.is_enabled(id.as_str()) {
                debug!(provider = %id, "provider disabled in config");
                registry.disabled.insert(id);
                continue;
            }
            let base_url = config
                .providers
                .get(id.as_str())
                .and_then(|e| e.base_url.clone());
            registry
                .settings
                .insert(id, ProviderSettings { base_url, timeout });
        }
        registry
    }

    pub fn with_settings(mut self, id: ProviderId, settings: ProviderSettings) -> Self {
        self.settings.insert(id, settings);
        self
    }

    /// Install a pre-built adapter (e.g. a test fake) under its own id.
    pub fn with_adapter(self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let id = adapter.id();
        self.lock_adapters().insert(id, adapter);
        self
    }

    pub fn is_enabled(&self, id: ProviderId) -> bool {
        !self.disabled.contains(&id)
    }

    /// Adapter for `id`, constructed on first use. `None` if the provider is
    /// disabled.
    pub fn get_adapter(&self, id: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        if !self.is_enabled(id) {
            return None;
        }
        let mut adapters = self.lock_adapters();
        let adapter = adapters.entry(id).or_insert_with(|| -> Arc<dyn ProviderAdapter> {
            let settings = self.settings.get(&id).cloned().unwrap_or_default();
            debug!(provider = %id, base_url = ?settings.base_url, "creating provider adapter");
            match id {
                ProviderId::Anthropic => Arc::new(AnthropicAdapter::new(settings)),
                ProviderId::OpenAi => Arc::new(OpenAiAdapter::new(settings)),
                ProviderId::Gemini => Arc::new(GeminiAdapter::new(settings)),
            }
        });
        Some(Arc::clone(adapter))
    }

    fn lock_adapters(&self) -> MutexGuard<'_, HashMap<ProviderId, Arc<dyn ProviderAdapter>>> {
        self.adapters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Shared adapter helpers ──────────────────────────────────────────────

pub(crate) fn new_synthetic_tool_call_id() -> String {
    let mut id = format!(
        "{SYNTHETIC_TOOL_CALL_ID_PREFIX}{}",
        uuid::Uuid::new_v4().simple()
    );
    id.truncate(SYNTHETIC_TOOL_CALL_ID_MAX_LEN);
    id
}

/// Whether `id` was minted by [`new_synthetic_tool_call_id`] rather than
/// issued by a vendor.
pub(crate) fn is_synthetic_tool_call_id(id: &str) -> bool {
    id.strip_prefix(SYNTHETIC_TOOL_CALL_ID_PREFIX)
        .is_some_and(|rest| rest.len() == 32 && rest.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// All system-role text, in order, joined by blank lines.
pub(crate) fn collect_system_text(messages: &[ChatMessage]) -> Option<String> {
    let texts: Vec<String> = messages
        .iter()
        .filter(|m| m.role() == Role::System)
        .filter_map(ChatMessage::text)
        .filter(|t| !t.is_empty())
        .collect();
    (!texts.is_empty()).then(|| texts.join("\n\n"))
}

/// The conversation without its system messages.
///
/// No vendor takes images on its system channel, so images carried by
/// system messages are moved to the front of the first user message (or
/// into a user message of their own when there is none).
pub(crate) fn non_system(
    messages: &[ChatMessage],
) -> impl Iterator<Item = Cow<'_, ChatMessage>> {
    let system_images: Vec<ContentPart> = messages
        .iter()
        .filter(|m| m.role() == Role::System)
        .flat_map(|m| m.parts.iter())
        .filter(|p| matches!(p, ContentPart::Image(_)))
        .cloned()
        .collect();
    let mut pending = (!system_images.is_empty()).then_some(system_images);

    let mut out = Vec::with_capacity(messages.len());
    for msg in messages.iter().filter(|m| m.role() != Role::System) {
        match pending.take() {
            Some(mut parts) if msg.role() == Role::User => {
                debug!(images = parts.len(), "moving system images into first user message");
                parts.extend(msg.parts.iter().cloned());
                out.push(Cow::Owned(ChatMessage::new(Role::User, parts)));
            },
            other => {
                pending = other;
                out.push(Cow::Borrowed(msg));
            },
        }
    }
    if let Some(parts) = pending {
        out.push(Cow::Owned(ChatMessage::new(Role::User, parts)));
    }
    out.into_iter()
}

/// Most recent image carried by a user message.
pub(crate) fn last_input_image(messages: &[ChatMessage]) -> Option<&ImageData> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role() == Role::User)
        .flat_map(|m| m.parts.iter().rev())
        .find_map(|p| match p {
            ContentPart::Image(img) => Some(img),
            _ => None,
        })
}

pub(crate) fn count(value: &serde_json::Value) -> u32 {
    value
        .as_u64()
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

pub(crate) fn optional_count(value: &serde_json::Value) -> Option<u32> {
    value.as_u64().map(|v| u32::try_from(v).unwrap_or(u32::MAX))
}

/// Send a prepared request and decode the JSON body, mapping non-2xx
/// statuses to [`AdapterError::Api`].
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    provider: ProviderId,
) -> Result<serde_json::Value, AdapterError> {
    let http_resp = request.send().await?;
    let status = http_resp.status();
    if !status.is_success() {
        let body_text = http_resp.text().await.unwrap_or_default();
        warn!(provider = %provider, status = %status, body = %body_text, "provider API error");
        return Err(AdapterError::Api {
            status: status.as_u16(),
            body: body_text,
        });
    }
    let text = http_resp.text().await?;
    serde_json::from_str(&text).map_err(|e| AdapterError::Decode(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-process vendor mock used by the adapter tests.

    use std::sync::{Arc, Mutex};

    use axum::{Router, extract::Request, http::StatusCode, routing::post};

    /// Captured request data for assertions.
    #[derive(Default, Clone, Debug)]
    pub struct CapturedRequest {
        pub path: String,
        pub headers: Vec<(String, String)>,
        pub content_type: String,
        pub body: Option<serde_json::Value>,
        pub raw: Vec<u8>,
    }

    impl CapturedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    pub type Captured = Arc<Mutex<Vec<CapturedRequest>>>;

    /// Start a mock server answering any POST under `path` with
    /// `(status, body)`. Returns (base_url, captured_requests).
    pub async fn start_mock(
        path: &str,
        status: StatusCode,
        response_body: String,
    ) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = Arc::clone(&captured);

        let app = Router::new().route(
            path,
            post(move |req: Request| {
                let cap = Arc::clone(&captured_clone);
                let resp = response_body.clone();
                async move {
                    let path = req.uri().path().to_string();
                    let headers: Vec<(String, String)> = req
                        .headers()
                        .iter()
                        .map(|(k, v)| {
                            (k.as_str().to_string(), v.to_str().unwrap_or("").to_string())
                        })
                        .collect();
                    let content_type = headers
                        .iter()
                        .find(|(k, _)| k == "content-type")
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default();

                    let body_bytes = axum::body::to_bytes(req.into_body(), 8 * 1024 * 1024)
                        .await
                        .unwrap_or_default();
                    let body: Option<serde_json::Value> = serde_json::from_slice(&body_bytes).ok();

                    cap.lock().unwrap().push(CapturedRequest {
                        path,
                        headers,
                        content_type,
                        body,
                        raw: body_bytes.to_vec(),
                    });

                    (status, [("content-type", "application/json")], resp)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), captured)
    }

    pub async fn start_json_mock(path: &str, response: serde_json::Value) -> (String, Captured) {
        start_mock(path, StatusCode::OK, response.to_string()).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAdapter;

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn id(&self) -> ProviderId {
            ProviderId::OpenAi
        }

        fn supports_image_output(&self) -> bool {
            false
        }

        async fn send_chat_request(&self, _: &[ChatMessage], _: &RequestOptions) -> ModelResponse {
            ModelResponse::failure("fake")
        }

        async fn send_tool_request(
            &self,
            _: &[ChatMessage],
            _: &[ToolDefinition],
            _: &RequestOptions,
        ) -> ModelResponse {
            ModelResponse::failure("fake")
        }

        async fn send_image_request(&self, _: &[ChatMessage], _: &RequestOptions) -> ModelResponse {
            ModelResponse::failure("fake")
        }
    }

    #[test]
    fn provider_id_round_trips_through_str() {
        for id in ProviderId::ALL {
            assert_eq!(id.as_str().parse::<ProviderId>().unwrap(), id);
            assert_eq!(id.to_string(), id.as_str());
        }
        assert_eq!("OpenAI".parse::<ProviderId>().unwrap(), ProviderId::OpenAi);
        assert!("mistral".parse::<ProviderId>().is_err());
    }

    #[test]
    fn provider_ids_match_config_names() {
        for id in ProviderId::ALL {
            assert!(relay_config::schema::KNOWN_PROVIDERS.contains(&id.as_str()));
        }
    }

    #[test]
    fn model_catalogs_not_empty_and_unique() {
        for id in ProviderId::ALL {
            let models = id.models();
            assert!(!models.is_empty(), "{id} has no models");
            let unique: HashSet<_> = models.iter().collect();
            assert_eq!(unique.len(), models.len(), "{id} has duplicate models");
            assert_eq!(id.default_model(), models[0]);
        }
    }

    #[test]
    fn thinking_budget_floor() {
        let opts = RequestOptions::new("m", "k").with_max_tokens(4096);
        assert_eq!(opts.effective_max_tokens(), 4096);

        let opts = opts.with_thinking_budget(8000);
        assert_eq!(opts.effective_max_tokens(), 9024);

        let opts = RequestOptions::new("m", "k")
            .with_max_tokens(20_000)
            .with_thinking_budget(1024);
        assert_eq!(opts.effective_max_tokens(), 20_000);
    }

    #[test]
    fn request_options_from_agent_config() {
        let cfg = AgentConfig {
            max_tokens: 1000,
            thinking_budget: 2000,
            ..Default::default()
        };
        let opts = RequestOptions::from_agent_config("claude-sonnet-4-20250514", "sk", &cfg);
        assert_eq!(opts.max_tokens, 1000);
        assert_eq!(opts.effective_max_tokens(), 3024);
        assert!(!format!("{opts:?}").contains("\"sk\""));
    }

    #[test]
    fn synthetic_ids_are_bounded_and_unique() {
        let a = new_synthetic_tool_call_id();
        let b = new_synthetic_tool_call_id();
        assert!(a.starts_with("call_"));
        assert!(a.len() <= SYNTHETIC_TOOL_CALL_ID_MAX_LEN);
        assert_ne!(a, b);
        assert!(is_synthetic_tool_call_id(&a));
        assert!(!is_synthetic_tool_call_id("fc-123"));
        assert!(!is_synthetic_tool_call_id("call_abc123"));
        assert!(!is_synthetic_tool_call_id("toolu_01A09q90qw90lq917835lq9"));
    }

    #[test]
    fn system_text_is_concatenated_in_order() {
        let messages = vec![
            ChatMessage::system("You are a builder."),
            ChatMessage::user("hi"),
            ChatMessage::system("Be brief."),
        ];
        assert_eq!(
            collect_system_text(&messages).as_deref(),
            Some("You are a builder.\n\nBe brief.")
        );
        assert_eq!(non_system(&messages).count(), 1);
        assert!(collect_system_text(&[ChatMessage::user("x")]).is_none());
    }

    #[test]
    fn system_images_move_to_first_user_message() {
        let messages = vec![
            ChatMessage::new(
                Role::System,
                vec![
                    ContentPart::text("Match this map."),
                    ContentPart::image("image/png", "TUFQ"),
                ],
            ),
            ChatMessage::assistant(vec![ContentPart::text("ready")]),
            ChatMessage::user("build here"),
            ChatMessage::user("and here"),
        ];
        let rest: Vec<Cow<'_, ChatMessage>> = non_system(&messages).collect();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].role(), Role::Assistant);
        assert_eq!(rest[1].parts.len(), 2);
        assert!(matches!(
            &rest[1].parts[0],
            ContentPart::Image(img) if img.base64_data == "TUFQ"
        ));
        assert_eq!(rest[1].parts[1], ContentPart::text("build here"));
        assert_eq!(*rest[2], ChatMessage::user("and here"));
        assert_eq!(collect_system_text(&messages).as_deref(), Some("Match this map."));

        let only_system = vec![ChatMessage::new(
            Role::System,
            vec![ContentPart::image("image/png", "TUFQ")],
        )];
        let rest: Vec<Cow<'_, ChatMessage>> = non_system(&only_system).collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].role(), Role::User);
    }

    #[test]
    fn registry_memoizes_adapters() {
        let registry = ProviderRegistry::new();
        let a = registry.get_adapter(ProviderId::Anthropic).unwrap();
        let b = registry.get_adapter(ProviderId::Anthropic).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), ProviderId::Anthropic);
        assert_eq!(
            registry.get_adapter(ProviderId::Gemini).unwrap().id(),
            ProviderId::Gemini
        );
    }

    #[tokio::test]
    async fn registry_builds_adapters_from_explicit_settings() {
        let (base_url, captured) = test_support::start_json_mock(
            "/v1/messages",
            serde_json::json!({
                "content": [{"type": "text", "text": "ok"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }),
        )
        .await;
        let registry = ProviderRegistry::new().with_settings(
            ProviderId::Anthropic,
            ProviderSettings {
                base_url: Some(format!("{base_url}/")),
                timeout: Some(Duration::from_secs(5)),
            },
        );
        let adapter = registry.get_adapter(ProviderId::Anthropic).unwrap();
        let resp = adapter
            .send_chat_request(&[ChatMessage::user("hi")], &RequestOptions::new("m", "k"))
            .await;
        assert!(resp.success, "{:?}", resp.error_message);
        assert_eq!(captured.lock().unwrap().len(), 1);
    }

    #[test]
    fn registry_prefers_injected_adapter() {
        let fake: Arc<dyn ProviderAdapter> = Arc::new(FakeAdapter);
        let registry = ProviderRegistry::new().with_adapter(Arc::clone(&fake));
        let got = registry.get_adapter(ProviderId::OpenAi).unwrap();
        assert!(Arc::ptr_eq(&got, &fake));
    }

    #[test]
    fn registry_skips_disabled_providers() {
        let cfg: RelayConfig = toml::from_str(
            r#"
            [providers.openai]
            enabled = false

            [providers.anthropic]
            base_url = "http://localhost:9999/"
            "#,
        )
        .unwrap();
        let registry = ProviderRegistry::from_config(&cfg);
        assert!(registry.get_adapter(ProviderId::OpenAi).is_none());
        assert!(registry.get_adapter(ProviderId::Anthropic).is_some());
        assert_eq!(
            registry.settings[&ProviderId::Anthropic].resolve_base_url(ProviderId::Anthropic),
            "http://localhost:9999"
        );
    }

    #[tokio::test]
    async fn registry_is_safe_for_concurrent_lookup() {
        let registry = Arc::new(ProviderRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_adapter(ProviderId::Gemini).unwrap() })
            })
            .collect();
        let adapters = futures::future::join_all(handles).await;
        let first = adapters[0].as_ref().unwrap();
        for adapter in &adapters {
            assert!(Arc::ptr_eq(first, adapter.as_ref().unwrap()));
        }
    }

    #[test]
    fn last_input_image_finds_most_recent_user_image() {
        let messages = vec![
            ChatMessage::new(Role::User, vec![ContentPart::image("image/png", "OLD")]),
            ChatMessage::assistant(vec![ContentPart::image("image/png", "MODEL")]),
            ChatMessage::new(
                Role::User,
                vec![ContentPart::image("image/jpeg", "NEW"), ContentPart::text("edit")],
            ),
        ];
        assert_eq!(last_input_image(&messages).unwrap().base64_data, "NEW");
        assert!(last_input_image(&[ChatMessage::user("x")]).is_none());
    }

    #[test]
    fn count_defaults_absent_fields_to_zero() {
        let v = serde_json::json!({"a": 5});
        assert_eq!(count(&v["a"]), 5);
        assert_eq!(count(&v["missing"]), 0);
        assert_eq!(optional_count(&v["missing"]), None);
    }
}
