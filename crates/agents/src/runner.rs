use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use {
    futures::FutureExt,
    relay_config::RelayConfig,
    tracing::{debug, info, trace, warn},
};

use crate::{
    dispatch::{HostHandle, ToolDispatcher, panic_message},
    model::{
        ChatMessage, ContentPart, ModelResponse, StopReason, TokenUsage, ToolCall, ToolDefinition,
        ToolResult,
    },
    providers::{ProviderAdapter, ProviderId, ProviderRegistry, RequestOptions},
    tool_registry::{ToolContext, ToolRegistry},
};

/// Settings for one agent run.
#[derive(Debug, Clone)]
pub struct AgentRunConfig {
    pub provider: ProviderId,
    pub options: RequestOptions,
    /// Upper bound on adapter calls, retries included.
    pub max_iterations: usize,
    /// Wall-clock limit per adapter call; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl AgentRunConfig {
    pub fn new(provider: ProviderId, options: RequestOptions) -> Self {
        let defaults = relay_config::AgentConfig::default();
        Self {
            provider,
            options,
            max_iterations: defaults.max_iterations,
            request_timeout: timeout_from_secs(defaults.request_timeout_secs),
        }
    }

    /// Run settings from config. The model falls back to the provider's
    /// default when config names none.
    pub fn from_config(
        provider: ProviderId,
        api_key: impl Into<String>,
        config: &RelayConfig,
    ) -> Self {
        let model = config
            .providers
            .get(provider.as_str())
            .and_then(|e| e.model.clone())
            .unwrap_or_else(|| provider.default_model().to_string());
        Self {
            provider,
            options: RequestOptions::from_agent_config(model, api_key, &config.agent),
            max_iterations: config.agent.max_iterations,
            request_timeout: timeout_from_secs(config.agent.request_timeout_secs),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// One loop iteration: a model call plus any tool execution it triggered.
#[derive(Debug, Clone, Default)]
pub struct AgentTurn {
    pub assistant_parts: Vec<ContentPart>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub stop_reason: Option<StopReason>,
    pub usage: TokenUsage,
    pub error: Option<String>,
}

impl AgentTurn {
    fn from_response(response: &ModelResponse) -> Self {
        Self {
            assistant_parts: response.assistant_parts.clone(),
            tool_calls: response.tool_calls.clone(),
            stop_reason: Some(response.stop_reason),
            usage: response.usage,
            error: response.error_message.clone(),
            ..Default::default()
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub turns: Vec<AgentTurn>,
    /// The input conversation plus everything the run appended.
    pub conversation: Vec<ChatMessage>,
    /// Final assistant text on success, the error on failure, or the
    /// iteration-limit warning.
    pub message: Option<String>,
    /// Set when the run stopped at the iteration cap rather than on its own.
    pub hit_iteration_limit: bool,
    /// Token counts summed over all recorded turns.
    pub usage: TokenUsage,
}

/// Callback for progress events out of the runner.
pub type OnEvent = Box<dyn Fn(RunnerEvent) + Send + Sync>;

/// Events emitted during the agent run.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Iteration(usize),
    /// Reasoning text returned alongside a response. Display only.
    ThinkingText(String),
    ToolCallStart {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallEnd {
        id: String,
        name: String,
        success: bool,
        error: Option<String>,
    },
    /// A tool-less truncated response was discarded and will be retried.
    RetryingAfterTruncation {
        iteration: usize,
    },
}

/// Drives the model/tool loop for agent runs.
///
/// Shareable across concurrent runs: it holds only read-mostly registries
/// and the host queue handle.
#[derive(Clone)]
pub struct AgentRunner {
    providers: Arc<ProviderRegistry>,
    dispatcher: ToolDispatcher,
}

impl AgentRunner {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        host: HostHandle,
    ) -> Self {
        Self {
            providers,
            dispatcher: ToolDispatcher::new(tools, host),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Run the agent loop over `conversation` until the model ends its turn,
    /// a fatal error occurs, or `max_iterations` adapter calls were made.
    pub async fn run(
        &self,
        conversation: Vec<ChatMessage>,
        config: &AgentRunConfig,
        ctx: &ToolContext,
        on_event: Option<&OnEvent>,
    ) -> AgentResult {
        let mut run = RunState::new(conversation);

        let Some(adapter) = self.providers.get_adapter(config.provider) else {
            warn!(provider = %config.provider, "agent run requested for disabled provider");
            return run.fail(format!("provider {} is disabled", config.provider));
        };
        let tool_defs = self.dispatcher.tools().list_definitions();

        info!(
            provider = %config.provider,
            model = %config.options.model,
            tools_count = tool_defs.len(),
            max_iterations = config.max_iterations,
            "starting agent loop"
        );

        for iteration in 1..=config.max_iterations {
            if let Some(cb) = on_event {
                cb(RunnerEvent::Iteration(iteration));
            }
            info!(
                iteration,
                messages_count = run.conversation.len(),
                "calling LLM"
            );
            trace!(iteration, messages = ?run.conversation, "LLM request messages");

            let outcome =
                call_adapter(adapter.as_ref(), &run.conversation, &tool_defs, config).await;
            let response = match outcome {
                Ok(r) => r,
                Err(message) => {
                    warn!(iteration, error = %message, "adapter call failed");
                    run.turns.push(AgentTurn {
                        stop_reason: Some(StopReason::Error),
                        error: Some(message.clone()),
                        ..Default::default()
                    });
                    return run.fail(message);
                },
            };

            info!(
                iteration,
                success = response.success,
                stop_reason = ?response.stop_reason,
                tool_calls_count = response.tool_calls.len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "LLM response received"
            );

            if !response.success {
                let message = response
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "provider request failed".into());
                warn!(iteration, error = %message, "provider returned an error");
                run.record(AgentTurn::from_response(&response));
                return run.fail(message);
            }

            if response.stop_reason == StopReason::MaxTokens && response.tool_calls.is_empty() {
                warn!(iteration, "response truncated without tool calls, discarding and retrying");
                if let Some(cb) = on_event {
                    cb(RunnerEvent::RetryingAfterTruncation { iteration });
                }
                continue;
            }

            if let Some(cb) = on_event {
                for part in &response.assistant_parts {
                    if let ContentPart::Thinking(thinking) = part
                        && let Some(text) = &thinking.text
                        && !text.is_empty()
                    {
                        cb(RunnerEvent::ThinkingText(text.clone()));
                    }
                }
            }

            run.conversation
                .push(ChatMessage::assistant(response.assistant_parts.clone()));
            let mut turn = AgentTurn::from_response(&response);

            if response.stop_reason != StopReason::ToolUse || response.tool_calls.is_empty() {
                info!(iteration, turns = run.turns.len() + 1, "agent loop complete");
                run.record(turn);
                return run.succeed(response.text_content);
            }

            for call in &response.tool_calls {
                info!(
                    iteration,
                    tool_name = %call.name,
                    call_id = %call.id,
                    arguments = %call.arguments,
                    "LLM requested tool call"
                );
                if let Some(cb) = on_event {
                    cb(RunnerEvent::ToolCallStart {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }
            }

            let results = match self.dispatcher.dispatch(&response.tool_calls, ctx).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(iteration, error = %e, "tool dispatch failed");
                    turn.error = Some(e.to_string());
                    run.record(turn);
                    return run.fail(e.to_string());
                },
            };

            for result in &results {
                debug!(
                    tool_name = %result.tool_name,
                    call_id = %result.call_id,
                    success = result.success,
                    "tool call finished"
                );
                if let Some(cb) = on_event {
                    cb(RunnerEvent::ToolCallEnd {
                        id: result.call_id.clone(),
                        name: result.tool_name.clone(),
                        success: result.success,
                        error: (!result.success).then(|| result.content.clone()),
                    });
                }
            }

            run.conversation.push(ChatMessage::tool_results(&results));
            turn.tool_results = results;
            run.record(turn);
        }

        warn!(max_iterations = config.max_iterations, "agent loop reached max iterations");
        run.hit_iteration_limit = true;
        let message = format!(
            "stopped after {} iterations without a final answer",
            config.max_iterations
        );
        run.succeed(Some(message))
    }
}

/// Call the adapter under the run's timeout. A timeout is reported as a
/// failed response; only a panic inside the adapter is an `Err`.
async fn call_adapter(
    adapter: &dyn ProviderAdapter,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    config: &AgentRunConfig,
) -> Result<ModelResponse, String> {
    let call = AssertUnwindSafe(adapter.send_tool_request(messages, tools, &config.options))
        .catch_unwind();
    let outcome = match config.request_timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Ok(ModelResponse::failure(format!(
                    "provider request timed out after {}ms",
                    limit.as_millis()
                )));
            },
        },
        None => call.await,
    };
    outcome.map_err(|payload| format!("provider call panicked: {}", panic_message(&*payload)))
}

/// Accumulator owned by a single run.
struct RunState {
    turns: Vec<AgentTurn>,
    conversation: Vec<ChatMessage>,
    usage: TokenUsage,
    hit_iteration_limit: bool,
}

impl RunState {
    fn new(conversation: Vec<ChatMessage>) -> Self {
        Self {
            turns: Vec::new(),
            conversation,
            usage: TokenUsage::default(),
            hit_iteration_limit: false,
        }
    }

    fn record(&mut self, turn: AgentTurn) {
        self.usage += turn.usage;
        self.turns.push(turn);
    }

    fn finish(self, success: bool, message: Option<String>) -> AgentResult {
        AgentResult {
            success,
            turns: self.turns,
            conversation: self.conversation,
            message,
            hit_iteration_limit: self.hit_iteration_limit,
            usage: self.usage,
        }
    }

    fn succeed(self, message: Option<String>) -> AgentResult {
        self.finish(true, message)
    }

    fn fail(self, message: String) -> AgentResult {
        self.finish(false, Some(message))
    }
}
