//! Agent orchestration core: content model, vendor adapters, tool registry
//! and dispatch, and the agent loop that ties them together.
//!
//! Tools execute on a single host thread. The host owns the [`HostPump`]
//! returned by [`host_queue`] and drains it (`tick` per frame, or
//! `run_blocking` on a dedicated thread); agent runs live on the tokio
//! runtime and only hand work across through the [`HostHandle`].

pub mod dispatch;
pub mod error;
pub mod model;
pub mod providers;
pub mod runner;
pub mod tool_registry;

pub use {
    dispatch::{Completion, HostHandle, HostPump, ToolDispatcher, host_queue},
    error::{AdapterError, DispatchError},
    model::{
        ChatMessage, ContentPart, ImageData, ModelResponse, Role, StopReason, ThinkingPart,
        TokenUsage, ToolCall, ToolDefinition, ToolResult,
    },
    providers::{ProviderAdapter, ProviderId, ProviderRegistry, RequestOptions},
    runner::{AgentResult, AgentRunConfig, AgentRunner, AgentTurn, OnEvent, RunnerEvent},
    tool_registry::{FnTool, Tool, ToolContext, ToolRegistry},
};
