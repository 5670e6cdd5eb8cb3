use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use crate::{
    dispatch::Completion,
    model::{ToolCall, ToolDefinition, ToolResult},
};

/// Host-side addressing passed through to tools untouched.
///
/// `handle` is an opaque back-reference for tools that issue their own model
/// requests (typically an `Arc<AgentRunner>`); tools downcast it themselves.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub caller: String,
    pub data: serde_json::Value,
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl ToolContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_handle(mut self, handle: Arc<dyn Any + Send + Sync>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// The handle downcast to `T`, if it is one.
    pub fn handle_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("caller", &self.caller)
            .field("data", &self.data)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// Agent-callable tool.
///
/// `execute` runs on the host thread. A tool reports its outcome through
/// `done`, either before returning or later from anywhere (the handle is
/// `Send`). Dropping `done` unused records a failure for the call.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> ToolDefinition;
    fn execute(&self, call: &ToolCall, ctx: &ToolContext, done: Completion);
}

type ToolFn = dyn Fn(&serde_json::Value, &ToolContext) -> anyhow::Result<String> + Send + Sync;

/// A tool that completes immediately with the closure's output. Errors become
/// failed results carrying the error chain.
pub struct FnTool {
    definition: ToolDefinition,
    run: Box<ToolFn>,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        run: impl Fn(&serde_json::Value, &ToolContext) -> anyhow::Result<String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            definition: ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            run: Box::new(run),
        }
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn execute(&self, call: &ToolCall, ctx: &ToolContext, done: Completion) {
        let result = match (self.run)(&call.arguments, ctx) {
            Ok(content) => ToolResult::ok(call, content),
            Err(e) => ToolResult::failure(call, format!("{e:#}")),
        };
        done.complete(result);
    }
}

/// Registry of available tools, populated at startup and read-only after.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool; a tool with the same name is replaced.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::from(tool));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Definitions for every tool, sorted by name so request bodies are
    /// stable across runs.
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
