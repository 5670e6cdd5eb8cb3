//! Tool dispatch and the bridge onto the single-threaded host.
//!
//! The agent loop runs on the async runtime, but tools mutate host state that
//! is only safe to touch from one thread. A batch of calls is therefore
//! packaged as a job and pushed onto a [`HostHandle`]; the host drains the
//! queue from its own tick via [`HostPump`]. Each call gets a [`Completion`]
//! handle, and a [`BatchJoin`] counts results back in and wakes the waiting
//! loop once every slot is filled.

use std::{
    any::Any,
    cell::Cell,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard},
};

use {
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, warn},
};

use crate::{
    error::DispatchError,
    model::{ToolCall, ToolResult},
    tool_registry::{ToolContext, ToolRegistry},
};

type HostJob = Box<dyn FnOnce() + Send>;

/// Create a connected host queue. The handle is cloned into background
/// tasks; the pump stays on the host thread.
pub fn host_queue() -> (HostHandle, HostPump) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HostHandle { tx }, HostPump { rx })
}

/// Sender side of the host work queue.
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::UnboundedSender<HostJob>,
}

impl HostHandle {
    /// Queue `job` to run on the host thread at its next tick.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), DispatchError> {
        self.tx
            .send(Box::new(job))
            .map_err(|_| DispatchError::HostQueueClosed)
    }
}

/// Receiver side of the host work queue. Owned by the host thread.
pub struct HostPump {
    rx: mpsc::UnboundedReceiver<HostJob>,
}

impl HostPump {
    /// Run every job queued so far without blocking. Returns how many ran.
    pub fn tick(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Run jobs until every [`HostHandle`] is dropped. For hosts that
    /// dedicate a thread to tool execution; must not be called from inside
    /// the async runtime.
    pub fn run_blocking(mut self) {
        while let Some(job) = self.rx.blocking_recv() {
            job();
        }
        debug!("host queue closed, pump exiting");
    }
}

struct JoinState {
    remaining: usize,
    results: Vec<Option<ToolResult>>,
    notify: Option<oneshot::Sender<Vec<ToolResult>>>,
    /// Set while the host is still starting calls; firing waits for release.
    held: bool,
}

/// Fan-in counter for one batch. Starts at the batch size and fires once,
/// when the last slot is filled. Each slot accepts exactly one result.
pub(crate) struct BatchJoin {
    state: Mutex<JoinState>,
}

impl BatchJoin {
    pub(crate) fn new(size: usize) -> (Arc<Self>, oneshot::Receiver<Vec<ToolResult>>) {
        let (tx, rx) = oneshot::channel();
        let join = Arc::new(Self {
            state: Mutex::new(JoinState {
                remaining: size,
                results: vec![None; size],
                notify: Some(tx),
                held: false,
            }),
        });
        if size == 0 {
            join.fire(&mut join.lock());
        }
        (join, rx)
    }

    fn lock(&self) -> MutexGuard<'_, JoinState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store the result for slot `index`. Returns false (and changes nothing)
    /// if the slot was already filled.
    pub(crate) fn record(&self, index: usize, result: ToolResult) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.results.get_mut(index) else {
            warn!(index, "tool result for out-of-range slot ignored");
            return false;
        };
        if slot.is_some() {
            debug!(index, call_id = %result.call_id, "duplicate tool result ignored");
            return false;
        }
        *slot = Some(result);
        state.remaining -= 1;
        self.fire_if_done(&mut state);
        true
    }

    /// Record a fault for slot `index`, replacing any result the call
    /// already reported. Too late once the batch has fired.
    pub(crate) fn record_fault(&self, index: usize, result: ToolResult) {
        let mut state = self.lock();
        if state.notify.is_none() {
            warn!(index, call_id = %result.call_id, "tool fault after batch completed, dropped");
            return;
        }
        let Some(slot) = state.results.get_mut(index) else {
            warn!(index, "tool fault for out-of-range slot ignored");
            return;
        };
        if slot.replace(result).is_none() {
            state.remaining -= 1;
            self.fire_if_done(&mut state);
        }
    }

    /// Keep the batch from firing until [`BatchJoin::release`].
    pub(crate) fn hold(&self) {
        self.lock().held = true;
    }

    pub(crate) fn release(&self) {
        let mut state = self.lock();
        state.held = false;
        self.fire_if_done(&mut state);
    }

    fn fire_if_done(&self, state: &mut JoinState) {
        if state.remaining == 0 && !state.held {
            self.fire(state);
        }
    }

    fn fire(&self, state: &mut JoinState) {
        let Some(tx) = state.notify.take() else {
            return;
        };
        let results = state.results.iter().flatten().cloned().collect();
        // The receiver is gone if the loop stopped waiting; nothing to do.
        let _ = tx.send(results);
    }
}

thread_local! {
    /// Set while a tool's `execute` runs under the dispatcher's unwind guard,
    /// so a dropped [`Completion`] defers to the guard's panic message.
    static IN_GUARDED_EXECUTE: Cell<bool> = const { Cell::new(false) };
}

/// One-shot completion handle for a single tool call.
///
/// Consumed by [`Completion::complete`]. If dropped unused, a failure is
/// recorded so the batch cannot hang.
pub struct Completion {
    join: Arc<BatchJoin>,
    index: usize,
    call: ToolCall,
    done: bool,
}

impl Completion {
    fn new(join: Arc<BatchJoin>, index: usize, call: &ToolCall) -> Self {
        Self {
            join,
            index,
            call: call.clone(),
            done: false,
        }
    }

    pub fn call(&self) -> &ToolCall {
        &self.call
    }

    pub fn complete(mut self, result: ToolResult) {
        self.done = true;
        self.join.record(self.index, result);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if std::thread::panicking() && IN_GUARDED_EXECUTE.with(Cell::get) {
            return;
        }
        warn!(
            tool = %self.call.name,
            call_id = %self.call.id,
            "tool dropped its completion without a result"
        );
        self.join.record(
            self.index,
            ToolResult::failure(&self.call, "tool finished without reporting a result"),
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Executes tool batches on the host thread and joins their results.
#[derive(Clone)]
pub struct ToolDispatcher {
    tools: Arc<ToolRegistry>,
    host: HostHandle,
}

impl ToolDispatcher {
    pub fn new(tools: Arc<ToolRegistry>, host: HostHandle) -> Self {
        Self { tools, host }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run `calls` on the host and return one result per call, in call
    /// order. Unknown tools and tool panics become failed results; only a
    /// closed host queue or an abandoned batch is an error.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
    ) -> Result<Vec<ToolResult>, DispatchError> {
        let (join, done) = BatchJoin::new(calls.len());
        if !calls.is_empty() {
            debug!(calls = calls.len(), "queueing tool batch on host");
            let tools = Arc::clone(&self.tools);
            let calls = calls.to_vec();
            let ctx = ctx.clone();
            self.host
                .submit(move || run_batch(&tools, &calls, &ctx, &join))?;
        }
        done.await.map_err(|_| DispatchError::BatchAbandoned)
    }
}

/// Host-thread side: start each call in order. Deferred tools may finish
/// after this returns. The join is held for the whole pass so a tool that
/// completes and then panics still ends up with its fault recorded.
fn run_batch(
    tools: &ToolRegistry,
    calls: &[ToolCall],
    ctx: &ToolContext,
    join: &Arc<BatchJoin>,
) {
    join.hold();
    for (index, call) in calls.iter().enumerate() {
        let completion = Completion::new(Arc::clone(join), index, call);
        let Some(tool) = tools.lookup(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "unknown tool requested");
            completion.complete(ToolResult::failure(
                call,
                format!("unknown tool: {}", call.name),
            ));
            continue;
        };

        IN_GUARDED_EXECUTE.with(|f| f.set(true));
        let outcome = catch_unwind(AssertUnwindSafe(|| tool.execute(call, ctx, completion)));
        IN_GUARDED_EXECUTE.with(|f| f.set(false));

        if let Err(payload) = outcome {
            let message = panic_message(&*payload);
            warn!(tool = %call.name, call_id = %call.id, error = %message, "tool panicked");
            join.record_fault(
                index,
                ToolResult::failure(call, format!("tool panicked: {message}")),
            );
        }
    }
    join.release();
}
