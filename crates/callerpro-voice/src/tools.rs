//! Tool-call dispatch
//!
//! Every invocation the agent asks for gets exactly one result back, whether
//! the handler succeeds, fails, panics or runs past its timeout. Each call is
//! also reported on a separate audit channel, independent of the transcript.

use crate::config::{Scheduling, SessionConfig};
use crate::error::VoiceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A function call requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    json!({})
}

/// The answer paired with a [`ToolInvocation`] by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// How an invocation was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Audit trail entry, emitted before and after each invocation.
#[derive(Debug, Clone)]
pub enum ToolAuditRecord {
    Requested {
        invocation: ToolInvocation,
        at: DateTime<Utc>,
    },
    Resolved {
        result: ToolResult,
        outcome: ToolOutcome,
        elapsed: Duration,
        at: DateTime<Utc>,
    },
}

/// Executes one named tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, invocation: ToolInvocation) -> VoiceResult<Value>;
}

/// Acknowledges every call with `{"result": "ok"}`.
#[derive(Debug, Default, Clone)]
pub struct StaticToolHandler;

#[async_trait]
impl ToolHandler for StaticToolHandler {
    async fn call(&self, _invocation: ToolInvocation) -> VoiceResult<Value> {
        Ok(json!({ "result": "ok" }))
    }
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnToolHandler<F> {
    f: F,
}

impl<F> FnToolHandler<F>
where
    F: Fn(ToolInvocation) -> BoxFuture<'static, VoiceResult<Value>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ToolHandler for FnToolHandler<F>
where
    F: Fn(ToolInvocation) -> BoxFuture<'static, VoiceResult<Value>> + Send + Sync,
{
    async fn call(&self, invocation: ToolInvocation) -> VoiceResult<Value> {
        (self.f)(invocation).await
    }
}

/// Routes invocations to handlers under a per-invocation timeout.
pub struct ToolDispatcher {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    fallback: Arc<dyn ToolHandler>,
    scheduling: RwLock<HashMap<String, Scheduling>>,
    timeout: Duration,
    audit_tx: mpsc::UnboundedSender<ToolAuditRecord>,
}

impl ToolDispatcher {
    /// Create a dispatcher. Unregistered tools are answered by [`StaticToolHandler`].
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<ToolAuditRecord>) {
        let (audit_tx, audit_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            handlers: HashMap::new(),
            fallback: Arc::new(StaticToolHandler),
            scheduling: RwLock::new(HashMap::new()),
            timeout,
            audit_tx,
        };
        (dispatcher, audit_rx)
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn ToolHandler>) {
        self.fallback = handler;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Take scheduling policies from the tools declared for a new session.
    pub fn apply_session(&self, config: &SessionConfig) {
        let map = config
            .tools
            .iter()
            .filter_map(|t| t.scheduling.map(|s| (t.name.clone(), s)))
            .collect();
        match self.scheduling.write() {
            Ok(mut guard) => *guard = map,
            Err(poisoned) => *poisoned.into_inner() = map,
        }
    }

    fn scheduling_for(&self, name: &str) -> Option<Scheduling> {
        match self.scheduling.read() {
            Ok(guard) => guard.get(name).copied(),
            Err(poisoned) => poisoned.into_inner().get(name).copied(),
        }
    }

    /// Resolve every invocation concurrently. Results come back in request
    /// order, one per invocation.
    pub async fn dispatch(&self, invocations: Vec<ToolInvocation>) -> Vec<ToolResult> {
        info!(target: "callerpro::tools", count = invocations.len(), "Dispatching tool calls");
        join_all(invocations.into_iter().map(|inv| self.resolve(inv))).await
    }

    async fn resolve(&self, invocation: ToolInvocation) -> ToolResult {
        self.audit(ToolAuditRecord::Requested {
            invocation: invocation.clone(),
            at: Utc::now(),
        });

        let handler = self
            .handlers
            .get(&invocation.name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback));

        let started = Instant::now();
        let call = invocation.clone();
        let mut task = tokio::spawn(async move { handler.call(call).await });

        let (response, outcome) = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(value))) => (wrap_value(value), ToolOutcome::Completed),
            Ok(Ok(Err(e))) => {
                warn!(target: "callerpro::tools", tool = %invocation.name, id = %invocation.id, "Tool failed: {}", e);
                (json!({ "error": e.to_string() }), ToolOutcome::Failed(e.to_string()))
            }
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    "tool handler panicked".to_string()
                } else {
                    format!("tool handler aborted: {}", join_err)
                };
                warn!(target: "callerpro::tools", tool = %invocation.name, id = %invocation.id, "{}", message);
                (json!({ "error": message.clone() }), ToolOutcome::Failed(message))
            }
            Err(_) => {
                task.abort();
                warn!(
                    target: "callerpro::tools",
                    tool = %invocation.name,
                    id = %invocation.id,
                    "Tool timed out after {:?}",
                    self.timeout
                );
                (
                    json!({
                        "status": "pending",
                        "message": format!("{} did not finish within {} ms", invocation.name, self.timeout.as_millis()),
                    }),
                    ToolOutcome::TimedOut,
                )
            }
        };

        let response = self.with_scheduling(&invocation.name, response);
        let result = ToolResult {
            id: invocation.id,
            name: invocation.name,
            response,
        };
        let elapsed = started.elapsed();
        debug!(target: "callerpro::tools", tool = %result.name, ?elapsed, "Tool resolved");

        self.audit(ToolAuditRecord::Resolved {
            result: result.clone(),
            outcome,
            elapsed,
            at: Utc::now(),
        });
        result
    }

    fn with_scheduling(&self, name: &str, mut response: Value) -> Value {
        if let (Some(scheduling), Some(object)) = (self.scheduling_for(name), response.as_object_mut()) {
            object
                .entry("scheduling")
                .or_insert_with(|| json!(scheduling));
        }
        response
    }

    fn audit(&self, record: ToolAuditRecord) {
        // The audit consumer is optional; a closed channel is not an error.
        let _ = self.audit_tx.send(record);
    }
}

/// Responses must be JSON objects on the wire.
fn wrap_value(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({ "result": other }),
    }
}

/// Build a boxed closure handler without spelling out the future type.
pub fn handler_fn<F>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolInvocation) -> BoxFuture<'static, VoiceResult<Value>> + Send + Sync + 'static,
{
    Arc::new(FnToolHandler::new(f))
}
