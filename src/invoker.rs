use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::engine::{OutboundLink, ToolExecutor, WorkflowExecutor};
use crate::supervisor::ToolProviderSupervisor;
use crate::types::{executor_error_code, method};
use crate::workflow::{self, WorkflowEngine};

/// Single tool-call entry point. Dispatches to the local provider when
/// available, otherwise forwards to the Control Plane as `tool/proxy`.
/// Also drives the two CP-initiated handlers, `workflow/execute` and
/// `tool/call`.
pub struct HybridInvoker {
    link: Arc<dyn OutboundLink>,
    supervisor: Arc<ToolProviderSupervisor>,
    proxy_timeout: Duration,
    workflow_engine: RwLock<Option<Arc<dyn WorkflowEngine>>>,
    initialized: AtomicBool,
}

impl HybridInvoker {
    pub fn new(link: Arc<dyn OutboundLink>, supervisor: Arc<ToolProviderSupervisor>, proxy_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            link,
            supervisor,
            proxy_timeout,
            workflow_engine: RwLock::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// Wires the embedded workflow engine and marks the invoker ready to
    /// serve `workflow/execute`/`tool/call`. The engine can't be built before
    /// the invoker (it needs the invoker as its `ToolInvoker`), so this is a
    /// second construction step rather than a constructor argument.
    pub async fn install_workflow_engine(&self, engine: Arc<dyn WorkflowEngine>) {
        *self.workflow_engine.write().await = Some(engine);
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn not_initialized_value() -> Value {
        serde_json::json!({
            "status": "error",
            "error": {
                "code": executor_error_code::EXECUTOR_NOT_INITIALIZED,
                "message": "hybrid invoker not initialized",
            }
        })
    }
}

#[async_trait]
impl workflow::ToolInvoker for HybridInvoker {
    /// Routing rule (§4.6): local provider if available, else `tool/proxy`
    /// to the Control Plane. Never raises — a proxy failure comes back as a
    /// `{status:"error", error:{code,message}}` data value, since workflow
    /// engines expect data-shaped tool errors, not exceptions.
    async fn invoke(&self, tool_name: &str, params: Value) -> Value {
        if self.supervisor.is_available(tool_name).await {
            return match self.supervisor.call_tool(tool_name, params).await {
                Ok(result) => result,
                Err(e) => serde_json::json!({
                    "status": "error",
                    "error": {"code": executor_error_code::TOOL_UNAVAILABLE, "message": e.to_string()},
                }),
            };
        }

        let proxy_params = serde_json::json!({"tool": tool_name, "args": params});
        match self
            .link
            .send_request(method::TOOL_PROXY, proxy_params, self.proxy_timeout)
            .await
        {
            Ok(resp) => match resp.error {
                // Relayed verbatim: this is the CP's own JSON-RPC-level error
                // object, not a code we're minting ourselves.
                Some(err) => serde_json::json!({
                    "status": "error",
                    "error": {"code": err.code, "message": err.message},
                }),
                None => resp.result.unwrap_or(Value::Null),
            },
            Err(e) => serde_json::json!({
                "status": "error",
                "error": {"code": executor_error_code::TOOL_UNAVAILABLE, "message": e.to_string()},
            }),
        }
    }
}

#[async_trait]
impl WorkflowExecutor for HybridInvoker {
    async fn execute(&self, params: Value) -> Value {
        if !self.initialized.load(Ordering::SeqCst) {
            return Self::not_initialized_value();
        }
        let engine = match self.workflow_engine.read().await.clone() {
            Some(e) => e,
            None => return Self::not_initialized_value(),
        };

        let execution_id = params.get("execution_id").cloned().unwrap_or(Value::Null);
        let workflow_def = match params.get("workflow") {
            Some(w) => w.clone(),
            None => {
                return serde_json::json!({
                    "status": "error",
                    "execution_id": execution_id,
                    "error": {"code": executor_error_code::INVALID_PARAMS, "message": "missing workflow definition"},
                });
            }
        };
        let inputs = params.get("inputs").cloned().unwrap_or(Value::Object(Default::default()));

        let result = engine.execute(workflow_def, inputs).await;
        let outer_status = if result.status == workflow::StepStatus::Completed {
            "success"
        } else {
            "error"
        };

        serde_json::json!({
            "status": outer_status,
            "execution_id": execution_id,
            "result": {
                "status": if result.status == workflow::StepStatus::Completed { "completed" } else { "failed" },
                "outputs": result.outputs,
                "duration_ms": result.duration_ms,
                "steps_completed": result.steps_completed(),
                "steps_total": result.steps_total(),
            },
        })
    }
}

#[async_trait]
impl ToolExecutor for HybridInvoker {
    /// `tool/call`: local execution only, never proxies.
    async fn call(&self, params: Value) -> Value {
        if !self.initialized.load(Ordering::SeqCst) {
            return Self::not_initialized_value();
        }

        let tool = match params.get("tool").and_then(|v| v.as_str()) {
            Some(t) => t.to_string(),
            None => {
                return serde_json::json!({
                    "status": "error",
                    "error": {"code": executor_error_code::INVALID_PARAMS, "message": "missing 'tool'"},
                })
            }
        };
        let args = params.get("args").cloned().unwrap_or(Value::Object(Default::default()));

        if !self.supervisor.is_available(&tool).await {
            return serde_json::json!({
                "status": "error",
                "error": {"code": executor_error_code::TOOL_UNAVAILABLE, "message": format!("tool '{tool}' not locally available")},
            });
        }

        match self.supervisor.call_tool(&tool, args).await {
            Ok(result) => serde_json::json!({"status": "success", "result": result}),
            Err(e) => serde_json::json!({
                "status": "error",
                "error": {"code": executor_error_code::TOOL_UNAVAILABLE, "message": e.to_string()},
            }),
        }
    }
}
