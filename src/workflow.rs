use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// The seam C6 drives a workflow engine through. `SequentialEngine` is the
/// minimal built-in implementation; a fuller engine (templating, branching,
/// retries) can be wired in instead without touching C3–C6.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn execute(&self, workflow: Value, inputs: Value) -> ExecutionResult;
}

/// What a workflow step invokes through — satisfied by the hybrid invoker.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, params: Value) -> Value;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub id: String,
    pub status: StepStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: StepStatus,
    pub outputs: HashMap<String, Value>,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
}

impl ExecutionResult {
    pub fn steps_completed(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Completed).count()
    }

    pub fn steps_total(&self) -> usize {
        self.steps.len()
    }
}

#[derive(Debug, Deserialize)]
struct RawStep {
    id: String,
    tool: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    output_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    steps: Vec<RawStep>,
}

/// Executes a workflow's steps in declaration order, threading each step's
/// named output into a flat output map. Deliberately excludes templating
/// expression languages, conditional branching, and sandboxing.
pub struct SequentialEngine {
    invoker: Arc<dyn ToolInvoker>,
}

impl SequentialEngine {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }

    /// Walks `value` replacing any `{"$ref": "<key>"}` object with the
    /// recorded output (or input) under that key, one level of object/array
    /// nesting deep.
    fn substitute(value: &Value, outputs: &HashMap<String, Value>, inputs: &Value) -> Value {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(key)) = map.get("$ref") {
                        if let Some(found) = outputs.get(key) {
                            return found.clone();
                        }
                        if let Some(found) = inputs.get(key) {
                            return found.clone();
                        }
                        return Value::Null;
                    }
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::substitute(v, outputs, inputs)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(
                items.iter().map(|v| Self::substitute(v, outputs, inputs)).collect(),
            ),
            other => other.clone(),
        }
    }

    fn step_failed(result: &Value) -> bool {
        result
            .as_object()
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_str())
            == Some("error")
    }
}

#[async_trait]
impl WorkflowEngine for SequentialEngine {
    async fn execute(&self, workflow: Value, inputs: Value) -> ExecutionResult {
        let started = Instant::now();

        let parsed: RawWorkflow = match serde_json::from_value(workflow) {
            Ok(w) => w,
            Err(e) => {
                return ExecutionResult {
                    status: StepStatus::Failed,
                    outputs: HashMap::new(),
                    duration_ms: elapsed_ms(started),
                    steps: vec![StepResult {
                        id: "parse".to_string(),
                        status: StepStatus::Failed,
                        error: Some(format!("invalid workflow definition: {e}")),
                    }],
                };
            }
        };

        if parsed.steps.is_empty() {
            return ExecutionResult {
                status: StepStatus::Completed,
                outputs: HashMap::new(),
                duration_ms: elapsed_ms(started),
                steps: Vec::new(),
            };
        }

        let mut outputs = HashMap::new();
        let mut steps = Vec::new();
        let mut overall = StepStatus::Completed;

        for step in parsed.steps {
            let resolved_params = Self::substitute(&step.params, &outputs, &inputs);
            let result = self.invoker.invoke(&step.tool, resolved_params).await;

            if Self::step_failed(&result) {
                let message = result
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("tool invocation failed")
                    .to_string();
                steps.push(StepResult {
                    id: step.id,
                    status: StepStatus::Failed,
                    error: Some(message),
                });
                overall = StepStatus::Failed;
                break;
            }

            let key = step.output_key.unwrap_or_else(|| step.id.clone());
            outputs.insert(key, result);
            steps.push(StepResult {
                id: step.id,
                status: StepStatus::Completed,
                error: None,
            });
        }

        ExecutionResult {
            status: overall,
            outputs,
            duration_ms: elapsed_ms(started),
            steps,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubInvoker {
        responses: HashMap<String, Value>,
    }

    #[async_trait]
    impl ToolInvoker for StubInvoker {
        async fn invoke(&self, tool_name: &str, _params: Value) -> Value {
            self.responses
                .get(tool_name)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"status": "error", "error": {"code": -32002, "message": "no stub"}}))
        }
    }

    #[tokio::test]
    async fn empty_workflow_completes_with_no_outputs() {
        let invoker = Arc::new(StubInvoker { responses: HashMap::new() });
        let engine = SequentialEngine::new(invoker);
        let result = engine.execute(serde_json::json!({"steps": []}), serde_json::json!({})).await;
        assert_eq!(result.status, StepStatus::Completed);
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn later_step_resolves_ref_to_earlier_output() {
        let mut responses = HashMap::new();
        responses.insert("fetch".to_string(), serde_json::json!({"value": 42}));
        responses.insert("use".to_string(), serde_json::json!({"status": "success", "echoed": true}));
        let invoker = Arc::new(StubInvoker { responses });
        let engine = SequentialEngine::new(invoker);

        let workflow = serde_json::json!({
            "steps": [
                {"id": "fetch", "tool": "fetch", "params": {}},
                {"id": "use", "tool": "use", "params": {"input": {"$ref": "fetch"}}},
            ]
        });

        let result = engine.execute(workflow, serde_json::json!({})).await;
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.steps_completed(), 2);
        assert!(result.outputs.contains_key("fetch"));
        assert!(result.outputs.contains_key("use"));
    }

    #[tokio::test]
    async fn stops_at_first_failed_step() {
        let mut responses = HashMap::new();
        responses.insert(
            "will_fail".to_string(),
            serde_json::json!({"status": "error", "error": {"code": -32002, "message": "boom"}}),
        );
        let invoker = Arc::new(StubInvoker { responses });
        let engine = SequentialEngine::new(invoker);

        let workflow = serde_json::json!({
            "steps": [
                {"id": "will_fail", "tool": "will_fail", "params": {}},
                {"id": "never_runs", "tool": "never_runs", "params": {}},
            ]
        });

        let result = engine.execute(workflow, serde_json::json!({})).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].id, "will_fail");
    }

    #[tokio::test]
    async fn falls_back_to_inputs_when_ref_is_not_a_prior_output() {
        let mut responses = HashMap::new();
        responses.insert("use".to_string(), serde_json::json!({"status": "success"}));
        let invoker = Arc::new(StubInvoker { responses });
        let engine = SequentialEngine::new(invoker);

        let workflow = serde_json::json!({
            "steps": [{"id": "use", "tool": "use", "params": {"name": {"$ref": "user_name"}}}]
        });
        let inputs = serde_json::json!({"user_name": "ada"});

        let result = engine.execute(workflow, inputs).await;
        assert_eq!(result.status, StepStatus::Completed);
    }
}
