use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::TokioChildProcess;
use rmcp::RoleClient;
use rmcp::ServiceExt;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::ProviderSession;

/// A tool provider reached by speaking the tool protocol over a child
/// process's stdio streams.
pub struct StdioSession {
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl StdioSession {
    pub async fn connect(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let command = command.trim();
        if command.is_empty() {
            return Err(anyhow!("no command specified for stdio transport"));
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in env {
            cmd.env(key, value);
        }

        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| anyhow!("failed to spawn provider process '{}': {}", command, e))?;

        let service = ()
            .serve(transport)
            .await
            .context("failed to initialize tool provider client")?;

        Ok(Self {
            service: Mutex::new(Some(service)),
        })
    }
}

#[async_trait]
impl ProviderSession for StdioSession {
    async fn list_tools(&self) -> Result<Vec<String>> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = service
            .list_tools(Default::default())
            .await
            .context("tools/list failed")?;
        Ok(result.tools.into_iter().map(|t| t.name.to_string()).collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let params: CallToolRequestParams = serde_json::from_value(serde_json::json!({
            "name": name,
            "arguments": args,
        }))
        .context("invalid tool call arguments")?;
        let result = service.call_tool(params).await.context("tools/call failed")?;
        Ok(serde_json::to_value(result)?)
    }

    async fn close(&self) {
        if let Some(service) = self.service.lock().await.take() {
            let _ = service.cancel().await;
        }
    }
}
