use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::RoleClient;
use rmcp::ServiceExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

use super::ProviderSession;

/// A tool provider reached over a streamable-HTTP session.
pub struct HttpSession {
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl HttpSession {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("failed to build HTTP client")?;

        let config = StreamableHttpClientTransportConfig::with_uri(url);
        let transport = StreamableHttpClientTransport::with_client(client, config);

        let service = ()
            .serve(transport)
            .await
            .context("failed to initialize HTTP tool provider client")?;

        Ok(Self {
            service: Mutex::new(Some(service)),
        })
    }
}

#[async_trait]
impl ProviderSession for HttpSession {
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
