mod http;
mod stdio;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::ProviderDefinition;

/// A working session with one tool provider, behind a single interface
/// regardless of whether it's a stdio subprocess or an HTTP server.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<String>>;
    async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<Value>;
    async fn close(&self);
}

/// Opens a session appropriate to the provider definition's transport.
pub async fn connect(definition: &ProviderDefinition) -> anyhow::Result<Box<dyn ProviderSession>> {
    match definition {
        ProviderDefinition::Stdio { command, args, env } => {
            let session = stdio::StdioSession::connect(command, args, env).await?;
            Ok(Box::new(session))
        }
        ProviderDefinition::Http { url } => {
            let session = http::HttpSession::connect(url).await?;
            Ok(Box::new(session))
        }
    }
}
