use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::provider::{self, ProviderSession};
use crate::types::{ProviderDefinition, ProviderRecord, ProviderStatus, ToolAvailability};

/// Connects to a set of tool providers, tracks per-provider health, and
/// publishes a derived `ToolAvailability` view. Owns the provider records;
/// external callers only ever see a snapshot.
pub struct ToolProviderSupervisor {
    records: RwLock<HashMap<String, ProviderRecord>>,
    sessions: RwLock<HashMap<String, Arc<dyn ProviderSession>>>,
    /// tool_name -> owning provider name, per invariant 3's first-registered
    /// rule. Provider registration order isn't preserved through the intake
    /// `HashMap`, so "first-registered" is resolved deterministically by
    /// provider name; see DESIGN.md.
    bindings: RwLock<HashMap<String, String>>,
    cancel: CancellationToken,
    health_check_interval: std::time::Duration,
    on_availability_changed:
        Option<Box<dyn Fn(ToolAvailability) -> futures::future::BoxFuture<'static, ()> + Send + Sync>>,
}

impl ToolProviderSupervisor {
    pub fn new(health_check_interval: std::time::Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            health_check_interval,
            on_availability_changed: None,
        }
    }

    /// Recomputes `bindings` from the current records: for each tool name,
    /// the first provider in provider-name order claims it; later providers
    /// advertising the same name are logged as a configuration warning and
    /// excluded, per invariant 3.
    async fn recompute_bindings(&self) {
        let records = self.records.read().await;
        let mut names: Vec<&ProviderRecord> = records.values().collect();
        names.sort_by(|a, b| a.name.cmp(&b.name));

        let mut bindings = HashMap::new();
        for record in names {
            if record.connection_status != ProviderStatus::Connected {
                continue;
            }
            for tool in &record.tools {
                if let Some(existing) = bindings.get(tool) {
                    tracing::warn!(
                        tool = %tool,
                        existing_provider = existing,
                        duplicate_provider = %record.name,
                        "tool name advertised by more than one provider; keeping first-registered binding"
                    );
                    continue;
                }
                bindings.insert(tool.clone(), record.name.clone());
            }
        }
        *self.bindings.write().await = bindings;
    }

    pub fn with_availability_callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(ToolAvailability) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_availability_changed = Some(Box::new(move |view| Box::pin(callback(view))));
        self
    }

    /// Connects all providers concurrently, tolerating individual failures.
    /// Replaces any previously-installed provider set wholesale (§4.5's
    /// "full replacement" handoff contract). After the first sweep, emits
    /// exactly one availability notification.
    pub async fn initialize(&self, providers: HashMap<String, ProviderDefinition>) {
        self.drain_previous().await;

        let results = futures::future::join_all(providers.into_iter().map(|(name, definition)| {
            async move {
                let attempt = provider::connect(&definition).await;
                (name, definition, attempt)
            }
        }))
        .await;

        let mut records = self.records.write().await;
        let mut sessions = self.sessions.write().await;

        for (name, definition, attempt) in results {
            match attempt {
                Ok(session) => {
                    let tools = session.list_tools().await.unwrap_or_else(|e| {
                        tracing::warn!(provider = %name, error = %e, "failed to list tools after connect");
                        Vec::new()
                    });
                    tracing::info!(provider = %name, tools = tools.len(), "provider connected");
                    let mut record = ProviderRecord::new(name.clone(), definition);
                    record.connection_status = ProviderStatus::Connected;
                    record.tools = tools;
                    record.last_checked_at = Some(chrono::Utc::now());
                    records.insert(name.clone(), record);
                    sessions.insert(name, Arc::from(session));
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider failed to connect");
                    let mut record = ProviderRecord::new(name.clone(), definition);
                    record.connection_status = ProviderStatus::Failed;
                    record.last_error = Some(e.to_string());
                    record.last_checked_at = Some(chrono::Utc::now());
                    records.insert(name, record);
                }
            }
        }

        let view = ToolAvailability::from_records(records.values());
        drop(records);
        drop(sessions);
        self.recompute_bindings().await;
        self.report(view).await;
    }

    async fn drain_previous(&self) {
        let mut sessions = self.sessions.write().await;
        for (name, session) in sessions.drain() {
            tracing::info!(provider = %name, "closing session ahead of reconfiguration");
            session.close().await;
        }
        self.records.write().await.clear();
    }

    /// Runs until cancelled: every `health_check_interval`, recomputes
    /// bindings and the availability view from whatever provider status was
    /// last observed, and reports only if it changed. Per the resolved
    /// open question, this loop never originates new health data itself —
    /// it does not ping providers — it only reflects the status that actual
    /// provider I/O (a connect attempt in `initialize`, a failed call in
    /// `call_tool`) already recorded, the same way the original's
    /// `_perform_health_checks` reads the manager's cached status rather
    /// than probing.
    pub async fn run_health_check_loop(self: &Arc<Self>) {
        let mut previous = {
            let records = self.records.read().await;
            ToolAvailability::from_records(records.values())
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.health_check_interval) => {}
                _ = self.cancel.cancelled() => return,
            }

            self.recompute_bindings().await;

            let current = {
                let records = self.records.read().await;
                ToolAvailability::from_records(records.values())
            };

            if current != previous {
                self.report(current.clone()).await;
                previous = current;
            }
        }
    }

    async fn report(&self, view: ToolAvailability) {
        if let Some(callback) = &self.on_availability_changed {
            callback(view).await;
        }
    }

    pub async fn availability_view(&self) -> ToolAvailability {
        let records = self.records.read().await;
        ToolAvailability::from_records(records.values())
    }

    pub async fn is_available(&self, tool_name: &str) -> bool {
        self.availability_view().await.available.contains(tool_name)
    }

    /// Dispatches to the provider bound to `tool_name`. A failed call is
    /// itself the health signal the next health-check tick will reflect: the
    /// provider's record is marked `Disconnected` here, in the same place
    /// the failure was actually observed, rather than by a separate probe.
    pub async fn call_tool(&self, tool_name: &str, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let provider_name = self
            .bindings
            .read()
            .await
            .get(tool_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("tool '{}' not locally available", tool_name))?;
        let session = self
            .sessions
            .read()
            .await
            .get(&provider_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("provider '{}' has no active session", provider_name))?;

        match session.call_tool(tool_name, args).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Some(record) = self.records.write().await.get_mut(&provider_name) {
                    record.connection_status = ProviderStatus::Disconnected;
                    record.tools.clear();
                    record.last_error = Some(e.to_string());
                    record.last_checked_at = Some(chrono::Utc::now());
                }
                Err(e)
            }
        }
    }

    /// Cancels the health-check loop, then closes every provider session.
    /// Close is best-effort; errors are logged, not propagated.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut sessions = self.sessions.write().await;
        for (name, session) in sessions.drain() {
            tracing::info!(provider = %name, "shutting down provider session");
            session.close().await;
        }
        tracing::info!("all provider sessions shut down");
    }
}
