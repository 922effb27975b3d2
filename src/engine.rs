use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Frame};
use crate::error::RunnerError;
use crate::transport::{self, TransportReader, TransportWriter};
use crate::types::{method, ConnectionState, JsonRpcResponse};

/// Installed by `config/push`. Returns the reply's `result` object verbatim
/// (`{status:"ok", mcps_received}` or `{status:"error", message}`).
#[async_trait]
pub trait ConfigSink: Send + Sync {
    async fn push(&self, params: Value) -> Value;
}

/// Installed by `workflow/execute`. Returns the reply's `result` object.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute(&self, params: Value) -> Value;
}

/// Installed by `tool/call`. Returns the reply's `result` object.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(&self, params: Value) -> Value;
}

/// The narrow surface the invoker and availability reporter are allowed to
/// hold onto (§9: "break the cycle by making the connection a leaf"). Keeps
/// them from reaching into handler registration or lifecycle control.
#[async_trait]
pub trait OutboundLink: Send + Sync {
    async fn send_request(&self, method: &str, params: Value, timeout: Duration) -> Result<JsonRpcResponse, RunnerError>;
    async fn send_notification(&self, method: &str, params: Value) -> Result<(), RunnerError>;
}

type PendingSlot = oneshot::Sender<Result<JsonRpcResponse, RunnerError>>;

/// Owns the transport, the pending-request table, and drives the receive,
/// heartbeat, and reconnection loops. Construct once per process; `start()`
/// and `stop()` are both idempotent.
pub struct ConnectionEngine {
    config: crate::types::RunnerConfig,
    state: RwLock<ConnectionState>,
    /// Only the write half lives behind a mutex. The read half is owned
    /// exclusively by the receive loop's call chain for the lifetime of one
    /// connection — never stored here — so a parked `recv()` can never hold
    /// up an outbound send.
    writer: Mutex<Option<TransportWriter>>,
    pending: Mutex<HashMap<i64, PendingSlot>>,
    next_id: AtomicI64,
    cancel: CancellationToken,
    // Handler seam (§9: "avoid runtime callback bags" — these are still set
    // post-construction because the handlers themselves (the invoker) need a
    // narrow handle back onto this engine, so the two can't be built in one
    // step without a cycle. `RwLock` breaks that without a back-reference.
    config_sink: RwLock<Option<Arc<dyn ConfigSink>>>,
    workflow_executor: RwLock<Option<Arc<dyn WorkflowExecutor>>>,
    tool_executor: RwLock<Option<Arc<dyn ToolExecutor>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionEngine {
    pub fn new(config: crate::types::RunnerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            cancel: CancellationToken::new(),
            config_sink: RwLock::new(None),
            workflow_executor: RwLock::new(None),
            tool_executor: RwLock::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub async fn set_config_sink(&self, sink: Arc<dyn ConfigSink>) {
        *self.config_sink.write().await = Some(sink);
    }

    pub async fn set_workflow_executor(&self, executor: Arc<dyn WorkflowExecutor>) {
        *self.workflow_executor.write().await = Some(executor);
    }

    pub async fn set_tool_executor(&self, executor: Arc<dyn ToolExecutor>) {
        *self.tool_executor.write().await = Some(executor);
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Idempotent. Opens the transport, performs the registration handshake,
    /// and — only once that succeeds — spawns the supervisor task that owns
    /// the receive loop, the heartbeat loop, and reconnection. Per §7, the
    /// only failures that propagate out of `start()` are authentication
    /// failure and the initial transport-open failure; everything after that
    /// is absorbed into the background reconnect loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), RunnerError> {
        if *self.state.read().await != ConnectionState::Disconnected {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.run_supervisor(Some(ready_tx)).await;
        });
        *self.supervisor.lock().await = Some(handle);

        ready_rx.await.unwrap_or(Err(RunnerError::ConnectionLost))
    }

    /// Idempotent. Cancels the supervisor and its children, fails every
    /// pending request with `ConnectionLost`, and closes the transport.
    pub async fn stop(self: &Arc<Self>) {
        self.cancel.cancel();
        *self.state.write().await = ConnectionState::Disconnected;
        self.fail_all_pending(RunnerError::ConnectionLost).await;

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.close().await;
        }

        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, RunnerError> {
        self.send_request_internal(method, params, timeout, true)
            .await
    }

    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), RunnerError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(RunnerError::NotConnected);
        }
        let note = codec::make_notification(method, params);
        let text =
            codec::encode(&note).map_err(|e| RunnerError::Protocol(e.to_string()))?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RunnerError::NotConnected)?;
        writer.send(text).await
    }

    /// Shared by the public `send_request` and the registration handshake,
    /// which must bypass the `Connected` precondition (invariant 5).
    async fn send_request_internal(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        require_connected: bool,
    ) -> Result<JsonRpcResponse, RunnerError> {
        if require_connected && *self.state.read().await != ConnectionState::Connected {
            return Err(RunnerError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = codec::make_request(id, method, params);
        let text = match codec::encode(&req) {
            Ok(t) => t,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(RunnerError::Protocol(e.to_string()));
            }
        };

        {
            let mut guard = self.writer.lock().await;
            let writer = match guard.as_mut() {
                Some(w) => w,
                None => {
                    self.pending.lock().await.remove(&id);
                    return Err(RunnerError::NotConnected);
                }
            };
            if let Err(e) = writer.send(text).await {
                self.pending.lock().await.remove(&id);
                return Err(e);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RunnerError::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RunnerError::Timeout)
            }
        }
    }

    async fn fail_all_pending(&self, err: RunnerError) {
        let mut pending = self.pending.lock().await;
        for (_, slot) in pending.drain() {
            let _ = slot.send(Err(match &err {
                RunnerError::ConnectionLost => RunnerError::ConnectionLost,
                RunnerError::Timeout => RunnerError::Timeout,
                other => RunnerError::Protocol(other.to_string()),
            }));
        }
    }

    /// Drives §4.3.4's state machine: connect, handshake, run, and on loss
    /// of the connection sleep with doubling backoff before retrying. `ready`
    /// is fired exactly once, on the outcome of the very first attempt.
    async fn run_supervisor(self: Arc<Self>, mut ready: Option<oneshot::Sender<Result<(), RunnerError>>>) {
        let mut delay = self.config.reconnect_delay_initial;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            *self.state.write().await = ConnectionState::Connecting;
            match self.connect_and_register().await {
                Ok((reader, writer)) => {
                    *self.writer.lock().await = Some(writer);
                    *self.state.write().await = ConnectionState::Connected;
                    delay = self.config.reconnect_delay_initial;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }

                    self.run_connected(reader).await;

                    if self.cancel.is_cancelled() {
                        return;
                    }
                    *self.state.write().await = ConnectionState::Reconnecting;
                    if let Some(mut writer) = self.writer.lock().await.take() {
                        writer.close().await;
                    }
                    self.fail_all_pending(RunnerError::ConnectionLost).await;
                }
                Err(RunnerError::AuthFailed { code, message }) => {
                    *self.state.write().await = ConnectionState::Disconnected;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(RunnerError::AuthFailed { code, message }));
                        return;
                    }
                    tracing::error!(code, message, "authentication failed; not reconnecting");
                    return;
                }
                Err(e) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e));
                        return;
                    }
                    tracing::warn!(error = %e, "reconnect attempt failed");
                    *self.state.write().await = ConnectionState::Reconnecting;
                }
            }

            tracing::info!(delay_ms = delay.as_millis() as u64, "sleeping before next connect attempt");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return,
            }
            delay = std::cmp::min(delay * 2, self.config.reconnect_delay_max);
        }
    }

    /// Opens a fresh transport and performs the `runner/register` handshake.
    /// Resolved with a dedicated inline loop rather than the pending table:
    /// the full receive loop and its handler dispatch only start once the
    /// handshake succeeds (invariant 5).
    async fn connect_and_register(&self) -> Result<(TransportReader, TransportWriter), RunnerError> {
        let (mut reader, mut writer) = transport::connect(&self.config.cp_url, &self.config.auth_token).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let params = serde_json::json!({
            "token": self.config.auth_token,
            "name": self.config.runner_name,
        });
        let req = codec::make_request(id, method::RUNNER_REGISTER, params);
        let text = codec::encode(&req).map_err(|e| RunnerError::Protocol(e.to_string()))?;
        writer.send(text).await?;

        loop {
            let raw = reader
                .recv()
                .await?
                .ok_or_else(|| RunnerError::Transport("connection closed during handshake".into()))?;
            let value: Value = codec::decode(&raw).map_err(|e| RunnerError::Protocol(e.to_string()))?;
            match codec::classify(value) {
                Frame::Response(resp) if resp.id == Value::from(id) => {
                    if let Some(err) = resp.error {
                        return Err(RunnerError::AuthFailed {
                            code: err.code,
                            message: err.message,
                        });
                    }
                    let ok = resp
                        .result
                        .as_ref()
                        .and_then(|r| r.get("status"))
                        .and_then(|s| s.as_str())
                        == Some("ok");
                    if !ok {
                        return Err(RunnerError::AuthFailed {
                            code: crate::types::error_code::AUTH_FAILED,
                            message: "registration did not confirm status ok".into(),
                        });
                    }
                    return Ok((reader, writer));
                }
                _ => continue,
            }
        }
    }

    /// Runs while `Connected`: spawns the heartbeat loop and drains the read
    /// half until it closes, errors, or the heartbeat watchdog declares the
    /// connection dead.
    async fn run_connected(self: &Arc<Self>, reader: TransportReader) {
        let conn_cancel = CancellationToken::new();
        let heartbeat_engine = self.clone();
        let heartbeat_token = conn_cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat_engine.run_heartbeat(heartbeat_token).await;
        });

        self.run_receive_loop(reader, conn_cancel.clone()).await;

        conn_cancel.cancel();
        let _ = heartbeat_handle.await;
    }

    /// Owns `reader` exclusively for the duration of one connection — no
    /// other task ever touches the read half, so there is nothing here for
    /// an outbound write to contend with.
    async fn run_receive_loop(self: &Arc<Self>, mut reader: TransportReader, conn_cancel: CancellationToken) {
        loop {
            let recv_result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = conn_cancel.cancelled() => return,
                result = reader.recv() => result,
            };

            let raw = match recv_result {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::warn!("transport closed by peer");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transport error; reconnecting");
                    return;
                }
            };

            let value: Value = match codec::decode(&raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparsable frame");
                    continue;
                }
            };

            match codec::classify(value) {
                Frame::Response(resp) => self.handle_response(resp).await,
                Frame::Request(req) => {
                    let engine = self.clone();
                    tokio::spawn(async move { engine.handle_request(req).await });
                }
                Frame::Notification(note) => {
                    let engine = self.clone();
                    tokio::spawn(async move { engine.handle_notification(note).await });
                }
                Frame::Malformed(v) => {
                    tracing::warn!(frame = %v, "malformed frame; discarded");
                }
            }
        }
    }

    async fn handle_response(&self, resp: JsonRpcResponse) {
        let id = match resp.id.as_i64() {
            Some(id) => id,
            None => {
                tracing::warn!("response with non-integer id; dropped");
                return;
            }
        };
        let slot = self.pending.lock().await.remove(&id);
        match slot {
            Some(tx) => {
                let _ = tx.send(Ok(resp));
            }
            None => {
                tracing::warn!(id, "late or unmatched response; dropped");
            }
        }
    }

    async fn handle_request(self: Arc<Self>, req: crate::types::JsonRpcRequest) {
        let result = self.dispatch(&req.method, req.params.clone()).await;
        let response = match result {
            Some(value) => codec::make_ok_response(req.id.clone(), value),
            None => codec::make_error_response(
                req.id.clone(),
                crate::types::error_code::METHOD_NOT_FOUND,
                format!("no handler registered for method '{}'", req.method),
            ),
        };
        self.write_back(response).await;
    }

    async fn handle_notification(self: Arc<Self>, note: crate::types::JsonRpcNotification) {
        let _ = self.dispatch(&note.method, note.params.clone()).await;
    }

    async fn dispatch(&self, method: &str, params: Value) -> Option<Value> {
        match method {
            crate::types::method::CONFIG_PUSH => match self.config_sink.read().await.clone() {
                Some(sink) => Some(sink.push(params).await),
                None => Some(serde_json::json!({"status": "error", "message": "no config sink installed"})),
            },
            crate::types::method::WORKFLOW_EXECUTE => match self.workflow_executor.read().await.clone() {
                Some(exec) => Some(exec.execute(params).await),
                None => None,
            },
            crate::types::method::TOOL_CALL => match self.tool_executor.read().await.clone() {
                Some(exec) => Some(exec.call(params).await),
                None => None,
            },
            _ => None,
        }
    }

    /// Takes the writer lock only for the duration of the encode+send — the
    /// read half is never part of this critical section.
    async fn write_back(&self, response: JsonRpcResponse) {
        let text = match codec::encode(&response) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound response");
                return;
            }
        };
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writer.send(text).await {
                tracing::warn!(error = %e, "failed to write response back; dropping");
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = cancel.cancelled() => return,
            }

            if *self.state.read().await != ConnectionState::Connected {
                return;
            }

            let params = serde_json::json!({ "timestamp": chrono::Utc::now().to_rfc3339() });
            match self.send_notification(method::RUNNER_HEARTBEAT, params).await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(error = %e, consecutive_failures, "heartbeat send failed");
                    if consecutive_failures >= 3 {
                        tracing::error!("heartbeat watchdog: connection treated as dead");
                        if let Some(mut writer) = self.writer.lock().await.take() {
                            writer.close().await;
                        }
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl OutboundLink for ConnectionEngine {
    async fn send_request(&self, method: &str, params: Value, timeout: Duration) -> Result<JsonRpcResponse, RunnerError> {
        ConnectionEngine::send_request(self, method, params, timeout).await
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), RunnerError> {
        ConnectionEngine::send_notification(self, method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> crate::types::RunnerConfig {
        crate::types::RunnerConfig {
            cp_url: "ws://127.0.0.1:1/does-not-matter".to_string(),
            auth_token: "tok".to_string(),
            runner_name: "test-runner".to_string(),
            reconnect_delay_initial: Duration::from_millis(1),
            reconnect_delay_max: Duration::from_millis(4),
            heartbeat_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let engine = ConnectionEngine::new(test_config());
        assert_eq!(engine.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn request_ids_are_monotonic() {
        let engine = ConnectionEngine::new(test_config());
        let first = engine.next_id.fetch_add(1, Ordering::SeqCst);
        let second = engine.next_id.fetch_add(1, Ordering::SeqCst);
        let third = engine.next_id.fetch_add(1, Ordering::SeqCst);
        assert_eq!((first, second, third), (1, 2, 3));
    }

    #[tokio::test]
    async fn send_request_fails_fast_when_not_connected() {
        let engine = ConnectionEngine::new(test_config());
        let err = engine
            .send_request("tool/proxy", serde_json::json!({}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotConnected));
    }

    #[tokio::test]
    async fn send_notification_fails_fast_when_not_connected() {
        let engine = ConnectionEngine::new(test_config());
        let err = engine
            .send_notification("runner/heartbeat", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotConnected));
    }

    #[tokio::test]
    async fn dispatch_returns_error_result_for_unhandled_request_method() {
        let engine = ConnectionEngine::new(test_config());
        let req = crate::types::JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(1),
            method: "config/push".to_string(),
            params: serde_json::json!({}),
        };
        let result = engine.dispatch(&req.method, req.params.clone()).await;
        assert_eq!(
            result,
            Some(serde_json::json!({"status": "error", "message": "no config sink installed"}))
        );
    }

    #[tokio::test]
    async fn dispatch_returns_none_for_unknown_method() {
        let engine = ConnectionEngine::new(test_config());
        assert_eq!(engine.dispatch("unknown/method", serde_json::json!({})).await, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent_before_start() {
        let engine = ConnectionEngine::new(test_config());
        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.state().await, ConnectionState::Disconnected);
    }
}
