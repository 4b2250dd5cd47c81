//! One-shot recovery from unauthorized failures.
//!
//! ```text
//! Calling ──ok──────────────────────────────▶ Done
//!    │ ──other error────────────────────────▶ Failed
//!    └─unauthorized─▶ AwaitingAuth ─▶ Replaying ─▶ Done | Failed
//! ```
//!
//! AwaitingAuth runs the popup round trip, exchanges the code, closes and
//! resets the transport and invalidates the RPC session. Replaying issues
//! the operation exactly once more and its outcome is final.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::rpc::RpcClient;

/// Serializes authorization round trips on one connection.
///
/// The generation counter advances each time a round trip completes, so a
/// call that failed before another call finished authorizing can skip the
/// popup and go straight to its replay.
#[derive(Debug, Default)]
pub struct AuthGate {
    lock: Mutex<()>,
    generation: AtomicU64,
}

impl AuthGate {
    /// Number of completed authorization round trips.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Runs `operation`, recovering once from an unauthorized failure.
///
/// Errors are prefixed with `context`.
///
/// # Errors
///
/// Returns the first error if it is not [`Unauthorized`], the recovery
/// error if authorization fails, or the replay's error.
///
/// [`Unauthorized`]: crate::ErrorKind::Unauthorized
pub async fn with_auth_retry<T, F, Fut>(
    rpc: &RpcClient,
    gate: &AuthGate,
    context: &str,
    operation: F,
) -> Result<T, McpError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, McpError>>,
{
    let observed = gate.generation();
    match operation().await {
        Ok(value) => return Ok(value),
        Err(err) if !err.is_unauthorized() => return Err(err.context(context)),
        Err(err) => debug!(context, error = %err, "unauthorized, starting recovery"),
    }

    recover(rpc, gate, observed)
        .await
        .map_err(|e| e.context(context))?;
    operation().await.map_err(|e| e.context(context))
}

async fn recover(rpc: &RpcClient, gate: &AuthGate, observed: u64) -> Result<(), McpError> {
    let _guard = gate.lock.lock().await;
    if gate.generation() != observed {
        debug!("authorization completed by a concurrent call");
        return Ok(());
    }

    let transport = rpc.transport();
    let code = transport.authorize().await?;
    transport.finish_auth(&code).await?;
    if let Err(error) = transport.close().await {
        warn!(%error, "closing transport after authorization failed");
    }
    transport.reset();
    rpc.invalidate().await;
    gate.generation.fetch_add(1, Ordering::SeqCst);
    info!("authorization recovered, replaying");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::{Transport, TransportKind, TransportState};
    use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Answers 401 to everything until a code exchange succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        state: TransportState,
        authorized: AtomicBool,
        accept_code: bool,
        authorize_calls: AtomicUsize,
        initialize_calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn accepting() -> Self {
            Self {
                accept_code: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Channel
        }

        async fn start(&self) -> Result<(), McpError> {
            self.state.mark_started()
        }

        fn is_started(&self) -> bool {
            self.state.is_started()
        }

        async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
            self.state.ensure_started()?;
            if request.method == "initialize" {
                self.initialize_calls.fetch_add(1, Ordering::SeqCst);
            }
            if !self.authorized.load(Ordering::SeqCst) {
                return Err(McpError::unauthorized("no token"));
            }
            let result = match request.method.as_str() {
                "initialize" => json!({
                    "protocolVersion": "2025-06-18",
                    "serverInfo": { "name": "scripted" }
                }),
                _ => json!({ "ok": true }),
            };
            Ok(JsonRpcResponse::success(request.id, result))
        }

        async fn notify(&self, _notification: JsonRpcNotification) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            self.state.cancel();
            Ok(())
        }

        fn reset(&self) {
            self.state.reset();
        }

        async fn authorize(&self) -> Result<String, McpError> {
            self.authorize_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("code".to_owned())
        }

        async fn finish_auth(&self, code: &str) -> Result<(), McpError> {
            assert_eq!(code, "code");
            if self.accept_code {
                self.authorized.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn session(transport: &Arc<ScriptedTransport>) -> RpcClient {
        RpcClient::new(Arc::clone(transport) as Arc<dyn Transport>)
    }

    #[tokio::test]
    async fn test_unauthorized_recovers_and_replays_once() {
        let transport = Arc::new(ScriptedTransport::accepting());
        let rpc = session(&transport);
        let gate = AuthGate::default();

        let value = with_auth_retry(&rpc, &gate, "tools/list", || rpc.raw("tools/list", None))
            .await
            .unwrap();
        assert_eq!(value, json!({ "ok": true }));
        assert_eq!(transport.authorize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.initialize_calls.load(Ordering::SeqCst), 2);
        assert_eq!(gate.generation(), 1);
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_terminal() {
        let transport = Arc::new(ScriptedTransport::default());
        let rpc = session(&transport);
        let gate = AuthGate::default();

        let err = with_auth_retry(&rpc, &gate, "tools/list", || rpc.raw("tools/list", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
        assert!(err.message.starts_with("tools/list: "));
        assert_eq!(transport.authorize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_skip_recovery() {
        let transport = Arc::new(ScriptedTransport::accepting());
        let rpc = session(&transport);
        let gate = AuthGate::default();

        let err = with_auth_retry(&rpc, &gate, "prompts/get", || async {
            Err::<(), _>(McpError::parse("bad prompt"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.message, "prompts/get: bad prompt");
        assert_eq!(transport.authorize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_calls_share_one_popup() {
        let transport = Arc::new(ScriptedTransport::accepting());
        let rpc = session(&transport);
        let gate = AuthGate::default();

        let (a, b) = tokio::join!(
            with_auth_retry(&rpc, &gate, "a", || rpc.raw("tools/list", None)),
            with_auth_retry(&rpc, &gate, "b", || rpc.raw("prompts/list", None)),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.authorize_calls.load(Ordering::SeqCst), 1);
    }
}
