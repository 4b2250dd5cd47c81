//! Typed publish/subscribe bridge between the headless client and the UI
//! that opens authorization popups.
//!
//! The client never navigates anywhere itself. It publishes
//! [`AuthEvent::PopupRequested`] and waits: the UI collaborator opens a
//! window and calls [`PopupBroker::confirm`] (or [`PopupBroker::reject`]),
//! and the redirect page eventually hands the authorization code back
//! through [`PopupBroker::deliver`].

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use rand::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, McpError};

/// Message type the redirect page posts back with the authorization code.
pub const CALLBACK_MESSAGE_TYPE: &str = "mcp-oauth-callback";

/// Redirect URL registered for this client when none is configured.
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:5173/oauth/callback";

const EVENT_CAPACITY: usize = 16;

/// Authorization lifecycle events published to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A popup should be opened at `authorization_url`.
    PopupRequested {
        /// Request id; also the OAuth `state` parameter.
        id: String,
        /// Server the authorization is for.
        server_url: String,
        /// URL to open in the popup.
        authorization_url: String,
        /// Protected-resource metadata URL advertised by the server.
        resource_metadata: Option<String>,
    },
    /// The collaborator opened the popup.
    PopupOpened {
        /// Request id.
        id: String,
        /// Handle the collaborator assigned to the window.
        handle: PopupHandle,
    },
    /// The authorization code arrived.
    AuthorizationCompleted {
        /// Request id.
        id: String,
    },
    /// The round trip was rejected, failed or timed out.
    AuthorizationFailed {
        /// Request id.
        id: String,
        /// Why.
        reason: String,
    },
}

/// Opaque handle for a popup window opened by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PopupHandle(pub String);

/// The message the redirect page posts back to the opener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackMessage {
    /// Must be [`CALLBACK_MESSAGE_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Origin of the posting window.
    pub origin: String,
    /// Authorization code on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// The `state` parameter echoed by the authorization server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// OAuth error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct PendingPopup {
    opened: Option<oneshot::Sender<Result<PopupHandle, String>>>,
    code: Option<oneshot::Sender<Result<String, String>>>,
}

struct Inner {
    events: broadcast::Sender<AuthEvent>,
    redirect_url: String,
    callback_origin: String,
    pending: DashMap<String, PendingPopup>,
}

/// Routes popup requests out to the UI and callbacks back to the waiting flow.
///
/// Cloning is cheap; clones share subscribers and pending requests.
#[derive(Clone)]
pub struct PopupBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PopupBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopupBroker")
            .field("redirect_url", &self.inner.redirect_url)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl Default for PopupBroker {
    fn default() -> Self {
        Self::new(DEFAULT_REDIRECT_URL)
    }
}

impl PopupBroker {
    /// Creates a broker that accepts callbacks from the origin of `redirect_url`.
    #[must_use]
    pub fn new(redirect_url: impl Into<String>) -> Self {
        let redirect_url = redirect_url.into();
        let callback_origin = url::Url::parse(&redirect_url)
            .map_or_else(|_| redirect_url.clone(), |u| u.origin().ascii_serialization());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                events,
                redirect_url,
                callback_origin,
                pending: DashMap::new(),
            }),
        }
    }

    /// The OAuth redirect URL.
    #[must_use]
    pub fn redirect_url(&self) -> &str {
        &self.inner.redirect_url
    }

    /// The only origin [`deliver`](Self::deliver) accepts messages from.
    #[must_use]
    pub fn callback_origin(&self) -> &str {
        &self.inner.callback_origin
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Generates a fresh, unguessable request id.
    #[must_use]
    pub fn new_request_id() -> String {
        let bytes: [u8; 16] = rng().random();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn publish(&self, event: AuthEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Publishes a popup request and waits for the authorization code.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Authorization`] if nobody is subscribed, the
    /// collaborator rejects, or the callback carries an error, and
    /// [`ErrorKind::Timeout`] if `timeout` elapses first.
    pub async fn request_authorization(
        &self,
        id: &str,
        server_url: &str,
        authorization_url: &str,
        resource_metadata: Option<String>,
        timeout: Duration,
    ) -> Result<String, McpError> {
        let (opened_tx, opened_rx) = oneshot::channel();
        let (code_tx, code_rx) = oneshot::channel();
        self.inner.pending.insert(
            id.to_owned(),
            PendingPopup {
                opened: Some(opened_tx),
                code: Some(code_tx),
            },
        );

        let requested = AuthEvent::PopupRequested {
            id: id.to_owned(),
            server_url: server_url.to_owned(),
            authorization_url: authorization_url.to_owned(),
            resource_metadata,
        };
        if self.inner.events.send(requested).is_err() {
            self.inner.pending.remove(id);
            return Err(McpError::authorization(
                "no popup collaborator is subscribed to authorization events",
            ));
        }
        info!(id, server_url, "authorization popup requested");

        let wait = async {
            let handle = opened_rx
                .await
                .map_err(|_| "popup request dropped".to_owned())??;
            self.publish(AuthEvent::PopupOpened {
                id: id.to_owned(),
                handle,
            });
            code_rx
                .await
                .map_err(|_| "popup request dropped".to_owned())?
        };
        let outcome = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(reason)) => Err(McpError::authorization(reason)),
            Err(_) => Err(McpError::new(
                ErrorKind::Timeout,
                format!("authorization popup not completed within {timeout:?}"),
            )),
        };
        self.inner.pending.remove(id);

        match &outcome {
            Ok(_) => self.publish(AuthEvent::AuthorizationCompleted { id: id.to_owned() }),
            Err(err) => {
                warn!(id, error = %err, "authorization failed");
                self.publish(AuthEvent::AuthorizationFailed {
                    id: id.to_owned(),
                    reason: err.message.clone(),
                });
            }
        }
        outcome
    }

    /// Reports that the popup for `id` was opened.
    ///
    /// Returns `false` if no request with that id is waiting for a popup.
    pub fn confirm(&self, id: &str, handle: PopupHandle) -> bool {
        let Some(mut pending) = self.inner.pending.get_mut(id) else {
            return false;
        };
        pending
            .opened
            .take()
            .is_some_and(|tx| tx.send(Ok(handle)).is_ok())
    }

    /// Rejects the request `id`, before or after its popup opened.
    ///
    /// Returns `false` if no such request is pending.
    pub fn reject(&self, id: &str, reason: impl Into<String>) -> bool {
        let Some(mut pending) = self.inner.pending.get_mut(id) else {
            return false;
        };
        let reason = reason.into();
        if let Some(tx) = pending.opened.take() {
            return tx.send(Err(reason)).is_ok();
        }
        pending
            .code
            .take()
            .is_some_and(|tx| tx.send(Err(reason)).is_ok())
    }

    /// Delivers a message posted by the redirect page.
    ///
    /// Messages of another type or from another origin are ignored, as are
    /// messages whose `state` matches no pending request. Returns `true` if
    /// the message resolved a pending request.
    pub fn deliver(&self, message: CallbackMessage) -> bool {
        if message.kind != CALLBACK_MESSAGE_TYPE || message.origin != self.inner.callback_origin {
            debug!(kind = %message.kind, origin = %message.origin, "ignoring foreign message");
            return false;
        }
        let Some(state) = message.state.as_deref() else {
            debug!("callback message without state");
            return false;
        };
        let Some(mut pending) = self.inner.pending.get_mut(state) else {
            debug!(state, "callback for unknown request");
            return false;
        };
        let outcome = match (message.code, message.error) {
            (_, Some(error)) => Err(format!("authorization server returned {error}")),
            (Some(code), None) => Ok(code),
            (None, None) => Err("callback carried neither code nor error".to_owned()),
        };
        pending
            .code
            .take()
            .is_some_and(|tx| tx.send(outcome).is_ok())
    }
}
