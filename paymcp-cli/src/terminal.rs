//! Terminal stand-in for the OAuth popup.
//!
//! There is no window to open from a terminal, so the authorization URL is
//! printed instead. After approving in a browser the user pastes the URL the
//! browser was redirected to; it is turned into the same callback message a
//! redirect page would post back.

use std::io::Write;

use paymcp_mcp::auth::{AuthEvent, CALLBACK_MESSAGE_TYPE, CallbackMessage, PopupBroker, PopupHandle};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Handle name reported for the terminal "window".
pub const TERMINAL_HANDLE: &str = "terminal";

/// Serves popup requests from `broker` on stdin/stderr until the broker is
/// dropped.
#[must_use]
pub fn spawn(broker: &PopupBroker) -> JoinHandle<()> {
    let events = broker.subscribe();
    let broker = broker.clone();
    tokio::spawn(serve(broker, events, BufReader::new(tokio::io::stdin())))
}

async fn serve<R>(
    broker: PopupBroker,
    mut events: tokio::sync::broadcast::Receiver<AuthEvent>,
    input: R,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let (id, server_url, authorization_url) = match events.recv().await {
            Ok(AuthEvent::PopupRequested {
                id,
                server_url,
                authorization_url,
                ..
            }) => (id, server_url, authorization_url),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "missed authorization events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(
                err,
                "\n{server_url} requires authorization. Open this URL in a browser:\n\n  {authorization_url}\n\nThen paste the URL you were redirected to:"
            );
        }
        broker.confirm(&id, PopupHandle(TERMINAL_HANDLE.to_owned()));

        match lines.next_line().await {
            Ok(Some(line)) => match parse_callback(&line) {
                Ok(message) => {
                    if !broker.deliver(message) {
                        broker.reject(&id, "pasted URL does not match the pending authorization");
                    }
                }
                Err(e) => {
                    broker.reject(&id, format!("not a redirect URL: {e}"));
                }
            },
            Ok(None) => {
                broker.reject(&id, "input closed");
                break;
            }
            Err(e) => {
                broker.reject(&id, format!("cannot read input: {e}"));
                break;
            }
        }
    }
}

/// Builds a callback message from a pasted redirect URL.
///
/// # Errors
///
/// Returns the parse error if `input` is not an absolute URL.
pub fn parse_callback(input: &str) -> Result<CallbackMessage, url::ParseError> {
    let url = url::Url::parse(input.trim())?;
    let mut message = CallbackMessage {
        kind: CALLBACK_MESSAGE_TYPE.to_owned(),
        origin: url.origin().ascii_serialization(),
        code: None,
        state: None,
        error: None,
    };
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => message.code = Some(value.into_owned()),
            "state" => message.state = Some(value.into_owned()),
            "error" => message.error = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_callback() {
        let message =
            parse_callback(" http://localhost:5173/oauth/callback?code=abc%2F1&state=req-1\n")
                .unwrap();
        assert_eq!(message.kind, CALLBACK_MESSAGE_TYPE);
        assert_eq!(message.origin, "http://localhost:5173");
        assert_eq!(message.code.as_deref(), Some("abc/1"));
        assert_eq!(message.state.as_deref(), Some("req-1"));
        assert_eq!(message.error, None);

        let denied =
            parse_callback("http://localhost:5173/cb?error=access_denied&state=s").unwrap();
        assert_eq!(denied.error.as_deref(), Some("access_denied"));
        assert!(parse_callback("code=abc").is_err());
    }

    #[tokio::test]
    async fn test_pasted_url_completes_authorization() {
        let broker = PopupBroker::new("http://localhost:5173/oauth/callback");
        let input: &[u8] = b"http://localhost:5173/oauth/callback?code=the-code&state=req-1\n";
        let task = tokio::spawn(serve(broker.clone(), broker.subscribe(), input));

        let code = broker
            .request_authorization(
                "req-1",
                "https://mcp.example.com",
                "https://auth.example.com/authorize?state=req-1",
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(code, "the-code");
        task.abort();
    }

    #[tokio::test]
    async fn test_foreign_origin_is_rejected() {
        let broker = PopupBroker::new("http://localhost:5173/oauth/callback");
        let input: &[u8] = b"http://evil.example/oauth/callback?code=stolen&state=req-2\n";
        let task = tokio::spawn(serve(broker.clone(), broker.subscribe(), input));

        let err = broker
            .request_authorization(
                "req-2",
                "https://mcp.example.com",
                "https://auth.example.com/authorize?state=req-2",
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
        task.abort();
    }
}
