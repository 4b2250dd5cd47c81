use http::{Extensions, HeaderValue, StatusCode};
use paymcp::proto::SettleResponse;
use paymcp::{PaymentError, PaymentNegotiator};
use reqwest::{Request, Response, ResponseBuilderExt, Url};
use reqwest_middleware as rqm;
use tracing::{debug, info, instrument, trace, warn};

use crate::constants::{X_PAYMENT_HEADER, X_PAYMENT_RESPONSE_HEADER};
use crate::error::HttpError;
use crate::headers;

/// Correlation id for a paid request, supplied through request extensions.
///
/// When absent, the id is taken from the selected requirement's `extra.ctxId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCallId(pub String);

/// Reqwest middleware that pays `402 Payment Required` responses.
///
/// On success the decoded receipt is moved from the `X-PAYMENT-RESPONSE`
/// header into the response extensions as a [`SettleResponse`].
#[derive(Debug, Clone)]
pub struct PaymentMiddleware {
    negotiator: PaymentNegotiator,
}

impl PaymentMiddleware {
    /// Creates the middleware around a configured negotiator.
    #[must_use]
    pub const fn new(negotiator: PaymentNegotiator) -> Self {
        Self { negotiator }
    }
}

#[instrument(name = "paymcp.reqwest.next", skip_all)]
async fn run_next(
    next: rqm::Next<'_>,
    req: Request,
    extensions: &mut Extensions,
) -> rqm::Result<Response> {
    next.run(req, extensions).await
}

/// Head of a response whose body was consumed while looking for a challenge.
struct ResponseHead {
    status: StatusCode,
    version: http::Version,
    headers: http::HeaderMap,
    url: Url,
}

impl ResponseHead {
    fn of(response: &Response) -> Self {
        Self {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
            url: response.url().clone(),
        }
    }

    /// Reassembles the response around the already-read `body`.
    fn rebuild(self, body: Vec<u8>) -> rqm::Result<Response> {
        let mut response = http::Response::builder()
            .url(self.url)
            .body(body)
            .map_err(rqm::Error::middleware)?;
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        *response.version_mut() = self.version;
        Ok(Response::from(response))
    }
}

fn decode_receipt(response: &Response) -> Option<SettleResponse> {
    let value = response.headers().get(X_PAYMENT_RESPONSE_HEADER)?;
    let decoded = value
        .to_str()
        .map_err(|e| e.to_string())
        .and_then(|s| headers::decode_payment_response(s).map_err(|e| e.to_string()));
    match decoded {
        Ok(receipt) => Some(receipt),
        Err(error) => {
            warn!(%error, "undecodable payment receipt ignored");
            None
        }
    }
}

#[async_trait::async_trait]
impl rqm::Middleware for PaymentMiddleware {
    #[instrument(name = "paymcp.reqwest.handle", skip_all, err)]
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        let retry_req = req.try_clone();
        let res = run_next(next.clone(), req, extensions).await?;

        if res.status() != StatusCode::PAYMENT_REQUIRED {
            trace!(status = ?res.status(), "No payment required, returning response");
            return Ok(res);
        }

        let head = ResponseHead::of(&res);
        let body = res.bytes().await?.to_vec();

        let Some(required) = headers::parse_payment_required_body(&body) else {
            debug!("402 without an x402 challenge body");
            return head.rebuild(body);
        };
        let Some(selected) = self.negotiator.select(&required) else {
            return head.rebuild(body);
        };
        let Some(mut retry) = retry_req else {
            return Err(rqm::Error::middleware(HttpError::RequestNotCloneable));
        };

        info!(url = %retry.url(), "Received 402 Payment Required, processing payment");
        let call_id = extensions.get::<PaymentCallId>().map(|id| id.0.clone());
        let authorization = self
            .negotiator
            .authorize(selected, call_id.as_deref())
            .await
            .map_err(|e| rqm::Error::middleware(HttpError::Payment(e)))?;
        let ctx_id = authorization.ctx_id.as_deref();

        let header = authorization
            .header_value()
            .map_err(HttpError::from)
            .and_then(|v| Ok(HeaderValue::from_str(&v)?));
        let header = match header {
            Ok(header) => header,
            Err(err) => {
                self.negotiator.conclude(ctx_id, false, None);
                return Err(rqm::Error::middleware(err));
            }
        };
        retry.headers_mut().insert(X_PAYMENT_HEADER, header);

        trace!(url = %retry.url(), "Retrying request with payment header");
        let mut paid = match run_next(next, retry, extensions).await {
            Ok(paid) => paid,
            Err(err) => {
                self.negotiator.conclude(ctx_id, false, None);
                return Err(err);
            }
        };

        if paid.status() == StatusCode::PAYMENT_REQUIRED {
            self.negotiator.conclude(ctx_id, false, None);
            return Err(rqm::Error::middleware(HttpError::Payment(
                PaymentError::RepeatedPaymentRequired(paid.url().to_string()),
            )));
        }

        let success = paid.status().is_success();
        let receipt = if ctx_id.is_some() { decode_receipt(&paid) } else { None };
        self.negotiator.conclude(ctx_id, success, receipt.clone());

        if success {
            paid.headers_mut().remove(X_PAYMENT_RESPONSE_HEADER);
            if let Some(receipt) = receipt {
                paid.extensions_mut().insert(receipt);
            }
        }
        Ok(paid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ReqwestWithPayments, ReqwestWithPaymentsBuild};
    use alloy_signer_local::PrivateKeySigner;
    use paymcp::amount::TokenAmount;
    use paymcp::ledger::InMemoryLedger;
    use paymcp::policy::PaymentPolicy;
    use paymcp_evm::Eip155ExactSigner;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn challenge(network: &str) -> serde_json::Value {
        json!({
            "x402Version": 1,
            "error": "X-PAYMENT header is required",
            "accepts": [{
                "scheme": "exact",
                "network": network,
                "maxAmountRequired": "1000",
                "resource": "https://api.example/report",
                "mimeType": "application/json",
                "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                "maxTimeoutSeconds": 60,
                "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
                "extra": { "name": "USDC", "version": "2", "ctxId": "tx-42" }
            }]
        })
    }

    fn client(ledger: Arc<InMemoryLedger>) -> rqm::ClientWithMiddleware {
        client_over(reqwest::Client::new(), ledger)
    }

    fn client_over(
        inner: reqwest::Client,
        ledger: Arc<InMemoryLedger>,
    ) -> rqm::ClientWithMiddleware {
        let key: PrivateKeySigner =
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".parse().unwrap();
        let negotiator = PaymentNegotiator::new(
            PaymentPolicy::new("base-sepolia", TokenAmount::from(10_000)),
            Arc::new(Eip155ExactSigner::new(key)),
            ledger,
        );
        inner.with_payments(PaymentMiddleware::new(negotiator)).build()
    }

    #[tokio::test]
    async fn test_non_402_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/free"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let ledger = Arc::new(InMemoryLedger::new());
        let res = client(ledger.clone())
            .get(format!("{}/free", server.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(res.text().await.unwrap(), "ok");
        assert!(ledger.results().is_empty());
    }

    #[tokio::test]
    async fn test_pays_once_and_records_receipt() {
        let server = MockServer::start().await;
        let receipt = headers::encode_payment_response(&SettleResponse {
            success: true,
            error_reason: None,
            transaction: Some("0xfeed".to_owned()),
            network: Some("base-sepolia".to_owned()),
            payer: None,
        })
        .unwrap();
        Mock::given(method("GET"))
            .and(path("/report"))
            .and(header_exists(X_PAYMENT_HEADER))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(X_PAYMENT_RESPONSE_HEADER, receipt.as_str())
                    .set_body_string("paid content"),
            )
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/report"))
            .respond_with(ResponseTemplate::new(402).set_body_json(challenge("base-sepolia")))
            .expect(1)
            .mount(&server)
            .await;

        let ledger = Arc::new(InMemoryLedger::new());
        let res = client(ledger.clone())
            .get(format!("{}/report", server.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get(X_PAYMENT_RESPONSE_HEADER).is_none());
        assert_eq!(
            res.extensions().get::<SettleResponse>().unwrap().transaction.as_deref(),
            Some("0xfeed")
        );

        let result = ledger.result("tx-42").unwrap();
        assert!(result.success);
        assert_eq!(result.receipt.unwrap().transaction.as_deref(), Some("0xfeed"));
    }

    #[tokio::test]
    async fn test_unpayable_challenge_returns_original_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_json(challenge("polygon")))
            .expect(1)
            .mount(&server)
            .await;

        let ledger = Arc::new(InMemoryLedger::new());
        let url = format!("{}/report?page=2", server.uri());
        let res = client(ledger.clone()).get(&url).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(res.url().as_str(), url);
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["accepts"][0]["network"], "polygon");
        assert!(ledger.attempt("tx-42").is_none());
    }

    #[tokio::test]
    async fn test_second_402_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_json(challenge("base-sepolia")))
            .expect(2)
            .mount(&server)
            .await;

        let ledger = Arc::new(InMemoryLedger::new());
        let err = client(ledger.clone()).get(server.uri()).send().await.unwrap_err();
        assert!(err.to_string().contains("Payment required again"));
        assert!(!ledger.result("tx-42").unwrap().success);
    }

    #[tokio::test]
    async fn test_undecodable_receipt_still_records_one_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists(X_PAYMENT_HEADER))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(X_PAYMENT_RESPONSE_HEADER, "not base64 json!")
                    .set_body_string("paid content"),
            )
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_json(challenge("base-sepolia")))
            .expect(1)
            .mount(&server)
            .await;

        let ledger = Arc::new(InMemoryLedger::new());
        let res = client(ledger.clone()).get(server.uri()).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.extensions().get::<SettleResponse>().is_none());

        let results = ledger.results();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].receipt.is_none());
        assert!(ledger.pending().is_empty());
    }

    #[tokio::test]
    async fn test_failed_paid_retry_records_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists(X_PAYMENT_HEADER))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_json(challenge("base-sepolia")))
            .expect(1)
            .mount(&server)
            .await;

        let ledger = Arc::new(InMemoryLedger::new());
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let err = client_over(inner, ledger.clone())
            .get(server.uri())
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let results = ledger.results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(ledger.pending().is_empty());
    }
}
