//! The remote rate source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::RateError;
use crate::http_client::{HttpAuth, HttpClient, HttpRequest, ReqwestHttpClient};
use crate::value::RateValue;
use crate::BoxFuture;

/// Object fields accepted as the rate, in lookup order.
const RATE_FIELDS: [&str; 3] = ["percentage", "rate", "value"];

/// Performs the single remote call that yields a rate.
pub trait RateSource: Send + Sync {
    /// Stable identifier used in errors, logs and alerts.
    fn id(&self) -> &str;

    fn fetch<'a>(&'a self) -> BoxFuture<'a, Result<RateValue, RateError>>;
}

/// Rate source over one HTTP GET endpoint.
#[derive(Clone)]
pub struct HttpRateSource {
    id: String,
    url: String,
    auth: HttpAuth,
    timeout: Duration,
    client: Arc<dyn HttpClient>,
}

impl HttpRateSource {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_client(id, url, Arc::new(ReqwestHttpClient::default()))
    }

    pub fn with_client(id: impl Into<String>, url: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            auth: HttpAuth::None,
            timeout: Duration::from_secs(10),
            client,
        }
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Transport timeout; the breaker's call timeout still applies on top.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RateSource for HttpRateSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch<'a>(&'a self) -> BoxFuture<'a, Result<RateValue, RateError>> {
        Box::pin(async move {
            debug!(source = %self.id, url = %self.url, "fetching rate from remote source");
            let request = HttpRequest::get(&self.url)
                .with_auth(&self.auth)
                .with_timeout(self.timeout);

            let response = self
                .client
                .execute(request)
                .await
                .map_err(|error| RateError::transient(error.message()))?;

            if !response.is_success() {
                return Err(classify_status(response.status));
            }

            let rate = parse_rate_body(&response.body)?;
            info!(source = %self.id, %rate, "rate obtained from remote source");
            Ok(rate)
        })
    }
}

/// 408, 429 and 5xx are worth retrying; any other non-2xx is not.
pub fn classify_status(status: u16) -> RateError {
    if status == 408 || status == 429 || (500..600).contains(&status) {
        RateError::transient(format!("upstream returned status {status}"))
    } else {
        RateError::terminal(format!("upstream returned status {status}"))
    }
}

/// Extract a rate from a response body.
///
/// Accepts a bare number, a JSON string, an object with a `percentage`,
/// `rate` or `value` field, or plain decimal text. Anything else, including a
/// negative rate, is a terminal error.
pub fn parse_rate_body(body: &str) -> Result<RateValue, RateError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(RateError::terminal("empty response body"));
    }

    let parsed = match serde_json::from_str::<Value>(trimmed) {
        // parse the original text so scale survives ("0.10" stays 0.10)
        Ok(Value::Number(_)) => RateValue::parse(trimmed),
        Ok(Value::String(text)) => RateValue::parse(&text),
        Ok(Value::Object(fields)) => {
            let (name, field) = RATE_FIELDS
                .iter()
                .find_map(|name| fields.get(*name).map(|field| (*name, field)))
                .ok_or_else(|| RateError::terminal(format!("no rate field in body: {trimmed}")))?;
            match field {
                Value::Number(_) => RateValue::parse(raw_field(trimmed, name)?.get()),
                Value::String(text) => RateValue::parse(text),
                other => return Err(RateError::terminal(format!("unsupported rate field value: {other}"))),
            }
        }
        Ok(other) => return Err(RateError::terminal(format!("unsupported rate body: {other}"))),
        Err(_) => RateValue::parse(trimmed),
    };

    parsed.map_err(|error| RateError::terminal(error.to_string()))
}

/// Written JSON text of one top-level field, so a number keeps its scale.
fn raw_field<'a>(body: &'a str, name: &str) -> Result<&'a RawValue, RateError> {
    let mut fields: HashMap<String, &'a RawValue> =
        serde_json::from_str(body).map_err(|error| RateError::terminal(error.to_string()))?;
    fields
        .remove(name)
        .ok_or_else(|| RateError::terminal(format!("no rate field in body: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpError, HttpResponse};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct CannedClient {
        outcome: Result<HttpResponse, HttpError>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl HttpClient for CannedClient {
        fn execute<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, Result<HttpResponse, HttpError>> {
            self.seen.lock().expect("lock").push(request);
            let outcome = self.outcome.clone();
            Box::pin(async move { outcome })
        }
    }

    fn source(outcome: Result<HttpResponse, HttpError>) -> (HttpRateSource, Arc<CannedClient>) {
        let client = Arc::new(CannedClient {
            outcome,
            seen: Mutex::new(Vec::new()),
        });
        let source = HttpRateSource::with_client("rate-api", "https://rates.example.test/percentage", client.clone())
            .with_auth(HttpAuth::BearerToken(String::from("t")));
        (source, client)
    }

    #[test]
    fn body_shapes() {
        assert_eq!(parse_rate_body("0.10").expect("bare").to_string(), "0.10");
        assert_eq!(parse_rate_body("\"0.12\"").expect("string").as_decimal(), dec!(0.12));
        assert_eq!(
            parse_rate_body(r#"{"percentage": 0.15}"#).expect("object").as_decimal(),
            dec!(0.15)
        );
        assert_eq!(parse_rate_body(r#"{"rate":"0.2"}"#).expect("rate").as_decimal(), dec!(0.2));
        assert_eq!(
            parse_rate_body(r#"{"percentage":0.10}"#).expect("object").to_string(),
            "0.10"
        );
        assert_eq!(
            parse_rate_body(r#"{"value": 0.1250, "note": "x"}"#).expect("value").to_string(),
            "0.1250"
        );
        assert_eq!(parse_rate_body(" 0.3\n").expect("text").as_decimal(), dec!(0.3));
    }

    #[test]
    fn malformed_bodies_are_terminal() {
        for body in ["", "[1]", r#"{"other":1}"#, "-0.1", "ten", r#"{"value":true}"#] {
            let error = parse_rate_body(body).expect_err(body);
            assert!(matches!(error, RateError::TerminalRemote { .. }), "{body}: {error}");
        }
    }

    #[test]
    fn status_classification() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(matches!(classify_status(status), RateError::TransientRemote { .. }));
        }
        for status in [400, 401, 403, 404] {
            assert!(matches!(classify_status(status), RateError::TerminalRemote { .. }));
        }
    }

    #[tokio::test]
    async fn fetch_sends_authenticated_get() {
        let (source, client) = source(Ok(HttpResponse::ok(r#"{"value": "0.10"}"#)));

        assert_eq!(source.fetch().await.expect("rate").to_string(), "0.10");
        let seen = client.seen.lock().expect("lock");
        assert_eq!(seen[0].url, "https://rates.example.test/percentage");
        assert_eq!(seen[0].headers.get("authorization").map(String::as_str), Some("Bearer t"));
    }

    #[tokio::test]
    async fn transport_errors_are_transient() {
        let (source, _) = source(Err(HttpError::timeout("request timeout")));
        assert_eq!(source.fetch().await, Err(RateError::transient("request timeout")));
    }
}
