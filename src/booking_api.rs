// REST access to the bookings backend: payment intents, booking creation,
// booking queries and the admin status update.

use crate::config::StorefrontConfig;
use crate::models::{
    Booking, BookingConfirmation, BookingStatus, CreateBookingRequest, PaymentIntent,
    PaymentIntentRequest, StatusUpdateRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("API error: {status_code} - {message}")]
    ApiResponseError {
        status_code: u16,
        message: String,
        is_retryable: bool,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Client error: {0}")]
    ClientError(String),
}

impl ApiError {
    // True when the request may have taken effect on the backend even though
    // no success was observed: transport failures, 5xx, unreadable 2xx bodies
    pub fn outcome_unknown(&self) -> bool {
        match self {
            ApiError::NetworkError(_) | ApiError::Timeout(_) | ApiError::InvalidResponse(_) => {
                true
            }
            ApiError::ApiResponseError { status_code, .. } => *status_code >= 500,
            ApiError::NotFound(_) | ApiError::ClientError(_) => false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ClientStats {
    pub requests_sent: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub average_response_time_ms: f64,
    pub max_response_time_ms: f64,
}

// Operations the storefront needs from the bookings backend
#[async_trait]
pub trait BookingApi: Send + Sync + 'static {
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentIntent, ApiError>;

    // Void an intent whose booking never got created
    async fn cancel_payment_intent(&self, payment_intent_id: &str) -> Result<(), ApiError>;

    // The idempotency key lets the backend collapse retried submissions
    async fn create_booking(
        &self,
        request: &CreateBookingRequest,
        idempotency_key: &str,
    ) -> Result<BookingConfirmation, ApiError>;

    // Most recent first; the ordering is the backend's
    async fn get_user_bookings(&self, user_id: &str) -> Result<Vec<Booking>, ApiError>;

    async fn get_booking(&self, id_or_reference: &str) -> Result<Booking, ApiError>;

    // Admin surface only
    async fn update_booking_status(&self, id: &str, status: BookingStatus)
        -> Result<(), ApiError>;
}

pub struct HttpBookingClient {
    http: Client,
    base_url: Url,
    auth_token: Option<String>,
    timeout_ms: u64,
    stats: Mutex<ClientStats>,
}

impl std::fmt::Debug for HttpBookingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBookingClient")
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

// Error bodies the backend sends: {"message": ...} or {"error": ...}
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

impl HttpBookingClient {
    pub fn new(config: &StorefrontConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ApiError::ClientError(e.to_string()))?;

        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ApiError::ClientError(format!("invalid base url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::ClientError(format!(
                "invalid base url: {}",
                config.base_url
            )));
        }

        Ok(Self {
            http,
            base_url,
            auth_token: config.auth_token.clone(),
            timeout_ms: config.timeout_ms,
            stats: Mutex::new(ClientStats::default()),
        })
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.lock().clone()
    }

    /// `/api/bookings` under the base URL followed by `segments`, each one
    /// percent-encoded as a single path segment.
    pub fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(ApiError::ClientError(format!(
                "invalid path segment: {:?}",
                bad
            )));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::ClientError("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["api", "bookings"])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ApiError> {
        let builder = self.http.request(method, self.url(segments)?);
        Ok(match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    // Send, time and classify one request; non-2xx becomes an ApiError
    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let started = Instant::now();
        let outcome = match builder.send().await {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => Err(error_from_response(response).await),
            Err(e) => Err(self.transport_error(e)),
        };
        self.record(started.elapsed(), outcome.is_ok());
        outcome
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(builder).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        parse_json(&body)
    }

    fn transport_error(&self, error: reqwest::Error) -> ApiError {
        if error.is_timeout() {
            ApiError::Timeout(self.timeout_ms)
        } else {
            ApiError::NetworkError(error.to_string())
        }
    }

    fn record(&self, elapsed: Duration, succeeded: bool) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock();
        stats.requests_sent += 1;
        if succeeded {
            stats.requests_succeeded += 1;
        } else {
            stats.requests_failed += 1;
        }
        let n = stats.requests_sent as f64;
        stats.average_response_time_ms += (elapsed_ms - stats.average_response_time_ms) / n;
        stats.max_response_time_ms = stats.max_response_time_ms.max(elapsed_ms);
    }
}

#[async_trait]
impl BookingApi for HttpBookingClient {
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentIntent, ApiError> {
        debug!(%amount, currency, "Requesting payment intent");
        let body = PaymentIntentRequest {
            amount,
            currency: currency.to_string(),
        };
        let builder = self.request(Method::POST, &["payment-intent"])?.json(&body);
        self.send_json(builder).await
    }

    async fn cancel_payment_intent(&self, payment_intent_id: &str) -> Result<(), ApiError> {
        let builder =
            self.request(Method::POST, &["payment-intent", payment_intent_id, "cancel"])?;
        self.send(builder).await?;
        Ok(())
    }

    async fn create_booking(
        &self,
        request: &CreateBookingRequest,
        idempotency_key: &str,
    ) -> Result<BookingConfirmation, ApiError> {
        debug!(items = request.items.len(), idempotency_key, "Creating booking");
        let builder = self
            .request(Method::POST, &[])?
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(request);
        self.send_json(builder).await
    }

    async fn get_user_bookings(&self, user_id: &str) -> Result<Vec<Booking>, ApiError> {
        let builder = self.request(Method::GET, &["user", user_id])?;
        self.send_json(builder).await
    }

    async fn get_booking(&self, id_or_reference: &str) -> Result<Booking, ApiError> {
        let builder = self.request(Method::GET, &[id_or_reference])?;
        match self.send_json(builder).await {
            Err(ApiError::ApiResponseError {
                status_code: 404, ..
            }) => Err(ApiError::NotFound(id_or_reference.to_string())),
            other => other,
        }
    }

    async fn update_booking_status(
        &self,
        id: &str,
        status: BookingStatus,
    ) -> Result<(), ApiError> {
        let body = StatusUpdateRequest { status };
        let builder = self.request(Method::PUT, &[id, "status"])?.json(&body);
        self.send(builder).await?;
        Ok(())
    }
}

async fn error_from_response(response: Response) -> ApiError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    let error = api_error(status, &body);
    warn!(status = status.as_u16(), %error, "Backend request failed");
    error
}

// Prefer the server's own message, fall back to the status text
fn api_error(status: StatusCode, body: &[u8]) -> ApiError {
    let server_message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .filter(|m| !m.trim().is_empty());

    let message = server_message.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    });

    ApiError::ApiResponseError {
        status_code: status.as_u16(),
        message,
        is_retryable: status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}
