//! Availability and booking collaborators
//!
//! The cart engine talks to the rental server through these two traits. The
//! HTTP implementation lives here too; tests substitute mocks.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CartError, CartResult};
use crate::models::{AvailabilityReport, BatchResult, BookingRequest, ResolvedRange};

/// Answers whether a quantity of an equipment entry is free over a date
/// range. Stateless per call and never cached: availability can change
/// between two adds to the same cart, so every admission re-verifies
/// current server state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    async fn check_availability(
        &self,
        equipment_id: i64,
        range: ResolvedRange,
        quantity: u32,
    ) -> CartResult<AvailabilityReport>;
}

/// Creates bookings from a cart in one batch round-trip. The server may
/// report partial success; the full per-item result comes back as data.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookingGateway: Send + Sync {
    async fn submit_batch(&self, requests: Vec<BookingRequest>) -> CartResult<BatchResult>;
}

/// JSON API client for the rental server, implementing both collaborators.
#[derive(Clone)]
pub struct HttpReservationClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpReservationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> CartResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CartError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AvailabilityChecker for HttpReservationClient {
    async fn check_availability(
        &self,
        equipment_id: i64,
        range: ResolvedRange,
        quantity: u32,
    ) -> CartResult<AvailabilityReport> {
        let url = format!("{}/equipment/{}/availability", self.base_url, equipment_id);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("start_date", range.start.to_string()),
                ("end_date", range.end.to_string()),
                ("quantity", quantity.to_string()),
            ])
            .send()
            .await
            .map_err(|e| CartError::Availability(format!("Request to {} failed: {}", url, e)))?
            .error_for_status()
            .map_err(|e| CartError::Availability(format!("Availability check rejected: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| CartError::Availability(format!("Invalid availability response: {}", e)))
    }
}

#[async_trait]
impl BookingGateway for HttpReservationClient {
    async fn submit_batch(&self, requests: Vec<BookingRequest>) -> CartResult<BatchResult> {
        let url = format!("{}/bookings/batch", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&requests)
            .send()
            .await
            .map_err(|e| CartError::Submission(format!("Request to {} failed: {}", url, e)))?
            .error_for_status()
            .map_err(|e| CartError::Submission(format!("Batch submission rejected: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| CartError::Submission(format!("Invalid batch response: {}", e)))
    }
}
