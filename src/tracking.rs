// Confirmation-page status polling. The booking status is changed out of band
// by an admin, so the client can only refetch until it moves.

use crate::booking_api::{ApiError, BookingApi};
use crate::config::StorefrontConfig;
use crate::models::{Booking, BookingStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct BookingTracker {
    api: Arc<dyn BookingApi>,
    interval: Duration,
    max_attempts: u32,
}

impl std::fmt::Debug for BookingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingTracker")
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl BookingTracker {
    pub fn new(api: Arc<dyn BookingApi>, config: &StorefrontConfig) -> Self {
        Self {
            api,
            interval: config.status_poll_interval(),
            max_attempts: config.status_poll_attempts.max(1),
        }
    }

    pub async fn poll_once(&self, id_or_reference: &str) -> Result<Booking, ApiError> {
        self.api.get_booking(id_or_reference).await
    }

    /// Refetch the booking until its status is no longer `PENDING` or the
    /// attempt budget runs out, and return the last snapshot seen.
    ///
    /// The first fetch happens immediately. Any error ends the wait.
    pub async fn wait_for_status(&self, id_or_reference: &str) -> Result<Booking, ApiError> {
        let mut attempt = 1;
        loop {
            let booking = self.poll_once(id_or_reference).await?;
            debug!(
                booking = %booking.booking_reference,
                status = %booking.status,
                attempt,
                "Polled booking status"
            );

            if booking.status != BookingStatus::Pending || attempt >= self.max_attempts {
                return Ok(booking);
            }

            attempt += 1;
            tokio::time::sleep(self.interval).await;
        }
    }
}
