// Checkout: turns the cart into a paid booking.
//
// A checkout attempt is a short saga run strictly in sequence:
//   IntentCreated -> BookingPending -> Committed
// If the backend definitively rejects the booking, the intent is voided and the
// attempt ends as Compensated. If the outcome is unknown (timeout, dropped
// connection, 5xx) the booking may exist, so the intent is kept and a retry of
// the same cart resends the same intent under the same idempotency key.

use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::booking_api::{ApiError, BookingApi};
use crate::cart::CartStore;
use crate::config::StorefrontConfig;
use crate::models::{BookingItem, CreateBookingRequest, Session};
use parking_lot::Mutex;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("Cart is empty")]
    EmptyCart,

    #[error("Sign in to complete your booking")]
    NotAuthenticated,

    #[error("Payment intent failed: {0}")]
    PaymentIntent(#[source] ApiError),

    #[error("Booking failed: {source}")]
    Booking {
        #[source]
        source: ApiError,
        payment_intent_id: String,
        intent_voided: bool,
    },

    #[error("Booking outcome unknown, retry to resolve: {source}")]
    BookingOutcomeUnknown {
        #[source]
        source: ApiError,
        payment_intent_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutStage {
    IntentCreated {
        payment_intent_id: String,
    },
    BookingPending {
        payment_intent_id: String,
        idempotency_key: String,
    },
    Committed {
        booking_id: String,
        booking_reference: String,
    },
    Compensated {
        payment_intent_id: String,
        intent_voided: bool,
    },
    // Intent kept, booking may or may not exist
    OutcomeUnknown {
        payment_intent_id: String,
        idempotency_key: String,
    },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutReceipt {
    pub booking_id: String,
    pub booking_reference: String,
    pub payment_intent_id: String,
    pub total_amount: Decimal,
}

// Idempotency key bound to the cart revision it was minted for. The intent id
// is set once a booking request with this key ended with an unknown outcome.
#[derive(Debug, Clone)]
struct PendingKey {
    cart_revision: u64,
    key: String,
    payment_intent_id: Option<String>,
}

pub struct CheckoutFlow {
    api: Arc<dyn BookingApi>,
    analytics: Arc<dyn AnalyticsSink>,
    currency: String,
    tax_multiplier: Decimal,
    confirmation_delay: Duration,
    pending_key: Mutex<Option<PendingKey>>,
    last_stage: Mutex<Option<CheckoutStage>>,
}

impl std::fmt::Debug for CheckoutFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutFlow")
            .field("currency", &self.currency)
            .field("tax_multiplier", &self.tax_multiplier)
            .field("last_stage", &*self.last_stage.lock())
            .finish()
    }
}

/// Subtotal times the tax multiplier, truncated to cents.
pub fn total_with_tax(subtotal: Decimal, tax_multiplier: Decimal) -> Decimal {
    (subtotal * tax_multiplier).round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

impl CheckoutFlow {
    pub fn new(
        api: Arc<dyn BookingApi>,
        analytics: Arc<dyn AnalyticsSink>,
        config: &StorefrontConfig,
    ) -> Self {
        Self {
            api,
            analytics,
            currency: config.currency.clone(),
            tax_multiplier: config.tax_multiplier,
            confirmation_delay: config.payment_confirmation_delay(),
            pending_key: Mutex::new(None),
            last_stage: Mutex::new(None),
        }
    }

    pub fn last_stage(&self) -> Option<CheckoutStage> {
        self.last_stage.lock().clone()
    }

    /// Run one checkout attempt for everything in `cart`.
    ///
    /// Preconditions are checked before any request goes out. On success the
    /// booked quantities leave the cart; anything added meanwhile stays.
    /// Nothing is retried automatically. After `BookingOutcomeUnknown` a retry
    /// of the unchanged cart reuses the same payment intent and idempotency
    /// key, so the backend can hand back the booking it may already hold.
    pub async fn checkout(
        &self,
        cart: &CartStore,
        session: Option<&Session>,
        payment_method: &str,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        let session = session.ok_or(CheckoutError::NotAuthenticated)?;
        let (cart_revision, items) = cart.snapshot();
        if items.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }

        let subtotal: Decimal = items.iter().map(|item| item.line_total()).sum();
        let total_amount = total_with_tax(subtotal, self.tax_multiplier);

        let (payment_intent_id, idempotency_key) = match self.unresolved_attempt(cart_revision) {
            Some(attempt) => {
                info!(payment_intent_id = %attempt.0, "Resending booking with unknown outcome");
                attempt
            }
            None => {
                let payment_intent_id = self.create_intent(total_amount).await?;
                (payment_intent_id, self.idempotency_key(cart_revision))
            }
        };
        self.set_stage(CheckoutStage::BookingPending {
            payment_intent_id: payment_intent_id.clone(),
            idempotency_key: idempotency_key.clone(),
        });

        let request = CreateBookingRequest {
            user_id: session.user_id.clone(),
            user_email: session.email.clone(),
            user_name: session.name.clone(),
            items: items.iter().map(BookingItem::from).collect(),
            payment_method: payment_method.to_string(),
            payment_intent_id: payment_intent_id.clone(),
            total_amount,
        };

        let confirmation = match self.api.create_booking(&request, &idempotency_key).await {
            Ok(confirmation) => confirmation,
            Err(e) if e.outcome_unknown() => {
                return Err(self.hold_attempt(e, cart_revision, payment_intent_id, idempotency_key))
            }
            Err(e) => {
                *self.pending_key.lock() = None;
                return Err(self.compensate(e, payment_intent_id).await);
            }
        };

        self.set_stage(CheckoutStage::Committed {
            booking_id: confirmation.booking_id.clone(),
            booking_reference: confirmation.booking_reference.clone(),
        });
        *self.pending_key.lock() = None;

        for item in &request.items {
            self.analytics.track(AnalyticsEvent::BookingTracked {
                booking_reference: confirmation.booking_reference.clone(),
                item_id: item.item_id.clone(),
                item_kind: item.kind(),
                price: item.price,
                quantity: item.quantity,
            });
        }

        // The booking exists at this point; a storage failure here must not
        // hide it from the caller
        let booked: Vec<_> = items.iter().map(|item| (item.key(), item.quantity)).collect();
        if let Err(e) = cart.remove_booked(cart_revision, &booked) {
            warn!(error = %e, "Booking committed but the cart could not be updated");
        }

        Ok(CheckoutReceipt {
            booking_id: confirmation.booking_id,
            booking_reference: confirmation.booking_reference,
            payment_intent_id,
            total_amount,
        })
    }

    async fn create_intent(&self, total_amount: Decimal) -> Result<String, CheckoutError> {
        let intent = match self
            .api
            .create_payment_intent(total_amount, &self.currency)
            .await
        {
            Ok(intent) => intent,
            Err(e) => {
                warn!(error = %e, "Payment intent request failed");
                self.set_stage(CheckoutStage::Failed);
                return Err(CheckoutError::PaymentIntent(e));
            }
        };
        self.set_stage(CheckoutStage::IntentCreated {
            payment_intent_id: intent.payment_intent_id.clone(),
        });

        // Stand-in for the card confirmation step
        if !self.confirmation_delay.is_zero() {
            tokio::time::sleep(self.confirmation_delay).await;
        }
        Ok(intent.payment_intent_id)
    }

    // The booking may exist: keep the intent and the key for the next attempt
    fn hold_attempt(
        &self,
        source: ApiError,
        cart_revision: u64,
        payment_intent_id: String,
        idempotency_key: String,
    ) -> CheckoutError {
        warn!(
            error = %source,
            payment_intent_id = %payment_intent_id,
            idempotency_key = %idempotency_key,
            "Booking outcome unknown, keeping payment intent for retry"
        );
        *self.pending_key.lock() = Some(PendingKey {
            cart_revision,
            key: idempotency_key.clone(),
            payment_intent_id: Some(payment_intent_id.clone()),
        });
        self.set_stage(CheckoutStage::OutcomeUnknown {
            payment_intent_id: payment_intent_id.clone(),
            idempotency_key,
        });

        CheckoutError::BookingOutcomeUnknown {
            source,
            payment_intent_id,
        }
    }

    // Intent and key of an earlier attempt on this same revision whose
    // booking outcome is still unknown
    fn unresolved_attempt(&self, cart_revision: u64) -> Option<(String, String)> {
        let pending = self.pending_key.lock();
        let pending = pending.as_ref()?;
        let payment_intent_id = pending.payment_intent_id.as_ref()?;
        if pending.cart_revision == cart_revision {
            return Some((payment_intent_id.clone(), pending.key.clone()));
        }

        warn!(
            payment_intent_id = %payment_intent_id,
            "Cart changed after a booking with unknown outcome, starting a new attempt"
        );
        None
    }

    // Void the intent created for this attempt, then report the booking error
    async fn compensate(&self, source: ApiError, payment_intent_id: String) -> CheckoutError {
        warn!(
            error = %source,
            payment_intent_id = %payment_intent_id,
            "Booking creation failed, voiding payment intent"
        );

        let intent_voided = match self.api.cancel_payment_intent(&payment_intent_id).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    payment_intent_id = %payment_intent_id,
                    "Could not void payment intent, needs manual reconciliation"
                );
                false
            }
        };

        self.set_stage(CheckoutStage::Compensated {
            payment_intent_id: payment_intent_id.clone(),
            intent_voided,
        });

        CheckoutError::Booking {
            source,
            payment_intent_id,
            intent_voided,
        }
    }

    fn idempotency_key(&self, cart_revision: u64) -> String {
        let mut pending = self.pending_key.lock();
        match pending.as_ref() {
            Some(existing) if existing.cart_revision == cart_revision => existing.key.clone(),
            _ => {
                let key = Uuid::new_v4().to_string();
                *pending = Some(PendingKey {
                    cart_revision,
                    key: key.clone(),
                    payment_intent_id: None,
                });
                key
            }
        }
    }

    fn set_stage(&self, stage: CheckoutStage) {
        info!(?stage, "Checkout stage");
        *self.last_stage.lock() = Some(stage);
    }
}
