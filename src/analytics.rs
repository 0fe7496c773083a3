// Analytics hooks fired by the storefront

use crate::models::ItemKind;
use rust_decimal::Decimal;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsEvent {
    // One per purchased line item, after the booking is committed
    BookingTracked {
        booking_reference: String,
        item_id: String,
        item_kind: ItemKind,
        price: Decimal,
        quantity: u32,
    },
}

pub trait AnalyticsSink: Send + Sync + 'static {
    fn track(&self, event: AnalyticsEvent);
}

/// Emits every event as a structured `tracing` record under the
/// `storefront::analytics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn track(&self, event: AnalyticsEvent) {
        match event {
            AnalyticsEvent::BookingTracked {
                booking_reference,
                item_id,
                item_kind,
                price,
                quantity,
            } => info!(
                target: "storefront::analytics",
                %booking_reference,
                %item_id,
                %item_kind,
                %price,
                quantity,
                "booking tracked"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingAnalytics {
        events: Mutex<Vec<AnalyticsEvent>>,
    }

    impl RecordingAnalytics {
        pub fn events(&self) -> Vec<AnalyticsEvent> {
            self.events.lock().clone()
        }
    }

    impl AnalyticsSink for RecordingAnalytics {
        fn track(&self, event: AnalyticsEvent) {
            self.events.lock().push(event);
        }
    }
}
