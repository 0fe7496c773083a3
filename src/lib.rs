// Client-side core of the travel storefront: cart, checkout and booking queries

pub mod analytics;
pub mod booking_api;
pub mod cart;
pub mod checkout;
pub mod config;
pub mod models;
pub mod storage;
pub mod tracking;

// Re-export key types for convenience
pub use analytics::{AnalyticsEvent, AnalyticsSink, TracingAnalytics};
pub use booking_api::{ApiError, BookingApi, ClientStats, HttpBookingClient};
pub use cart::{CartError, CartEvent, CartStore};
pub use checkout::{CheckoutError, CheckoutFlow, CheckoutReceipt, CheckoutStage};
pub use config::{ConfigError, StorefrontConfig};
pub use models::{
    AddOn, Booking, BookingItem, BookingStatus, CartItem, ItemDetails, ItemKey, ItemKind,
    Session,
};
pub use storage::{CartStorage, FileStorage, MemoryStorage, StorageError};
pub use tracking::BookingTracker;
