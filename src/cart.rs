// Cart store: the shopper's working selection and its derived totals.
// Every mutation is written through to durable storage before returning.

use crate::config::StorefrontConfig;
use crate::models::{AddOn, CartItem, ItemKey};
use crate::storage::{CartStorage, StorageError};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_STORAGE_KEY: &str = "travel_cart";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum CartError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// Notifications sent to subscribers after each mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartEvent {
    Added(ItemKey),
    Updated { key: ItemKey, quantity: u32 },
    Removed(ItemKey),
    Cleared,
}

pub struct CartStore {
    items: Mutex<Vec<CartItem>>,
    storage: Arc<dyn CartStorage>,
    storage_key: String,
    revision: AtomicU64,
    events: broadcast::Sender<CartEvent>,
}

impl std::fmt::Debug for CartStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartStore")
            .field("storage_key", &self.storage_key)
            .field("items", &self.items.lock().len())
            .field("revision", &self.revision.load(Ordering::SeqCst))
            .finish()
    }
}

impl CartStore {
    /// Open the cart persisted under the configured storage key.
    pub fn from_config(
        storage: Arc<dyn CartStorage>,
        config: &StorefrontConfig,
    ) -> Result<Self, CartError> {
        Self::open(storage, config.storage_key.clone())
    }

    /// Open the cart persisted under `storage_key`.
    ///
    /// A blob that does not parse as a list of cart items is discarded and
    /// the cart starts empty. Entries sharing an (id, type) key are merged and
    /// zero-quantity entries dropped. Storage I/O failures are returned.
    pub fn open(
        storage: Arc<dyn CartStorage>,
        storage_key: impl Into<String>,
    ) -> Result<Self, CartError> {
        let storage_key = storage_key.into();
        let items = match storage.load(&storage_key)? {
            Some(blob) => match serde_json::from_str::<Vec<CartItem>>(&blob) {
                Ok(items) => normalise(items),
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Discarding unreadable cart blob");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        debug!(key = %storage_key, items = items.len(), "Cart loaded");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            items: Mutex::new(items),
            storage,
            storage_key,
            revision: AtomicU64::new(0),
            events,
        })
    }

    // Receive a CartEvent for every mutation made after this call
    pub fn subscribe(&self) -> broadcast::Receiver<CartEvent> {
        self.events.subscribe()
    }

    // Add one unit; an existing (id, type) entry gets its quantity bumped
    pub fn add_item(&self, item: CartItem) -> Result<CartEvent, CartError> {
        self.apply(|items| {
            let key = item.key();
            let event = match items.iter_mut().find(|existing| existing.key() == key) {
                Some(existing) => {
                    existing.quantity = existing.quantity.saturating_add(1);
                    CartEvent::Updated {
                        key,
                        quantity: existing.quantity,
                    }
                }
                None => {
                    items.push(CartItem { quantity: 1, ..item });
                    CartEvent::Added(key)
                }
            };
            (event.clone(), vec![event])
        })
    }

    // Returns false when no entry matches the key
    pub fn remove_item(&self, key: &ItemKey) -> Result<bool, CartError> {
        self.apply(|items| {
            let before = items.len();
            items.retain(|item| &item.key() != key);
            if items.len() == before {
                (false, Vec::new())
            } else {
                (true, vec![CartEvent::Removed(key.clone())])
            }
        })
    }

    // quantity <= 0 removes the entry
    pub fn update_quantity(&self, key: &ItemKey, quantity: i32) -> Result<bool, CartError> {
        let quantity = match u32::try_from(quantity) {
            Ok(q) if q > 0 => q,
            _ => return self.remove_item(key),
        };

        self.apply(|items| match items.iter_mut().find(|item| &item.key() == key) {
            Some(item) => {
                item.quantity = quantity;
                (
                    true,
                    vec![CartEvent::Updated {
                        key: key.clone(),
                        quantity,
                    }],
                )
            }
            None => (false, Vec::new()),
        })
    }

    pub fn update_special_requests(
        &self,
        key: &ItemKey,
        requests: Option<String>,
    ) -> Result<bool, CartError> {
        self.update_entry(key, |item| item.special_requests = requests)
    }

    pub fn update_add_ons(&self, key: &ItemKey, add_ons: Vec<AddOn>) -> Result<bool, CartError> {
        self.update_entry(key, |item| item.add_ons = add_ons)
    }

    pub fn clear_cart(&self) -> Result<(), CartError> {
        self.apply(|items| {
            items.clear();
            ((), vec![CartEvent::Cleared])
        })
    }

    /// Take the quantities in `booked` out of the cart after they were booked.
    ///
    /// `booked_at` is the revision the booked snapshot was taken at. If the
    /// cart is still at that revision it is cleared outright; otherwise only
    /// the booked quantities are subtracted, so entries added or raised since
    /// the snapshot survive.
    pub fn remove_booked(
        &self,
        booked_at: u64,
        booked: &[(ItemKey, u32)],
    ) -> Result<(), CartError> {
        self.apply(|items| {
            if self.revision.load(Ordering::SeqCst) == booked_at {
                items.clear();
                return ((), vec![CartEvent::Cleared]);
            }

            let mut events = Vec::new();
            for (key, quantity) in booked {
                let Some(pos) = items.iter().position(|item| &item.key() == key) else {
                    continue;
                };
                let remaining = items[pos].quantity.saturating_sub(*quantity);
                if remaining == 0 {
                    items.remove(pos);
                    events.push(CartEvent::Removed(key.clone()));
                } else {
                    items[pos].quantity = remaining;
                    events.push(CartEvent::Updated {
                        key: key.clone(),
                        quantity: remaining,
                    });
                }
            }
            ((), events)
        })
    }

    pub fn items(&self) -> Vec<CartItem> {
        self.items.lock().clone()
    }

    // Items together with the revision they belong to
    pub fn snapshot(&self) -> (u64, Vec<CartItem>) {
        let items = self.items.lock();
        (self.revision.load(Ordering::SeqCst), items.clone())
    }

    pub fn get(&self, key: &ItemKey) -> Option<CartItem> {
        self.items.lock().iter().find(|item| &item.key() == key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    // Sum of price * quantity
    pub fn total_price(&self) -> Decimal {
        self.items.lock().iter().map(CartItem::line_total).sum()
    }

    // Sum of quantities, not the number of entries
    pub fn item_count(&self) -> u32 {
        self.items.lock().iter().map(|item| item.quantity).sum()
    }

    // Bumped on every effective mutation
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn update_entry(
        &self,
        key: &ItemKey,
        update: impl FnOnce(&mut CartItem),
    ) -> Result<bool, CartError> {
        self.apply(|items| match items.iter_mut().find(|item| &item.key() == key) {
            Some(item) => {
                update(item);
                let event = CartEvent::Updated {
                    key: key.clone(),
                    quantity: item.quantity,
                };
                (true, vec![event])
            }
            None => (false, Vec::new()),
        })
    }

    // Run a mutation under the lock. When it yields events the new state is
    // persisted, the revision bumped and subscribers notified. The in-memory
    // change stands even if persisting fails.
    fn apply<R>(
        &self,
        mutate: impl FnOnce(&mut Vec<CartItem>) -> (R, Vec<CartEvent>),
    ) -> Result<R, CartError> {
        let mut items = self.items.lock();
        let (result, events) = mutate(&mut items);
        if events.is_empty() {
            return Ok(result);
        }

        self.revision.fetch_add(1, Ordering::SeqCst);
        let persisted = self.persist(&items);
        drop(items);

        debug!(key = %self.storage_key, ?events, "Cart mutated");
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }

        persisted.map(|_| result)
    }

    fn persist(&self, items: &[CartItem]) -> Result<(), CartError> {
        let blob =
            serde_json::to_string(items).map_err(|e| CartError::Serialization(e.to_string()))?;
        if let Err(e) = self.storage.save(&self.storage_key, &blob) {
            warn!(key = %self.storage_key, error = %e, "Failed to persist cart");
            return Err(e.into());
        }
        Ok(())
    }
}

// One entry per (id, type) key, no zero quantities
fn normalise(items: Vec<CartItem>) -> Vec<CartItem> {
    let loaded = items.len();
    let mut merged: Vec<CartItem> = Vec::with_capacity(loaded);
    for item in items {
        if item.quantity == 0 {
            continue;
        }
        let key = item.key();
        match merged.iter_mut().find(|existing| existing.key() == key) {
            Some(existing) => existing.quantity = existing.quantity.saturating_add(item.quantity),
            None => merged.push(item),
        }
    }
    if merged.len() != loaded {
        warn!(loaded, kept = merged.len(), "Merged duplicate or empty cart entries");
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{car, flight, hotel};
    use crate::models::ItemKind;
    use crate::storage::MemoryStorage;
    use test_case::test_case;

    fn new_store() -> (Arc<MemoryStorage>, CartStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = CartStore::open(storage.clone(), DEFAULT_STORAGE_KEY).unwrap();
        (storage, store)
    }

    fn persisted_items(storage: &MemoryStorage) -> Vec<CartItem> {
        let blob = storage.load(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        serde_json::from_str(&blob).unwrap()
    }

    #[test]
    fn test_repeated_add_increments_quantity() {
        let (_, store) = new_store();

        assert_eq!(
            store.add_item(flight("F1", 200)).unwrap(),
            CartEvent::Added(ItemKey::new("F1", ItemKind::Flight))
        );
        assert_eq!(
            store.add_item(flight("F1", 200)).unwrap(),
            CartEvent::Updated {
                key: ItemKey::new("F1", ItemKind::Flight),
                quantity: 2
            }
        );

        let items = store.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2);
        assert_eq!(store.total_price(), Decimal::from(400));
    }

    #[test]
    fn test_add_many_times_keeps_one_entry() {
        let (_, store) = new_store();
        for _ in 0..7 {
            store.add_item(hotel("H1", 90)).unwrap();
        }
        assert_eq!(store.items().len(), 1);
        assert_eq!(store.item_count(), 7);
    }

    #[test]
    fn test_added_item_starts_at_quantity_one() {
        let (_, store) = new_store();
        let mut item = car("C1", 45);
        item.quantity = 5;
        store.add_item(item).unwrap();
        assert_eq!(store.item_count(), 1);
    }

    #[test]
    fn test_same_id_different_kind_are_separate_entries() {
        let (_, store) = new_store();
        store.add_item(flight("1", 300)).unwrap();
        store.add_item(hotel("1", 120)).unwrap();
        assert_eq!(store.items().len(), 2);

        // Removing the hotel must leave the flight alone
        assert!(store.remove_item(&ItemKey::new("1", ItemKind::Hotel)).unwrap());
        let items = store.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind(), ItemKind::Flight);
        assert_eq!(store.total_price(), Decimal::from(300));
    }

    #[test]
    fn test_total_changes_by_item_contribution() {
        let (_, store) = new_store();
        store.add_item(flight("F1", 250)).unwrap();
        store.add_item(hotel("H1", 80)).unwrap();
        store
            .update_quantity(&ItemKey::new("H1", ItemKind::Hotel), 3)
            .unwrap();
        let before = store.total_price();

        store.add_item(car("C1", 45)).unwrap();
        assert_eq!(store.total_price() - before, Decimal::from(45));

        store
            .remove_item(&ItemKey::new("H1", ItemKind::Hotel))
            .unwrap();
        assert_eq!(store.total_price(), Decimal::from(250 + 45));
    }

    #[test_case(3, Some(3); "positive quantity is set")]
    #[test_case(0, None; "zero removes")]
    #[test_case(-2, None; "negative removes")]
    fn test_update_quantity(quantity: i32, expected: Option<u32>) {
        let (_, store) = new_store();
        let key = ItemKey::new("F1", ItemKind::Flight);
        store.add_item(flight("F1", 100)).unwrap();

        assert!(store.update_quantity(&key, quantity).unwrap());
        assert_eq!(store.get(&key).map(|item| item.quantity), expected);
    }

    #[test]
    fn test_update_unknown_key_is_noop() {
        let (storage, store) = new_store();
        let key = ItemKey::new("missing", ItemKind::Car);

        assert!(!store.update_quantity(&key, 2).unwrap());
        assert!(!store.remove_item(&key).unwrap());
        assert!(!store
            .update_special_requests(&key, Some("late check-in".to_string()))
            .unwrap());
        assert_eq!(store.revision(), 0);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_metadata_updates_are_persisted() {
        let (storage, store) = new_store();
        let key = ItemKey::new("H1", ItemKind::Hotel);
        store.add_item(hotel("H1", 150)).unwrap();

        store
            .update_special_requests(&key, Some("Sea view please".to_string()))
            .unwrap();
        store
            .update_add_ons(
                &key,
                vec![AddOn {
                    name: "Breakfast".to_string(),
                    price: Decimal::new(1250, 2),
                }],
            )
            .unwrap();

        let items = persisted_items(&storage);
        assert_eq!(items[0].special_requests.as_deref(), Some("Sea view please"));
        assert_eq!(items[0].add_ons.len(), 1);
        // Add-ons are metadata only
        assert_eq!(store.total_price(), Decimal::from(150));
    }

    #[test]
    fn test_clear_cart_empties_memory_and_storage() {
        let (storage, store) = new_store();
        store.add_item(flight("F1", 100)).unwrap();
        store.add_item(hotel("H1", 50)).unwrap();

        store.clear_cart().unwrap();
        assert_eq!(store.item_count(), 0);
        assert!(store.is_empty());
        assert!(persisted_items(&storage).is_empty());
    }

    #[test]
    fn test_reload_reproduces_items() {
        let storage = Arc::new(MemoryStorage::new());
        let store = CartStore::open(storage.clone(), DEFAULT_STORAGE_KEY).unwrap();
        store.add_item(flight("F1", 200)).unwrap();
        store.add_item(flight("F1", 200)).unwrap();
        store.add_item(car("C9", 60)).unwrap();
        store
            .update_special_requests(
                &ItemKey::new("C9", ItemKind::Car),
                Some("child seat".to_string()),
            )
            .unwrap();

        let reopened = CartStore::open(storage, DEFAULT_STORAGE_KEY).unwrap();
        assert_eq!(reopened.items(), store.items());
        assert_eq!(reopened.total_price(), store.total_price());
    }

    #[test]
    fn test_corrupt_blob_yields_empty_cart() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .save(DEFAULT_STORAGE_KEY, r#"[{"id": 12, "price": "#)
            .unwrap();

        let store = CartStore::open(storage.clone(), DEFAULT_STORAGE_KEY).unwrap();
        assert!(store.is_empty());

        // The next write replaces the corrupt blob
        store.add_item(hotel("H1", 70)).unwrap();
        assert_eq!(persisted_items(&storage).len(), 1);
    }

    #[test]
    fn test_subscribers_see_mutations_in_order() {
        let (_, store) = new_store();
        let mut events = store.subscribe();
        let key = ItemKey::new("F1", ItemKind::Flight);

        store.add_item(flight("F1", 100)).unwrap();
        store.add_item(flight("F1", 100)).unwrap();
        store.remove_item(&key).unwrap();
        store.clear_cart().unwrap();

        assert_eq!(events.try_recv().unwrap(), CartEvent::Added(key.clone()));
        assert_eq!(
            events.try_recv().unwrap(),
            CartEvent::Updated {
                key: key.clone(),
                quantity: 2
            }
        );
        assert_eq!(events.try_recv().unwrap(), CartEvent::Removed(key));
        assert_eq!(events.try_recv().unwrap(), CartEvent::Cleared);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_revision_tracks_effective_mutations() {
        let (_, store) = new_store();
        store.add_item(flight("F1", 100)).unwrap();
        store.add_item(flight("F1", 100)).unwrap();
        assert_eq!(store.revision(), 2);

        store
            .remove_item(&ItemKey::new("nope", ItemKind::Flight))
            .unwrap();
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_from_config_uses_configured_key() {
        let storage = Arc::new(MemoryStorage::new());
        let config = StorefrontConfig {
            storage_key: "tenant_b_cart".to_string(),
            ..Default::default()
        };

        let store = CartStore::from_config(storage.clone(), &config).unwrap();
        assert_eq!(store.storage_key(), "tenant_b_cart");
        store.add_item(car("C1", 45)).unwrap();

        assert!(storage.load("tenant_b_cart").unwrap().is_some());
        assert!(storage.load(DEFAULT_STORAGE_KEY).unwrap().is_none());
    }

    #[test]
    fn test_load_merges_duplicate_keys_and_drops_empty_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let mut first = flight("F1", 200);
        first.quantity = 2;
        let mut second = flight("F1", 200);
        second.quantity = 3;
        let mut empty = hotel("H1", 90);
        empty.quantity = 0;
        let blob = serde_json::to_string(&vec![first, car("C1", 45), second, empty]).unwrap();
        storage.save(DEFAULT_STORAGE_KEY, &blob).unwrap();

        let store = CartStore::open(storage, DEFAULT_STORAGE_KEY).unwrap();
        let items = store.items();
        assert_eq!(items.len(), 2);
        assert_eq!(
            store.get(&ItemKey::new("F1", ItemKind::Flight)).map(|i| i.quantity),
            Some(5)
        );
        assert!(store.get(&ItemKey::new("H1", ItemKind::Hotel)).is_none());
        assert_eq!(store.item_count(), 6);

        // Removing the key clears every copy
        assert!(store.remove_item(&ItemKey::new("F1", ItemKind::Flight)).unwrap());
        assert!(store.get(&ItemKey::new("F1", ItemKind::Flight)).is_none());
    }

    #[test]
    fn test_add_saturates_quantity() {
        let storage = Arc::new(MemoryStorage::new());
        let mut item = flight("F1", 100);
        item.quantity = u32::MAX;
        storage
            .save(DEFAULT_STORAGE_KEY, &serde_json::to_string(&vec![item]).unwrap())
            .unwrap();
        let store = CartStore::open(storage, DEFAULT_STORAGE_KEY).unwrap();

        store.add_item(flight("F1", 100)).unwrap();
        assert_eq!(
            store.get(&ItemKey::new("F1", ItemKind::Flight)).map(|i| i.quantity),
            Some(u32::MAX)
        );
    }

    #[test]
    fn test_remove_booked_clears_unchanged_cart() {
        let (storage, store) = new_store();
        store.add_item(flight("F1", 100)).unwrap();
        store.add_item(hotel("H1", 50)).unwrap();
        let (booked_at, items) = store.snapshot();
        assert_eq!(booked_at, 2);
        let booked: Vec<_> = items.iter().map(|i| (i.key(), i.quantity)).collect();
        let mut events = store.subscribe();

        store.remove_booked(booked_at, &booked).unwrap();
        assert!(store.is_empty());
        assert!(persisted_items(&storage).is_empty());
        assert_eq!(events.try_recv().unwrap(), CartEvent::Cleared);
    }

    #[test]
    fn test_remove_booked_keeps_changes_made_after_snapshot() {
        let (storage, store) = new_store();
        let flight_key = ItemKey::new("F1", ItemKind::Flight);
        let hotel_key = ItemKey::new("H1", ItemKind::Hotel);
        store.add_item(flight("F1", 100)).unwrap();
        store.add_item(hotel("H1", 50)).unwrap();
        let booked_at = store.revision();
        let booked: Vec<_> = store.items().iter().map(|i| (i.key(), i.quantity)).collect();

        // Shopper keeps shopping while the booking is in flight
        store.add_item(hotel("H1", 50)).unwrap();
        store.add_item(car("C1", 45)).unwrap();
        let mut events = store.subscribe();

        store.remove_booked(booked_at, &booked).unwrap();

        assert!(store.get(&flight_key).is_none());
        assert_eq!(store.get(&hotel_key).map(|i| i.quantity), Some(1));
        assert!(store.get(&ItemKey::new("C1", ItemKind::Car)).is_some());
        assert_eq!(persisted_items(&storage), store.items());

        assert_eq!(events.try_recv().unwrap(), CartEvent::Removed(flight_key));
        assert_eq!(
            events.try_recv().unwrap(),
            CartEvent::Updated {
                key: hotel_key,
                quantity: 1
            }
        );
        assert!(events.try_recv().is_err());
    }

    struct FailingStorage;

    impl CartStorage for FailingStorage {
        fn load(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }

        fn save(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn test_persist_failure_is_reported_but_memory_keeps_change() {
        let store = CartStore::open(Arc::new(FailingStorage), DEFAULT_STORAGE_KEY).unwrap();

        let result = store.add_item(flight("F1", 100));
        assert!(matches!(result, Err(CartError::Storage(_))));
        assert_eq!(store.item_count(), 1);
    }
}
