use crate::storage::{lock_store, SharedStore};
use crate::VehicleId;

/// Issues strictly increasing vehicle ids for the lifetime of the process.
///
/// The seed is resolved once, on the first call: the highest buffered id if
/// anything is buffered, else the durable store's last id, else 0. A failed
/// store lookup falls back to the in-memory seed. The store is never asked
/// again after seeding.
#[derive(Debug, Default)]
pub struct VehicleIdAllocator {
    last: Option<VehicleId>,
}

impl VehicleIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, buffered_max: Option<VehicleId>, store: &SharedStore) -> VehicleId {
        let seed = match self.last {
            Some(last) => last,
            None => Self::resolve_seed(buffered_max, store),
        };
        let id = seed + 1;
        self.last = Some(id);
        id
    }

    fn resolve_seed(buffered_max: Option<VehicleId>, store: &SharedStore) -> VehicleId {
        if let Some(max) = buffered_max {
            log::info!("vehicle ids seeded from buffered max {}", max);
            return max;
        }
        let looked_up = lock_store(store).and_then(|mut s| s.last_vehicle_id());
        match looked_up {
            Ok(last) => {
                let seed = last.unwrap_or(0);
                log::info!("vehicle ids seeded from store last id {}", seed);
                seed
            }
            Err(e) => {
                log::warn!("vehicle id seed lookup failed, starting from 0: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryVehicleStore;
    use std::sync::{Arc, Mutex};

    fn store_with_last(last: Option<VehicleId>) -> SharedStore {
        let mut store = InMemoryVehicleStore::default();
        if let Some(id) = last {
            store.set_last_vehicle_id(id);
        }
        Arc::new(Mutex::new(store))
    }

    #[test]
    fn first_id_follows_store_last_id() {
        let store = store_with_last(Some(41));
        let mut alloc = VehicleIdAllocator::new();
        assert_eq!(alloc.next_id(None, &store), 42);
        assert_eq!(alloc.next_id(None, &store), 43);
    }

    #[test]
    fn empty_store_starts_at_one() {
        let store = store_with_last(None);
        let mut alloc = VehicleIdAllocator::new();
        assert_eq!(alloc.next_id(None, &store), 1);
    }

    #[test]
    fn buffered_ids_take_precedence() {
        let store = store_with_last(Some(41));
        let mut alloc = VehicleIdAllocator::new();
        assert_eq!(alloc.next_id(Some(100), &store), 101);
    }

    #[test]
    fn store_not_consulted_after_seeding() {
        let inner = Arc::new(Mutex::new(InMemoryVehicleStore::default()));
        inner.lock().unwrap().set_last_vehicle_id(10);
        let store: SharedStore = inner.clone();
        let mut alloc = VehicleIdAllocator::new();
        assert_eq!(alloc.next_id(None, &store), 11);

        inner.lock().unwrap().set_last_vehicle_id(500);
        assert_eq!(alloc.next_id(Some(900), &store), 12);
    }

    #[test]
    fn failed_lookup_fails_open() {
        let mut store = InMemoryVehicleStore::default();
        store.fail_lookups = true;
        let store: SharedStore = Arc::new(Mutex::new(store));
        let mut alloc = VehicleIdAllocator::new();
        assert_eq!(alloc.next_id(None, &store), 1);
        assert_eq!(alloc.next_id(None, &store), 2);
    }
}
