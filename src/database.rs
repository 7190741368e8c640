pub mod sqlite;

use crate::api::{OrderHeader, OrderItemRecord, StoredHeader};
use crate::errors::StoreError;

pub use sqlite::SQLiteStore;

/// Trait hiding the order store implementation
///
/// The two writes are separate calls on purpose: the header must exist before its items can
/// reference it, and nothing here ties them in a single transaction.
pub trait OrderStore: Send {
    /// Insert an order header
    ///
    /// On success, return the header echoed back with its generated identifier
    fn insert_order(&mut self, header: &OrderHeader) -> Result<StoredHeader, StoreError>;

    /// Insert all the line items of one order. Either every record is written or none.
    fn insert_order_items(&mut self, items: &[OrderItemRecord]) -> Result<(), StoreError>;

    /// Retrieve a header by its identifier
    fn get_order(&self, order_id: &str) -> Result<Option<StoredHeader>, StoreError>;

    /// Retrieve the items of an order, in insertion order
    fn get_order_items(&self, order_id: &str) -> Result<Vec<OrderItemRecord>, StoreError>;

    /// Most recent headers first
    fn list_orders(&self, limit: usize) -> Result<Vec<StoredHeader>, StoreError>;
}

pub mod mock {
    //! In-memory store with failure injection, for tests of the submission flow

    use super::*;
    use crate::errors::PersistenceStep;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    #[derive(Default)]
    pub struct MockState {
        pub headers: Vec<StoredHeader>,
        pub items: Vec<OrderItemRecord>,
        /// Number of header writes attempted, failed ones included
        pub header_calls: usize,
        /// Number of item batch writes attempted, failed ones included
        pub item_calls: usize,
        next_id: u32,
    }

    /// Channels used to hold a header write until the test releases it
    pub struct Gate {
        /// Receives one message each time a header write starts waiting
        pub entered: mpsc::Receiver<()>,
        /// Send one message to let a waiting header write proceed
        pub release: mpsc::Sender<()>,
    }

    struct StoreGate {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    /// Clones share the same state, so a test can keep a handle after moving the store
    #[derive(Clone, Default)]
    pub struct MockStore {
        state: Arc<Mutex<MockState>>,
        fail_on: Option<PersistenceStep>,
        gate: Option<Arc<Mutex<StoreGate>>>,
    }

    impl MockStore {
        pub fn new() -> MockStore {
            MockStore::default()
        }

        /// A store whose writes fail at `step`
        pub fn failing_at(step: PersistenceStep) -> MockStore {
            MockStore {
                fail_on: Some(step),
                ..MockStore::default()
            }
        }

        /// A store whose header writes block until the returned gate releases them
        pub fn gated() -> (MockStore, Gate) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let store = MockStore {
                gate: Some(Arc::new(Mutex::new(StoreGate {
                    entered: entered_tx,
                    release: release_rx,
                }))),
                ..MockStore::default()
            };
            let gate = Gate {
                entered: entered_rx,
                release: release_tx,
            };
            (store, gate)
        }

        pub fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn wait_for_gate(&self) {
            if let Some(gate) = &self.gate {
                let gate = gate.lock().unwrap_or_else(PoisonError::into_inner);
                // A test that dropped its gate does not want to hold anything
                let _ = gate.entered.send(());
                let _ = gate.release.recv();
            }
        }
    }

    impl OrderStore for MockStore {
        fn insert_order(&mut self, header: &OrderHeader) -> Result<StoredHeader, StoreError> {
            self.wait_for_gate();
            let mut state = self.state();
            state.header_calls += 1;
            if self.fail_on == Some(PersistenceStep::Header) {
                return Err(StoreError::Rejected("header insert failed".to_string()));
            }
            state.next_id += 1;
            let stored = StoredHeader {
                order_id: format!("order-{}", state.next_id),
                header: header.clone(),
            };
            state.headers.push(stored.clone());
            Ok(stored)
        }

        fn insert_order_items(&mut self, items: &[OrderItemRecord]) -> Result<(), StoreError> {
            let mut state = self.state();
            state.item_calls += 1;
            if self.fail_on == Some(PersistenceStep::Items) {
                return Err(StoreError::Rejected("items insert failed".to_string()));
            }
            state.items.extend_from_slice(items);
            Ok(())
        }

        fn get_order(&self, order_id: &str) -> Result<Option<StoredHeader>, StoreError> {
            Ok(self
                .state()
                .headers
                .iter()
                .find(|stored| stored.order_id == order_id)
                .cloned())
        }

        fn get_order_items(&self, order_id: &str) -> Result<Vec<OrderItemRecord>, StoreError> {
            Ok(self
                .state()
                .items
                .iter()
                .filter(|item| item.order_id == order_id)
                .cloned()
                .collect())
        }

        fn list_orders(&self, limit: usize) -> Result<Vec<StoredHeader>, StoreError> {
            Ok(self.state().headers.iter().rev().take(limit).cloned().collect())
        }
    }

}
