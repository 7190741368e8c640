//! Order submission: header write, items write, cart clear, then a detached notification.

use crate::api::{Order, OrderHeader, OrderItemRecord, OrderReceipt, PersistedOrder, StoredHeader};
use crate::cart::CartStore;
use crate::checkout::{assemble_order, CheckoutForm};
use crate::database::OrderStore;
use crate::errors::{OrderError, PersistenceStep, StoreError};
use crate::notification::NotificationDispatcher;
use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// Where the pipeline stands with respect to the last submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    Submitting,
    Succeeded,
    Failed,
}

/// Human readable order number, `ORD-` followed by six digits
///
/// Numbers are random and never checked against existing orders, two orders may share one.
pub fn generate_order_number<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("ORD-{:06}", rng.gen_range(0..1_000_000u32))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the pipeline `Submitting` for its lifetime, `Failed` unless told it succeeded
struct InFlight<'a> {
    state: &'a Mutex<SubmissionState>,
    succeeded: bool,
}

impl InFlight<'_> {
    fn succeed(mut self) {
        self.succeeded = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *lock(self.state) = if self.succeeded {
            SubmissionState::Succeeded
        } else {
            SubmissionState::Failed
        };
    }
}

/// Turns the cart into a persisted order
///
/// One submission at a time: a checkout started while another is in flight is refused with
/// [`OrderError::SubmissionInProgress`] without touching the store.
pub struct OrderPipeline<S: OrderStore> {
    store: Mutex<S>,
    state: Mutex<SubmissionState>,
    notifier: NotificationDispatcher,
}

impl<S: OrderStore> OrderPipeline<S> {
    pub fn new(store: S, notifier: NotificationDispatcher) -> OrderPipeline<S> {
        OrderPipeline {
            store: Mutex::new(store),
            state: Mutex::new(SubmissionState::Idle),
            notifier,
        }
    }

    pub fn state(&self) -> SubmissionState {
        *lock(&self.state)
    }

    /// Return a finished submission to `Idle`. No effect while submitting.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        if *state != SubmissionState::Submitting {
            *state = SubmissionState::Idle;
        }
    }

    /// Submit the content of `cart` for the customer described by `form`
    ///
    /// Validation errors leave the state untouched. The cart is cleared only once both writes
    /// succeeded, and the notification is queued after that without being waited on.
    pub fn checkout(
        &self,
        cart: &Mutex<CartStore>,
        form: &CheckoutForm,
    ) -> Result<OrderReceipt, OrderError> {
        let order = assemble_order(&lock(cart), form)?;

        let in_flight = self.begin()?;
        let persisted = self.persist(&order)?;
        lock(cart).clear_cart();
        in_flight.succeed();

        info!(
            order_id = %persisted.order_id,
            order_number = %persisted.order_number(),
            total = persisted.header.total_price,
            "Order submitted"
        );
        let receipt = OrderReceipt {
            order_id: persisted.order_id.clone(),
            order_number: persisted.order_number().to_string(),
        };
        self.notifier.dispatch(persisted);
        Ok(receipt)
    }

    /// Most recent orders first
    pub fn recent_orders(&self, limit: usize) -> Result<Vec<StoredHeader>, StoreError> {
        lock(&self.store).list_orders(limit)
    }

    pub fn order_items(&self, order_id: &str) -> Result<Vec<OrderItemRecord>, StoreError> {
        lock(&self.store).get_order_items(order_id)
    }

    fn begin(&self) -> Result<InFlight<'_>, OrderError> {
        let mut state = lock(&self.state);
        if *state == SubmissionState::Submitting {
            warn!("Checkout refused, a submission is already in progress");
            return Err(OrderError::SubmissionInProgress);
        }
        *state = SubmissionState::Submitting;
        Ok(InFlight {
            state: &self.state,
            succeeded: false,
        })
    }

    fn persist(&self, order: &Order) -> Result<PersistedOrder, OrderError> {
        let header = OrderHeader::from_order(order, generate_order_number(&mut rand::thread_rng()));
        let mut store = lock(&self.store);

        let stored = store.insert_order(&header).map_err(|source| {
            error!(order_number = %header.order_number, error = %source, "Failed to persist order header");
            OrderError::Persistence {
                step: PersistenceStep::Header,
                source,
            }
        })?;

        let records = order
            .items
            .iter()
            .map(|line| OrderItemRecord::from_line(&stored.order_id, line))
            .collect::<Vec<_>>();
        if let Err(source) = store.insert_order_items(&records) {
            // The header stays behind without items, nothing removes it
            error!(
                order_id = %stored.order_id,
                order_number = %stored.header.order_number,
                error = %source,
                "Failed to persist order items, order header left without items"
            );
            return Err(OrderError::Persistence {
                step: PersistenceStep::Items,
                source,
            });
        }

        Ok(PersistedOrder {
            order_id: stored.order_id,
            header: stored.header,
            items: order.items.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::fixtures::item;
    use crate::cart::MemoryStorage;
    use crate::database::mock::MockStore;
    use crate::notification::RecordingMessenger;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use regex::Regex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn form() -> CheckoutForm {
        CheckoutForm {
            name: "Ana Cruz".to_string(),
            phone: "555-0100".to_string(),
            address: "12 Rizal Ave".to_string(),
            notes: Some("no onions".to_string()),
            telegram_chat_id: None,
        }
    }

    fn filled_cart() -> Mutex<CartStore> {
        let mut cart = CartStore::open(Box::new(MemoryStorage::default()));
        cart.add_item(&item("A", 5.0));
        cart.add_item(&item("A", 5.0));
        cart.add_item(&item("B", 3.5));
        Mutex::new(cart)
    }

    fn pipeline(store: MockStore) -> (OrderPipeline<MockStore>, Arc<RecordingMessenger>) {
        let messenger = Arc::new(RecordingMessenger::new());
        let notifier = NotificationDispatcher::new(messenger.clone(), 1).unwrap();
        (OrderPipeline::new(store, notifier), messenger)
    }

    #[test]
    fn test_order_number_format() {
        let pattern = Regex::new(r"^ORD-\d{6}$").unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let number = generate_order_number(&mut rng);
            assert!(pattern.is_match(&number), "bad order number {}", number);
        }
    }

    #[test]
    fn test_successful_checkout() {
        let store = MockStore::new();
        let (pipeline, messenger) = pipeline(store.clone());
        let cart = filled_cart();

        let receipt = pipeline.checkout(&cart, &form()).unwrap();

        assert_eq!(pipeline.state(), SubmissionState::Succeeded);
        assert!(lock(&cart).cart().is_empty());

        {
            let state = store.state();
            assert_eq!(state.headers.len(), 1);
            let stored = &state.headers[0];
            assert_eq!(stored.order_id, receipt.order_id);
            assert_eq!(stored.header.order_number, receipt.order_number);
            assert_eq!(stored.header.total_price, 13.5);
            assert_eq!(stored.header.payment_status, "pending");
            assert_eq!(stored.header.notes, "no onions");

            assert_eq!(state.items.len(), 2);
            assert_eq!(state.items[0].item_name, "A");
            assert_eq!(state.items[0].quantity, 2);
            assert_eq!(state.items[0].total_price, 10.0);
            assert!(state.items.iter().all(|i| i.order_id == receipt.order_id));
        }

        let sent = messenger.wait_for(1, Duration::from_secs(5));
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains(&receipt.order_number));
        assert!(sent[0].text.contains("• 2x A"));
    }

    #[test]
    fn test_header_failure_keeps_cart() {
        let store = MockStore::failing_at(PersistenceStep::Header);
        let (pipeline, messenger) = pipeline(store.clone());
        let cart = filled_cart();

        let err = pipeline.checkout(&cart, &form()).unwrap_err();

        assert_eq!(err.failed_step(), Some(PersistenceStep::Header));
        assert_eq!(pipeline.state(), SubmissionState::Failed);
        assert_eq!(lock(&cart).total_items(), 3);
        assert_eq!(store.state().item_calls, 0);

        drop(pipeline);
        assert!(messenger.sent().is_empty());
    }

    #[test]
    fn test_items_failure_leaves_orphaned_header() {
        let store = MockStore::failing_at(PersistenceStep::Items);
        let (pipeline, messenger) = pipeline(store.clone());
        let cart = filled_cart();

        let err = pipeline.checkout(&cart, &form()).unwrap_err();

        assert_eq!(err.failed_step(), Some(PersistenceStep::Items));
        assert_eq!(pipeline.state(), SubmissionState::Failed);
        assert_eq!(lock(&cart).total_items(), 3);
        {
            let state = store.state();
            assert_eq!(state.headers.len(), 1);
            assert!(state.items.is_empty());
        }

        // Every queued notification has run once the pipeline is gone
        drop(pipeline);
        assert!(messenger.sent().is_empty());
    }

    #[test]
    fn test_retry_after_failure_resubmits_whole_order() {
        let store = MockStore::failing_at(PersistenceStep::Header);
        let (failing, _) = pipeline(store);
        let cart = filled_cart();
        assert!(failing.checkout(&cart, &form()).is_err());

        let store = MockStore::new();
        let (working, _) = pipeline(store.clone());
        working.checkout(&cart, &form()).unwrap();
        assert_eq!(store.state().items.len(), 2);
    }

    #[test]
    fn test_empty_cart_makes_no_store_call() {
        let store = MockStore::new();
        let (pipeline, _) = pipeline(store.clone());
        let cart = Mutex::new(CartStore::open(Box::new(MemoryStorage::default())));

        let err = pipeline.checkout(&cart, &form()).unwrap_err();

        assert!(matches!(err, OrderError::EmptyCart));
        assert_eq!(pipeline.state(), SubmissionState::Idle);
        assert_eq!(store.state().header_calls, 0);
    }

    #[test]
    fn test_missing_field_makes_no_store_call() {
        let store = MockStore::new();
        let (pipeline, _) = pipeline(store.clone());
        let cart = filled_cart();
        let mut form = form();
        form.address = " ".to_string();

        let err = pipeline.checkout(&cart, &form).unwrap_err();

        assert!(matches!(err, OrderError::MissingField("address")));
        assert_eq!(store.state().header_calls, 0);
        assert_eq!(lock(&cart).total_items(), 3);
    }

    #[test]
    fn test_concurrent_checkout_is_refused() {
        let (store, gate) = MockStore::gated();
        let (pipeline, _) = pipeline(store.clone());
        let pipeline = Arc::new(pipeline);
        let cart = Arc::new(filled_cart());

        let first = {
            let pipeline = Arc::clone(&pipeline);
            let cart = Arc::clone(&cart);
            thread::spawn(move || pipeline.checkout(&cart, &form()))
        };

        gate.entered.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pipeline.state(), SubmissionState::Submitting);

        let err = pipeline.checkout(&cart, &form()).unwrap_err();
        assert!(matches!(err, OrderError::SubmissionInProgress));

        gate.release.send(()).unwrap();
        first.join().unwrap().unwrap();

        assert_eq!(store.state().header_calls, 1);
        assert_eq!(pipeline.state(), SubmissionState::Succeeded);
    }

    #[test]
    fn test_reset() {
        let store = MockStore::failing_at(PersistenceStep::Header);
        let (pipeline, _) = pipeline(store);
        let cart = filled_cart();

        pipeline.checkout(&cart, &form()).unwrap_err();
        assert_eq!(pipeline.state(), SubmissionState::Failed);
        pipeline.reset();
        assert_eq!(pipeline.state(), SubmissionState::Idle);
    }

    #[test]
    fn test_order_history() {
        let (pipeline, _) = pipeline(MockStore::new());
        let cart = filled_cart();
        let receipt = pipeline.checkout(&cart, &form()).unwrap();

        let recent = pipeline.recent_orders(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].order_id, receipt.order_id);
        assert_eq!(pipeline.order_items(&receipt.order_id).unwrap().len(), 2);
    }

    #[test]
    fn test_fallback_menu_order_reaches_store_and_riders() {
        use crate::cart::JsonFileStorage;
        use crate::database::{OrderStore, SQLiteStore};
        use crate::menu::{load_menu, NoMenuSource};

        let dir = tempfile::tempdir().unwrap();
        let menu = load_menu(&NoMenuSource);

        let mut cart = CartStore::open(Box::new(JsonFileStorage::new(dir.path().join("storage.json"))));
        let silog = menu.find("CHICK SILOG").unwrap();
        let adobo = menu.find("CHICKEN ADOBO").unwrap();
        cart.add_item(silog);
        cart.add_item(silog);
        cart.add_item(adobo);
        cart.toggle_favorite("CHICKEN ADOBO");
        assert_eq!(cart.total_items(), 3);

        let store = SQLiteStore::open(dir.path().join("orders.sqlite3")).unwrap();
        let messenger = Arc::new(RecordingMessenger::new());
        let notifier = NotificationDispatcher::new(messenger.clone(), 2).unwrap();
        let submission = OrderPipeline::new(store, notifier);
        let cart = Mutex::new(cart);
        let mut checkout_form = form();
        checkout_form.notes = None;
        checkout_form.telegram_chat_id = Some("4242".to_string());

        let receipt = submission.checkout(&cart, &checkout_form).unwrap();
        assert_eq!(submission.state(), SubmissionState::Succeeded);
        assert_eq!(receipt.order_id, "1");

        let cart = cart.into_inner().unwrap();
        assert!(cart.cart().is_empty());
        assert_eq!(cart.favorites(), ["CHICKEN ADOBO".to_string()]);

        let orders = submission.recent_orders(5).unwrap();
        assert_eq!(orders.len(), 1);
        assert!((orders[0].header.total_price - 27.97).abs() < 1e-9);
        assert_eq!(orders[0].header.customer_telegram_chat_id.as_deref(), Some("4242"));
        let items = submission.order_items(&receipt.order_id).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_name, "CHICK SILOG");
        assert_eq!(items[0].quantity, 2);

        let sent = messenger.wait_for(1, Duration::from_secs(5));
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("<b>Total:</b> $27.97"));
        assert!(sent[0].text.contains("<b>Notes:</b> None"));
        assert_eq!(
            sent[0].reply_markup.inline_keyboard[0][0].callback_data,
            "accept_order_1_Ana%20Cruz"
        );

        // The emptied cart and the favorites survive a restart
        drop(cart);
        let reopened = CartStore::open(Box::new(JsonFileStorage::new(dir.path().join("storage.json"))));
        assert!(reopened.cart().is_empty());
        assert!(reopened.is_favorite("CHICKEN ADOBO"));

        // So do the orders
        drop(submission);
        let store = SQLiteStore::open(dir.path().join("orders.sqlite3")).unwrap();
        assert_eq!(store.list_orders(5).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_items_write_keeps_persisted_cart() {
        use crate::cart::STORAGE_KEY;

        let storage = MemoryStorage::default();
        let mut cart = CartStore::open(Box::new(storage.clone()));
        cart.add_item(&item("TOCILOG", 8.99));
        let cart = Mutex::new(cart);

        let (failing, messenger) = pipeline(MockStore::failing_at(PersistenceStep::Items));
        failing.checkout(&cart, &form()).unwrap_err();
        drop(failing);
        assert!(messenger.sent().is_empty());

        // The persisted blob still holds the line, a retry resubmits it
        assert!(storage.get(STORAGE_KEY).unwrap().contains("TOCILOG"));
        let working = MockStore::new();
        let (retry, _) = pipeline(working.clone());
        retry.checkout(&cart, &form()).unwrap();
        assert_eq!(working.state().items.len(), 1);
        assert!(!storage.get(STORAGE_KEY).unwrap().contains("TOCILOG"));
    }
}
