//! Cart contents, favorites and the derived totals.
//!
//! [`CartStore`] owns the state and writes it through its [`CartStorage`] after every
//! mutation that changes something. Totals are computed from the current lines on each call.

pub mod storage;

use crate::api::{CartLine, MenuItem};
use crate::errors::CartError;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

pub use storage::{CartStorage, JsonFileStorage, MemoryStorage, STORAGE_KEY};

/// Mapping from item id to cart line, keeping insertion order for display
///
/// Serialized as a JSON object keyed by item id. Deserialization rejects entries whose key
/// differs from the line's item id, zero quantities and duplicate keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cart {
    lines: Vec<CartLine>,
}

impl Cart {
    pub fn get(&self, id: &str) -> Option<&CartLine> {
        self.lines.iter().find(|line| line.id() == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut CartLine> {
        self.lines.iter_mut().find(|line| line.id() == id)
    }

    /// Lines in the order they were first added
    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn total_price(&self) -> f64 {
        self.lines.iter().map(CartLine::line_total).sum()
    }

    /// Sum of the quantities, wide enough that it cannot overflow
    pub fn total_items(&self) -> u64 {
        self.lines.iter().map(|line| u64::from(line.quantity)).sum()
    }

    /// Remove the line with the given id, returning whether one was present
    fn remove(&mut self, id: &str) -> bool {
        let old_len = self.lines.len();
        self.lines.retain(|line| line.id() != id);
        old_len != self.lines.len()
    }
}

impl Serialize for Cart {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.lines.len()))?;
        for line in &self.lines {
            map.serialize_entry(line.id(), line)?;
        }
        map.end()
    }
}

struct CartVisitor;

impl<'de> Visitor<'de> for CartVisitor {
    type Value = Cart;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of item ids to cart lines")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Cart, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut cart = Cart::default();
        while let Some((key, line)) = access.next_entry::<String, CartLine>()? {
            if key != line.item.id {
                return Err(de::Error::custom(format!(
                    "cart key '{}' does not match item id '{}'",
                    key, line.item.id
                )));
            }
            if line.quantity == 0 {
                return Err(de::Error::custom(format!("zero quantity for '{}'", key)));
            }
            if cart.get(&key).is_some() {
                return Err(de::Error::custom(format!("duplicate cart key '{}'", key)));
            }
            cart.lines.push(line);
        }
        Ok(cart)
    }
}

impl<'de> Deserialize<'de> for Cart {
    fn deserialize<D>(deserializer: D) -> Result<Cart, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(CartVisitor)
    }
}

/// Everything the store persists: the cart and the favorite item ids
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CartSnapshot {
    #[serde(default)]
    pub cart: Cart,
    #[serde(default)]
    pub favorites: Vec<String>,
}

impl CartSnapshot {
    fn dedup_favorites(&mut self) {
        let mut seen = HashSet::new();
        self.favorites.retain(|id| seen.insert(id.clone()));
    }
}

/// Owner of the cart state
pub struct CartStore {
    state: CartSnapshot,
    storage: Box<dyn CartStorage + Send>,
}

impl CartStore {
    /// Create a store, rehydrating whatever the storage holds
    ///
    /// Unreadable state is logged and replaced by an empty cart, the customer should still be
    /// able to shop.
    pub fn open(storage: Box<dyn CartStorage + Send>) -> CartStore {
        let mut state = match storage.load() {
            Ok(Some(state)) => {
                debug!(
                    lines = state.cart.len(),
                    favorites = state.favorites.len(),
                    "Rehydrated cart state"
                );
                state
            }
            Ok(None) => CartSnapshot::default(),
            Err(err) => {
                warn!(error = %err, "Discarding unreadable cart state");
                CartSnapshot::default()
            }
        };
        state.dedup_favorites();
        CartStore { state, storage }
    }

    /// Add one unit of `item`, creating the line if needed
    pub fn add_item(&mut self, item: &MenuItem) {
        match self.state.cart.get_mut(&item.id) {
            Some(line) => line.quantity = line.quantity.saturating_add(1),
            None => self.state.cart.lines.push(CartLine::new(item.clone(), 1)),
        }
        self.persist();
    }

    /// Remove the line for `item_id`. Unknown ids are ignored.
    pub fn remove_item(&mut self, item_id: &str) {
        if self.state.cart.remove(item_id) {
            self.persist();
        }
    }

    /// Set the quantity of an existing line
    ///
    /// A quantity of zero or less removes the line. A positive quantity for an item that is
    /// not in the cart is rejected, there is no menu item to build the line from.
    pub fn update_quantity(&mut self, item_id: &str, quantity: i64) -> Result<(), CartError> {
        if quantity <= 0 {
            self.remove_item(item_id);
            return Ok(());
        }
        let quantity =
            u32::try_from(quantity).map_err(|_| CartError::InvalidQuantity(quantity))?;
        let line = self
            .state
            .cart
            .get_mut(item_id)
            .ok_or_else(|| CartError::InvalidItem(item_id.to_string()))?;
        line.quantity = quantity;
        self.persist();
        Ok(())
    }

    pub fn toggle_favorite(&mut self, item_id: &str) {
        let favorites = &mut self.state.favorites;
        match favorites.iter().position(|id| id == item_id) {
            Some(index) => {
                favorites.remove(index);
            }
            None => favorites.push(item_id.to_string()),
        }
        self.persist();
    }

    pub fn is_favorite(&self, item_id: &str) -> bool {
        self.state.favorites.iter().any(|id| id == item_id)
    }

    /// Favorite ids in the order they were marked
    pub fn favorites(&self) -> &[String] {
        &self.state.favorites
    }

    /// Empty the cart, leaving favorites alone. Clearing an empty cart does nothing.
    pub fn clear_cart(&mut self) {
        if self.state.cart.is_empty() {
            return;
        }
        self.state.cart.lines.clear();
        self.persist();
    }

    pub fn cart(&self) -> &Cart {
        &self.state.cart
    }

    pub fn total_price(&self) -> f64 {
        self.state.cart.total_price()
    }

    pub fn total_items(&self) -> u64 {
        self.state.cart.total_items()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> CartSnapshot {
        self.state.clone()
    }

    fn persist(&mut self) {
        if let Err(err) = self.storage.save(&self.state) {
            warn!(error = %err, "Failed to persist cart state");
        }
    }
}
