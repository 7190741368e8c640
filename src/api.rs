// This file contains the basic types shared by the cart, the order store and the notifier
use serde::{Deserialize, Serialize};

/// Payment status given to every new order. Nothing in this crate moves it further.
pub const PAYMENT_PENDING: &str = "pending";

/// An item of the menu, as produced by the menu source
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MenuItem {
    /// Unique key of the item
    pub id: String,
    /// Display name, also used as the line name on persisted orders
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Unit price, never negative
    pub price: f64,
    pub category: String,
    #[serde(default)]
    pub popular: bool,
    #[serde(default)]
    pub emoji: String,
    #[serde(rename = "imageURL", default)]
    pub image_url: String,
}

/// A menu item with the quantity selected in the cart
///
/// The item fields are flattened so that a persisted line reads like a menu item with an
/// extra `quantity` key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CartLine {
    #[serde(flatten)]
    pub item: MenuItem,
    /// Always strictly positive while the line is in a cart
    pub quantity: u32,
}

impl CartLine {
    pub fn new(item: MenuItem, quantity: u32) -> CartLine {
        CartLine { item, quantity }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    /// Unit price times quantity
    pub fn line_total(&self) -> f64 {
        self.item.price * f64::from(self.quantity)
    }
}

/// An order ready to be submitted
///
/// `items` is a copy of the cart lines taken at assembly time, clearing the cart afterwards
/// does not touch it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Order {
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub total_price: f64,
    pub items: Vec<CartLine>,
    pub payment_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_telegram_chat_id: Option<String>,
}

impl Order {
    /// Sum of the line totals of the snapshot
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(CartLine::line_total).sum()
    }
}

/// Top-level record written to the order store, one per checkout
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OrderHeader {
    pub order_number: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub total_price: f64,
    pub payment_status: String,
    /// Empty when the customer left no notes
    pub notes: String,
    pub customer_telegram_chat_id: Option<String>,
}

impl OrderHeader {
    /// Build the header of `order`. The total is recomputed from the item snapshot.
    pub fn from_order(order: &Order, order_number: String) -> OrderHeader {
        OrderHeader {
            order_number,
            customer_name: order.customer_name.clone(),
            customer_phone: order.customer_phone.clone(),
            delivery_address: order.delivery_address.clone(),
            total_price: order.items_total(),
            payment_status: order.payment_status.clone(),
            notes: order.notes.clone().unwrap_or_default(),
            customer_telegram_chat_id: order.customer_telegram_chat_id.clone(),
        }
    }
}

/// An order header as echoed back by the store, with its generated identifier
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredHeader {
    pub order_id: String,
    #[serde(flatten)]
    pub header: OrderHeader,
}

/// One row per cart line of a persisted order
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OrderItemRecord {
    pub order_id: String,
    pub item_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub total_price: f64,
}

impl OrderItemRecord {
    pub fn from_line(order_id: &str, line: &CartLine) -> OrderItemRecord {
        OrderItemRecord {
            order_id: order_id.to_string(),
            item_name: line.item.name.clone(),
            quantity: line.quantity,
            unit_price: line.item.price,
            total_price: line.line_total(),
        }
    }
}

/// A fully persisted order: the store's header echo plus the submitted lines
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedOrder {
    pub order_id: String,
    pub header: OrderHeader,
    pub items: Vec<CartLine>,
}

impl PersistedOrder {
    pub fn order_number(&self) -> &str {
        &self.header.order_number
    }
}

/// What the caller gets back from a successful submission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OrderReceipt {
    pub order_id: String,
    pub order_number: String,
}
