use crate::api::{Order, PAYMENT_PENDING};
use crate::cart::CartStore;
use crate::errors::OrderError;

/// Fields entered by the customer on the checkout form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutForm {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub notes: Option<String>,
    pub telegram_chat_id: Option<String>,
}

fn required(value: &str, field: &'static str) -> Result<String, OrderError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(OrderError::MissingField(field));
    }
    Ok(value.to_string())
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Build the order to submit from the current cart and the checkout form
///
/// An empty cart is rejected before the form is looked at. The total comes from the cart and
/// the items are a copy of its lines, so clearing the cart afterwards leaves the order intact.
pub fn assemble_order(cart: &CartStore, form: &CheckoutForm) -> Result<Order, OrderError> {
    if cart.cart().is_empty() {
        return Err(OrderError::EmptyCart);
    }

    Ok(Order {
        customer_name: required(&form.name, "name")?,
        customer_phone: required(&form.phone, "phone")?,
        delivery_address: required(&form.address, "address")?,
        notes: optional(&form.notes),
        total_price: cart.total_price(),
        items: cart.cart().lines().to_vec(),
        payment_status: PAYMENT_PENDING.to_string(),
        customer_telegram_chat_id: optional(&form.telegram_chat_id),
    })
}
