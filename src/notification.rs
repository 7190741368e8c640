//! New-order notifications: rendering, delivery and the detached dispatch queue.
//!
//! The formatter is a pure function of a persisted order. Delivery goes through a
//! [`Messenger`], and the [`NotificationDispatcher`] runs it on worker threads so a slow or
//! failing messaging service never reaches the customer. Every delivery error ends in the log.

use crate::api::PersistedOrder;
use crate::config::BotConfig;
use crate::errors::NotificationError;
use crate::threadpool::ThreadPool;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

pub const ACCEPT_BUTTON_TEXT: &str = "✅ Accept Order";
pub const ACCEPT_ACTION: &str = "accept_order";
pub const MISSING_PHONE: &str = "N/A";
pub const MISSING_NOTES: &str = "None";
/// Largest `callback_data` the bot API accepts, in bytes
pub const CALLBACK_DATA_LIMIT: usize = 64;
const SEPARATOR: &str = "--------------------------------";

/// Characters left alone by JavaScript's `encodeURIComponent`
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    #[serde(rename = "HTML")]
    Html,
}

/// A button attached under a message, pressing it sends `callback_data` back to the bot
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub inline_keyboard: Vec<Vec<InlineButton>>,
}

/// Rendered notification, without its recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub parse_mode: ParseMode,
    pub reply_markup: InlineKeyboard,
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

/// Callback data of the accept button: `accept_order_<order id>_<url-escaped name>`
pub fn accept_callback_data(order_id: &str, customer_name: &str) -> String {
    format!(
        "{}_{}_{}",
        ACCEPT_ACTION,
        order_id,
        utf8_percent_encode(customer_name, URI_COMPONENT)
    )
}

/// Render the new-order alert for the riders' channel
pub fn format_new_order(order: &PersistedOrder) -> OutboundMessage {
    let header = &order.header;
    let callback_data = accept_callback_data(&order.order_id, &header.customer_name);
    if callback_data.len() > CALLBACK_DATA_LIMIT {
        warn!(
            order_number = %header.order_number,
            len = callback_data.len(),
            "Accept button data is over the bot API limit, the message may be refused"
        );
    }
    let items = order
        .items
        .iter()
        .map(|line| format!("• {}x {}", line.quantity, escape_html(&line.item.name)))
        .collect::<Vec<_>>()
        .join("\n");

    let text = [
        "🚨 <b>NEW ORDER ALERT!</b> 🚨".to_string(),
        String::new(),
        format!("<b>Order #{}</b>", escape_html(&header.order_number)),
        SEPARATOR.to_string(),
        format!("<b>Customer:</b> {}", escape_html(&header.customer_name)),
        format!(
            "<b>Phone:</b> {}",
            escape_html(or_placeholder(&header.customer_phone, MISSING_PHONE))
        ),
        format!("<b>Address:</b> {}", escape_html(&header.delivery_address)),
        format!("<b>Total:</b> ${:.2}", header.total_price),
        format!(
            "<b>Notes:</b> {}",
            escape_html(or_placeholder(&header.notes, MISSING_NOTES))
        ),
        String::new(),
        "<b>Items:</b>".to_string(),
        items,
        String::new(),
        SEPARATOR.to_string(),
        "<i>Accept this order to start delivery!</i>".to_string(),
    ]
    .join("\n");

    OutboundMessage {
        text,
        parse_mode: ParseMode::Html,
        reply_markup: InlineKeyboard {
            inline_keyboard: vec![vec![InlineButton {
                text: ACCEPT_BUTTON_TEXT.to_string(),
                callback_data,
            }]],
        },
    }
}

/// Delivery acknowledgement from the messaging service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub message_id: Option<i64>,
}

/// Trait hiding the messaging service
pub trait Messenger: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<DeliveryAck, NotificationError>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: ParseMode,
    reply_markup: &'a InlineKeyboard,
}

#[derive(Deserialize)]
struct BotReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Posts messages to a Telegram-style bot API (`<api url>/bot<token>/sendMessage`)
pub struct HttpMessenger {
    http: Client,
    config: BotConfig,
    timeout: Duration,
}

impl HttpMessenger {
    pub fn new(config: BotConfig, timeout: Duration) -> Result<HttpMessenger, NotificationError> {
        let http = Client::builder().connect_timeout(timeout).build()?;
        Ok(HttpMessenger { http, config, timeout })
    }

    /// Send the requests through `http` instead of the client built by [`HttpMessenger::new`]
    pub fn with_client(mut self, http: Client) -> HttpMessenger {
        self.http = http;
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_url.trim_end_matches('/'),
            self.config.token
        )
    }
}

impl Messenger for HttpMessenger {
    fn send(&self, message: &OutboundMessage) -> Result<DeliveryAck, NotificationError> {
        let resp = self
            .http
            .post(self.url())
            .json(&SendMessage {
                chat_id: &self.config.chat_id,
                text: &message.text,
                parse_mode: message.parse_mode,
                reply_markup: &message.reply_markup,
            })
            .timeout(self.timeout)
            .send()?;
        let status = resp.status();
        let body = resp.text()?;

        // The bot API answers errors with a JSON body too, prefer its description
        match serde_json::from_str::<BotReply>(&body) {
            Ok(reply) if reply.ok => Ok(DeliveryAck {
                message_id: reply.result.map(|sent| sent.message_id),
            }),
            Ok(reply) => Err(NotificationError::Rejected(
                reply
                    .description
                    .unwrap_or_else(|| format!("status {}", status.as_u16())),
            )),
            Err(_) if !status.is_success() => Err(NotificationError::Status(status.as_u16())),
            Err(err) => Err(err.into()),
        }
    }
}

/// Messenger used when no messaging service is configured: the message only goes to the log
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn send(&self, message: &OutboundMessage) -> Result<DeliveryAck, NotificationError> {
        info!(text = %message.text, "No messaging service configured, order notification logged");
        Ok(DeliveryAck { message_id: None })
    }
}

/// Messenger keeping every message it is asked to send, optionally failing each delivery
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<OutboundMessage>>,
    changed: Condvar,
    fail: bool,
}

impl RecordingMessenger {
    pub fn new() -> RecordingMessenger {
        RecordingMessenger::default()
    }

    /// Records the message then fails the delivery
    pub fn failing() -> RecordingMessenger {
        RecordingMessenger {
            fail: true,
            ..RecordingMessenger::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until at least `count` messages were attempted or `timeout` elapsed
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<OutboundMessage> {
        let guard = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |sent| sent.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }
}

impl Messenger for RecordingMessenger {
    fn send(&self, message: &OutboundMessage) -> Result<DeliveryAck, NotificationError> {
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(message.clone());
        let message_id = sent.len() as i64;
        drop(sent);
        self.changed.notify_all();

        if self.fail {
            Err(NotificationError::Rejected("recording messenger set to fail".to_string()))
        } else {
            Ok(DeliveryAck {
                message_id: Some(message_id),
            })
        }
    }
}

/// Queue of detached notification jobs
///
/// Dropping the dispatcher waits for queued notifications to finish.
pub struct NotificationDispatcher {
    pool: ThreadPool,
    messenger: Arc<dyn Messenger>,
}

impl NotificationDispatcher {
    pub fn new(messenger: Arc<dyn Messenger>, workers: usize) -> std::io::Result<Self> {
        Ok(NotificationDispatcher {
            pool: ThreadPool::new("notify", workers)?,
            messenger,
        })
    }

    /// Queue the new-order notification for `order` and return immediately
    pub fn dispatch(&self, order: PersistedOrder) {
        let messenger = Arc::clone(&self.messenger);
        let order_number = order.order_number().to_string();
        let queued = self.pool.execute(move || {
            let message = format_new_order(&order);
            match messenger.send(&message) {
                Ok(ack) => info!(
                    order_number = %order.order_number(),
                    message_id = ?ack.message_id,
                    "Order notification delivered"
                ),
                Err(err) => error!(
                    order_number = %order.order_number(),
                    error = %err,
                    "Order notification failed"
                ),
            }
        });
        if !queued {
            error!(order_number = %order_number, "Order notification dropped");
        }
    }
}
