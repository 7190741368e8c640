use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storefront::api::MenuItem;
use storefront::cart::{CartStore, JsonFileStorage};
use storefront::checkout::CheckoutForm;
use storefront::config::Config;
use storefront::database::{OrderStore, SQLiteStore};
use storefront::errors::Result;
use storefront::logging::setup_tracing;
use storefront::menu::{load_menu, HttpMenuSource, Menu, MenuOrigin, MenuSource, NoMenuSource};
use storefront::notification::{HttpMessenger, LogMessenger, Messenger, NotificationDispatcher};
use storefront::submission::OrderPipeline;
use thiserror::Error;

const MESSENGER_TIMEOUT: Duration = Duration::from_secs(10);
const RECENT_ORDERS: usize = 20;

/// Errors that can occur when parsing the command line arguments
#[derive(Debug, Error, PartialEq, Eq)]
enum CliError {
    #[error("Missing parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("Invalid value '{1}' for '{0}'")]
    InvalidParameter(&'static str, String),
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
    #[error("No item '{0}' on the menu")]
    UnknownItem(String),
}

#[derive(Debug, PartialEq)]
enum Action {
    Menu {
        category: Option<String>,
        query: String,
    },
    Add(String),
    Remove(String),
    Quantity(String, i64),
    Favorite(String),
    Cart,
    Clear,
    Orders,
    Checkout(CheckoutForm),
}

/// Item ids may contain spaces, the remaining words are joined back
fn item_id<I>(args: I) -> std::result::Result<String, CliError>
where
    I: Iterator<Item = String>,
{
    let id = args.collect::<Vec<_>>().join(" ");
    if id.trim().is_empty() {
        return Err(CliError::MissingParameter("item id"));
    }
    Ok(id)
}

fn parse_checkout<I>(mut args: I) -> std::result::Result<Action, CliError>
where
    I: Iterator<Item = String>,
{
    let mut form = CheckoutForm::default();
    while let Some(flag) = args.next() {
        let field = match flag.as_str() {
            "--name" => &mut form.name,
            "--phone" => &mut form.phone,
            "--address" => &mut form.address,
            "--notes" => form.notes.get_or_insert_with(String::new),
            "--chat-id" => form.telegram_chat_id.get_or_insert_with(String::new),
            _ => return Err(CliError::InvalidParameter("checkout flag", flag.clone())),
        };
        *field = args.next().ok_or(CliError::MissingParameter("flag value"))?;
    }
    Ok(Action::Checkout(form))
}

fn parse_cli_args<I>(mut args: I) -> std::result::Result<Action, CliError>
where
    I: Iterator<Item = String>,
{
    args.next(); // Skip the program name
    let command = args.next().ok_or(CliError::MissingParameter("command"))?;

    match command.to_ascii_lowercase().as_str() {
        "menu" => Ok(Action::Menu {
            category: args.next(),
            query: args.collect::<Vec<_>>().join(" "),
        }),
        "add" => Ok(Action::Add(item_id(args)?)),
        "remove" => Ok(Action::Remove(item_id(args)?)),
        "fav" => Ok(Action::Favorite(item_id(args)?)),
        "qty" => {
            let mut words = args.collect::<Vec<_>>();
            let quantity = words.pop().ok_or(CliError::MissingParameter("quantity"))?;
            let quantity = quantity
                .parse::<i64>()
                .map_err(|_| CliError::InvalidParameter("quantity", quantity))?;
            Ok(Action::Quantity(item_id(words.into_iter())?, quantity))
        }
        "cart" => Ok(Action::Cart),
        "clear" => Ok(Action::Clear),
        "orders" => Ok(Action::Orders),
        "checkout" => parse_checkout(args),
        _ => Err(CliError::UnknownCommand(command)),
    }
}

fn menu_source(config: &Config) -> Result<Box<dyn MenuSource>> {
    let source: Box<dyn MenuSource> = match &config.menu {
        Some(menu) => Box::new(HttpMenuSource::new(
            menu.base_url.clone(),
            menu.path.clone(),
            menu.api_key.clone(),
        )?),
        None => Box::new(NoMenuSource),
    };
    Ok(source)
}

fn messenger(config: &Config) -> Result<Arc<dyn Messenger>> {
    let messenger: Arc<dyn Messenger> = match &config.bot {
        Some(bot) => Arc::new(HttpMessenger::new(bot.clone(), MESSENGER_TIMEOUT)?),
        None => Arc::new(LogMessenger),
    };
    Ok(messenger)
}

fn print_item(item: &MenuItem, favorite: bool) {
    println!(
        "{} {:<28} ${:>6.2}  [{}]{}{}",
        item.emoji,
        item.name,
        item.price,
        item.category,
        if item.popular { " popular" } else { "" },
        if favorite { " ★" } else { "" },
    );
}

fn print_menu(menu: &Menu, cart: &CartStore, category: Option<&str>, query: &str) {
    if let MenuOrigin::Fallback { reason } = &menu.origin {
        println!("(offline menu: {})", reason);
    }
    println!("Categories: all, {}", menu.categories().join(", "));
    let items = menu.filter(category, query);
    if items.is_empty() {
        println!("No dishes found");
    }
    for item in items {
        print_item(item, cart.is_favorite(&item.id));
    }
}

fn print_cart(cart: &CartStore) {
    if cart.cart().is_empty() {
        println!("Your cart is empty");
    }
    for line in cart.cart().lines() {
        println!(
            "{:>3}x {:<28} ${:>7.2}",
            line.quantity,
            line.item.name,
            line.line_total()
        );
    }
    println!("{} item(s), total ${:.2}", cart.total_items(), cart.total_price());
    if !cart.favorites().is_empty() {
        println!("Favorites: {}", cart.favorites().join(", "));
    }
}

fn print_orders(store: &SQLiteStore) -> Result<()> {
    let orders = store.list_orders(RECENT_ORDERS)?;
    if orders.is_empty() {
        println!("No orders yet");
    }
    for order in orders {
        let header = &order.header;
        println!(
            "{} {} ${:.2} [{}] {}",
            header.order_number,
            header.customer_name,
            header.total_price,
            header.payment_status,
            header.delivery_address
        );
        for item in store.get_order_items(&order.order_id)? {
            println!("    {}x {}", item.quantity, item.item_name);
        }
    }
    Ok(())
}

fn run(config: Config, action: Action) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let mut cart = CartStore::open(Box::new(JsonFileStorage::new(config.storage_path())));

    match action {
        Action::Menu { category, query } => {
            let menu = load_menu(menu_source(&config)?.as_ref());
            print_menu(&menu, &cart, category.as_deref(), &query);
        }
        Action::Add(id) => {
            let menu = load_menu(menu_source(&config)?.as_ref());
            let item = menu.find(&id).ok_or(CliError::UnknownItem(id.clone()))?;
            cart.add_item(item);
            print_cart(&cart);
        }
        Action::Remove(id) => {
            cart.remove_item(&id);
            print_cart(&cart);
        }
        Action::Quantity(id, quantity) => {
            cart.update_quantity(&id, quantity)?;
            print_cart(&cart);
        }
        Action::Favorite(id) => {
            cart.toggle_favorite(&id);
            let state = if cart.is_favorite(&id) { "added to" } else { "removed from" };
            println!("{} {} favorites", id, state);
        }
        Action::Cart => print_cart(&cart),
        Action::Clear => {
            cart.clear_cart();
            print_cart(&cart);
        }
        Action::Orders => print_orders(&SQLiteStore::open(config.database_path())?)?,
        Action::Checkout(form) => {
            let store = SQLiteStore::open(config.database_path())?;
            let notifier = NotificationDispatcher::new(messenger(&config)?, config.notify_workers)?;
            let pipeline = OrderPipeline::new(store, notifier);
            let cart = Mutex::new(cart);

            let receipt = pipeline.checkout(&cart, &form)?;
            println!("Order placed! Order number: {}", receipt.order_number);
            // Dropping the pipeline waits for the notification to go out
        }
    }
    Ok(())
}

fn start() -> Result<()> {
    let config = Config::from_env()?;
    let action = parse_cli_args(std::env::args())?;
    run(config, action)
}

fn main() -> ExitCode {
    setup_tracing();

    match start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
