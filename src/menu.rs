//! Menu retrieval with a built-in fallback, and the filters of the menu page.

use crate::api::MenuItem;
use crate::errors::MenuError;
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Deadline for the whole menu request, from connecting to the last byte of the body
pub const MENU_TIMEOUT: Duration = Duration::from_secs(5);
/// Category filter value matching every item
pub const ALL_CATEGORIES: &str = "all";
const DEFAULT_EMOJI: &str = "🍽️";

/// Trait hiding where the menu comes from
pub trait MenuSource {
    fn fetch_menu(&self) -> Result<Vec<MenuItem>, MenuError>;
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RowPrice {
    Number(f64),
    Text(String),
}

/// One row of the `menuitems` table
#[derive(Deserialize, Debug)]
struct MenuRow {
    name: String,
    #[serde(default)]
    description: Option<String>,
    price: RowPrice,
    category: String,
    #[serde(default)]
    popular: Option<bool>,
    #[serde(default)]
    imageurl: Option<String>,
}

fn is_image_url(url: &str) -> bool {
    url.len() > 10 && !url.contains("source.unsplash.com")
}

impl MenuRow {
    fn into_item(self) -> Result<MenuItem, MenuError> {
        let invalid = |reason: &str| MenuError::InvalidRow {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        let price = match &self.price {
            RowPrice::Number(price) => *price,
            RowPrice::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid("price is not a number"))?,
        };
        if !price.is_finite() || price < 0.0 {
            return Err(invalid("price must be a non-negative amount"));
        }

        let image = self.imageurl.filter(|url| !url.is_empty());
        let image_url = image
            .as_deref()
            .filter(|url| is_image_url(url))
            .map(String::from)
            .unwrap_or_default();
        Ok(MenuItem {
            id: self.name.clone(),
            name: self.name,
            description: self.description.unwrap_or_default(),
            price,
            category: self.category,
            popular: self.popular.unwrap_or(false),
            emoji: image.unwrap_or_else(|| DEFAULT_EMOJI.to_string()),
            image_url,
        })
    }
}

/// Reads the menu table over the REST interface of the backend
pub struct HttpMenuSource {
    http: Client,
    base_url: String,
    path: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpMenuSource {
    pub fn new(base_url: String, path: String, api_key: Option<String>) -> Result<HttpMenuSource, MenuError> {
        let http = Client::builder()
            .connect_timeout(MENU_TIMEOUT)
            .build()
            .map_err(MenuError::Transport)?;
        Ok(HttpMenuSource {
            http,
            base_url,
            path,
            api_key,
            timeout: MENU_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> HttpMenuSource {
        self.timeout = timeout;
        self
    }

    /// Send the requests through `http` instead of the client built by [`HttpMenuSource::new`]
    pub fn with_client(mut self, http: Client) -> HttpMenuSource {
        self.http = http;
        self
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }

    fn transport_error(&self, err: reqwest::Error, started: Instant) -> MenuError {
        if err.is_timeout() || started.elapsed() >= self.timeout {
            MenuError::Timeout(self.timeout)
        } else {
            MenuError::Transport(err)
        }
    }
}

impl MenuSource for HttpMenuSource {
    fn fetch_menu(&self) -> Result<Vec<MenuItem>, MenuError> {
        let started = Instant::now();
        let mut request = self
            .http
            .get(self.url())
            .header(ACCEPT, "application/json")
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let resp = request.send().map_err(|err| self.transport_error(err, started))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MenuError::Status(status.as_u16()));
        }
        let body = resp.text().map_err(|err| self.transport_error(err, started))?;
        debug!(bytes = body.len(), elapsed = ?started.elapsed(), "Menu response received");

        serde_json::from_str::<Vec<MenuRow>>(&body)?
            .into_iter()
            .map(MenuRow::into_item)
            .collect()
    }
}

fn fallback_item(name: &str, description: &str, price: f64, category: &str, emoji: &str) -> MenuItem {
    MenuItem {
        id: name.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        price,
        category: category.to_string(),
        popular: true,
        emoji: emoji.to_string(),
        image_url: emoji.to_string(),
    }
}

/// Built-in menu served when the menu source cannot be reached
pub fn fallback_menu() -> Vec<MenuItem> {
    vec![
        fallback_item("CHICK SILOG", "Chicken with garlic rice and egg", 8.99, "FILIPINO SUNRICE", "🍳"),
        fallback_item("PORK TAPSILOG", "Tapa, sinangag, at itlog", 8.99, "FILIPINO SUNRICE", "🍳"),
        fallback_item("TOCILOG", "Tocino with garlic rice and egg", 8.99, "FILIPINO SUNRICE", "🍳"),
        fallback_item(
            "FRIED CHICKEN WITH GRAVY",
            "Crispy fried chicken with rich gravy",
            12.99,
            "DISH OF THE DAY",
            "🍗",
        ),
        fallback_item("CHICKEN ADOBO", "Classic Filipino chicken adobo", 9.99, "DISH OF THE DAY", "🍗"),
    ]
}

/// Where the items of a [`Menu`] came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuOrigin {
    Live,
    /// The source failed, `reason` describes the error
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Menu {
    pub items: Vec<MenuItem>,
    pub origin: MenuOrigin,
}

impl Menu {
    /// Items of `category` (every item for `None` or `"all"`) whose name or description
    /// contains `query`, ignoring case
    pub fn filter(&self, category: Option<&str>, query: &str) -> Vec<&MenuItem> {
        let query = query.to_lowercase();
        self.items
            .iter()
            .filter(|item| match category {
                None | Some(ALL_CATEGORIES) => true,
                Some(category) => item.category == category,
            })
            .filter(|item| {
                item.name.to_lowercase().contains(&query)
                    || item.description.to_lowercase().contains(&query)
            })
            .collect()
    }

    /// Distinct categories, in the order they first appear
    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = Vec::new();
        for item in &self.items {
            if !categories.contains(&item.category.as_str()) {
                categories.push(&item.category);
            }
        }
        categories
    }

    pub fn find(&self, id: &str) -> Option<&MenuItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn popular(&self) -> Vec<&MenuItem> {
        self.items.iter().filter(|item| item.popular).collect()
    }
}

/// Load the menu from `source`, falling back to the built-in menu on any error
pub fn load_menu(source: &dyn MenuSource) -> Menu {
    match source.fetch_menu() {
        Ok(items) => {
            info!(count = items.len(), "Menu loaded");
            Menu {
                items,
                origin: MenuOrigin::Live,
            }
        }
        Err(err) => {
            warn!(error = %err, "Failed to load menu, using fallback");
            Menu {
                items: fallback_menu(),
                origin: MenuOrigin::Fallback {
                    reason: err.to_string(),
                },
            }
        }
    }
}

/// Menu source that always fails, used when no backend URL is configured
pub struct NoMenuSource;

impl MenuSource for NoMenuSource {
    fn fetch_menu(&self) -> Result<Vec<MenuItem>, MenuError> {
        Err(MenuError::NotConfigured)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::fixtures::{json_reply, serve_once};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    fn source(base_url: String, path: &str, api_key: Option<&str>) -> HttpMenuSource {
        HttpMenuSource::new(base_url, path.to_string(), api_key.map(String::from))
            .unwrap()
            .with_client(Client::builder().no_proxy().build().unwrap())
    }

    /// Answer one request with response headers, then dribble the body one byte at a time
    fn trickle_server(body_len: usize, every: Duration) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 2 {
                line.clear();
            }
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body_len);
            stream.write_all(head.as_bytes()).unwrap();
            for _ in 0..body_len {
                std::thread::sleep(every);
                // The client hangs up once its deadline passes
                if stream.write_all(b" ").and_then(|_| stream.flush()).is_err() {
                    break;
                }
            }
        });
        (base_url, handle)
    }

    #[test]
    fn test_fetch_maps_rows() {
        let body = r#"[
            {"name": "SISIG", "description": null, "price": "7.50", "category": "DISH OF THE DAY",
             "popular": null, "imageurl": "https://cdn.example.com/sisig.jpg"},
            {"name": "HALO HALO", "description": "Shaved ice", "price": 4, "category": "DESSERT",
             "popular": true, "imageurl": "https://source.unsplash.com/random"},
            {"name": "LUMPIA", "price": 3.25, "category": "SIDES"}
        ]"#;
        let (base_url, handle) = serve_once(json_reply(body));
        let source = source(base_url + "/", "/rest/v1/menuitems?select=*", Some("anon-key"));

        let items = source.fetch_menu().unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].id, "SISIG");
        assert_eq!(items[0].description, "");
        assert_eq!(items[0].price, 7.5);
        assert!(!items[0].popular);
        assert_eq!(items[0].image_url, "https://cdn.example.com/sisig.jpg");
        assert!(items[1].popular);
        assert_eq!(items[1].image_url, "");
        assert_eq!(items[1].emoji, "https://source.unsplash.com/random");
        assert_eq!(items[2].emoji, "🍽️");

        let request = handle.join().unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /rest/v1/menuitems?select=* http/1.1\r\n"));
        assert!(request.contains("apikey: anon-key\r\n"));
        assert!(request.contains("authorization: bearer anon-key\r\n"));
    }

    #[test]
    fn test_fetch_reads_chunked_body() {
        let body = r#"[{"name": "LUMPIA", "price": 3.25, "category": "SIDES"}]"#;
        let (first, second) = body.split_at(20);
        let reply = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
            first.len(),
            first,
            second.len(),
            second
        );
        let (base_url, handle) = serve_once(reply);

        let items = source(base_url, "/menu", None).fetch_menu().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "LUMPIA");
        handle.join().unwrap();
    }

    #[test]
    fn test_fetch_rejects_bad_price() {
        let body = r#"[{"name": "FREE LUNCH", "price": "-1", "category": "X"}]"#;
        let (base_url, handle) = serve_once(json_reply(body));

        let err = source(base_url, "/menu", None).fetch_menu().unwrap_err();
        assert!(matches!(err, MenuError::InvalidRow { ref name, .. } if name == "FREE LUNCH"));
        handle.join().unwrap();
    }

    #[test]
    fn test_fetch_reports_status() {
        let (base_url, handle) = serve_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}".to_string(),
        );

        assert!(matches!(
            source(base_url, "/menu", None).fetch_menu(),
            Err(MenuError::Status(401))
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_fetch_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(500));
            drop(stream);
        });
        let source = source(base_url, "/menu", None).with_timeout(Duration::from_millis(50));

        let err = source.fetch_menu().unwrap_err();
        assert!(matches!(err, MenuError::Timeout(_)), "unexpected error {:?}", err);
        handle.join().unwrap();
    }

    #[test]
    fn test_deadline_covers_slow_body() {
        // 80 bytes at one every 40ms would take over three seconds
        let (base_url, handle) = trickle_server(80, Duration::from_millis(40));
        let source = source(base_url, "/menu", None).with_timeout(Duration::from_millis(300));

        let started = Instant::now();
        let err = source.fetch_menu().unwrap_err();

        assert!(matches!(err, MenuError::Timeout(_)), "unexpected error {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_load_menu_falls_back() {
        let menu = load_menu(&NoMenuSource);

        assert!(matches!(menu.origin, MenuOrigin::Fallback { ref reason } if reason.contains("No menu source")));
        assert_eq!(menu.items.len(), 5);
        assert_eq!(menu.items[0].id, "CHICK SILOG");
        assert_eq!(menu.find("CHICKEN ADOBO").map(|item| item.price), Some(9.99));
        assert_eq!(menu.popular().len(), 5);
    }

    #[test]
    fn test_categories_in_first_seen_order() {
        let menu = load_menu(&NoMenuSource);
        assert_eq!(menu.categories(), vec!["FILIPINO SUNRICE", "DISH OF THE DAY"]);
    }

    #[test]
    fn test_filter() {
        let menu = load_menu(&NoMenuSource);

        assert_eq!(menu.filter(None, "").len(), 5);
        assert_eq!(menu.filter(Some("all"), "").len(), 5);
        assert_eq!(menu.filter(Some("DISH OF THE DAY"), "").len(), 2);
        assert!(menu.filter(Some("dish of the day"), "").is_empty());

        let chicken = menu.filter(None, "cHiCkEn");
        let names: Vec<&str> = chicken.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, vec!["CHICK SILOG", "FRIED CHICKEN WITH GRAVY", "CHICKEN ADOBO"]);

        // Matches on the description too
        assert_eq!(menu.filter(Some("FILIPINO SUNRICE"), "sinangag").len(), 1);
    }
}
