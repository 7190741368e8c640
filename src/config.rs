//! Runtime configuration, resolved once from `STOREFRONT_*` environment variables.

use crate::errors::ConfigError;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const DEFAULT_DATA_DIR: &str = ".storefront";
pub const DEFAULT_MENU_PATH: &str = "/rest/v1/menuitems?select=*";
pub const DEFAULT_BOT_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_NOTIFY_WORKERS: usize = 2;

pub const DATA_DIR_VAR: &str = "STOREFRONT_DATA_DIR";
pub const MENU_URL_VAR: &str = "STOREFRONT_MENU_URL";
pub const MENU_PATH_VAR: &str = "STOREFRONT_MENU_PATH";
pub const MENU_API_KEY_VAR: &str = "STOREFRONT_MENU_API_KEY";
pub const BOT_API_URL_VAR: &str = "STOREFRONT_BOT_API_URL";
pub const BOT_TOKEN_VAR: &str = "STOREFRONT_BOT_TOKEN";
pub const BOT_CHAT_ID_VAR: &str = "STOREFRONT_BOT_CHAT_ID";
pub const NOTIFY_WORKERS_VAR: &str = "STOREFRONT_NOTIFY_WORKERS";

const STORAGE_FILE: &str = "storage.json";
const DATABASE_FILE: &str = "orders.sqlite3";
const REDACTED: &str = "<REDACTED>";

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^https?://[a-zA-Z0-9\.\-]+(:\d{1,5})?(/\S*)?$").ok())
        .as_ref()
}

/// Validate the format of a base URL
///
/// Returns its input if the URL is in the format http(s)://<host>[:<port>][/<path>], otherwise
/// InvalidUrl naming `variable`.
pub fn validate_url<'a>(url: &'a str, variable: &'static str) -> Result<&'a str, ConfigError> {
    match url_pattern() {
        Some(re) if re.is_match(url) => Ok(url),
        _ => Err(ConfigError::InvalidUrl(variable)),
    }
}

/// Where the menu is read from
#[derive(Clone, PartialEq, Eq)]
pub struct MenuConfig {
    pub base_url: String,
    pub path: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for MenuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MenuConfig")
            .field("base_url", &self.base_url)
            .field("path", &self.path)
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .finish()
    }
}

/// The bot account posting new-order alerts
#[derive(Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub api_url: String,
    pub token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("api_url", &self.api_url)
            .field("token", &REDACTED)
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// None when no menu source is configured, the built-in menu is used
    pub menu: Option<MenuConfig>,
    /// None when no messaging service is configured, notifications are only logged
    pub bot: Option<BotConfig>,
    pub notify_workers: usize,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_vars(std::env::vars())
    }

    /// Build the configuration from `(name, value)` pairs. Empty values count as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Config, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v): &(String, String)| !v.trim().is_empty())
            .collect::<HashMap<String, String>>();
        let get = |name: &str| vars.get(name).cloned();

        let menu = match get(MENU_URL_VAR) {
            Some(base_url) => Some(MenuConfig {
                base_url: validate_url(&base_url, MENU_URL_VAR)?.to_string(),
                path: get(MENU_PATH_VAR).unwrap_or_else(|| DEFAULT_MENU_PATH.to_string()),
                api_key: get(MENU_API_KEY_VAR),
            }),
            None => None,
        };

        let bot = match (get(BOT_TOKEN_VAR), get(BOT_CHAT_ID_VAR)) {
            (None, None) => None,
            (Some(token), Some(chat_id)) => {
                let api_url = get(BOT_API_URL_VAR).unwrap_or_else(|| DEFAULT_BOT_API_URL.to_string());
                Some(BotConfig {
                    api_url: validate_url(&api_url, BOT_API_URL_VAR)?.to_string(),
                    token,
                    chat_id,
                })
            }
            (None, _) => return Err(ConfigError::MissingVariable(BOT_TOKEN_VAR)),
            (_, None) => return Err(ConfigError::MissingVariable(BOT_CHAT_ID_VAR)),
        };

        let notify_workers = match get(NOTIFY_WORKERS_VAR) {
            Some(workers) => match workers.trim().parse::<usize>() {
                Ok(workers) if workers > 0 => workers,
                _ => return Err(ConfigError::InvalidValue(NOTIFY_WORKERS_VAR)),
            },
            None => DEFAULT_NOTIFY_WORKERS,
        };

        Ok(Config {
            data_dir: PathBuf::from(get(DATA_DIR_VAR).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())),
            menu,
            bot,
            notify_workers,
        })
    }

    /// File holding the persisted cart
    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join(STORAGE_FILE)
    }

    /// SQLite database holding the orders
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}
