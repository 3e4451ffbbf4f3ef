use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::domain::UserId;
use tracing::warn;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_url: String,
    pub realtime_url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub user_id: Option<String>,
    pub hide_archived: bool,
    pub message_page_size: u32,
    pub mentions_page_size: u32,
    pub search_page_size: u32,
    pub channel_list_debounce_ms: u64,
    pub rpc_retry_attempts: u32,
    pub rpc_retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            realtime_url: None,
            api_key: None,
            api_secret: None,
            user_id: None,
            hide_archived: true,
            message_page_size: 50,
            mentions_page_size: 10,
            search_page_size: 20,
            channel_list_debounce_ms: 1000,
            rpc_retry_attempts: 3,
            rpc_retry_delay_ms: 500,
        }
    }
}

impl Settings {
    pub fn channel_list_debounce(&self) -> Duration {
        Duration::from_millis(self.channel_list_debounce_ms)
    }

    pub fn rpc_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rpc_retry_delay_ms)
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.user_id.as_deref().map(UserId::from)
    }

    pub fn auth_header(&self) -> Option<String> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Some(format!("token {key}:{secret}")),
            _ => None,
        }
    }

    /// Explicit realtime URL, or the server URL with a websocket scheme and the
    /// socket.io endpoint.
    pub fn realtime_endpoint(&self) -> ClientResult<Url> {
        if let Some(raw) = &self.realtime_url {
            return Url::parse(raw)
                .map_err(|err| ClientError::Config(format!("realtime_url {raw}: {err}")));
        }

        let mut url = Url::parse(&self.server_url)
            .map_err(|err| ClientError::Config(format!("server_url {}: {err}", self.server_url)))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ClientError::Config(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config("cannot derive websocket scheme".into()))?;
        url.set_path("/socket.io/");
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }

    pub fn validate(&self) -> ClientResult<()> {
        Url::parse(&self.server_url)
            .map_err(|err| ClientError::Config(format!("server_url {}: {err}", self.server_url)))?;
        for (name, value) in [
            ("message_page_size", self.message_page_size),
            ("mentions_page_size", self.mentions_page_size),
            ("search_page_size", self.search_page_size),
        ] {
            if value == 0 {
                return Err(ClientError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.rpc_retry_attempts == 0 {
            return Err(ClientError::Config(
                "rpc_retry_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Defaults, then `client.toml` (or `path`), then environment overrides.
pub fn load_settings(path: Option<&Path>) -> Settings {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<Settings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), "config: ignoring unparsable file: {err}");
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Applies `CHAT_*` then `APP__*` variables; the latter win.
pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |suffix: &str| {
        lookup(&format!("APP__{suffix}")).or_else(|| lookup(&format!("CHAT_{suffix}")))
    };

    if let Some(v) = read("SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = read("REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = read("API_KEY") {
        settings.api_key = Some(v);
    }
    if let Some(v) = read("API_SECRET") {
        settings.api_secret = Some(v);
    }
    if let Some(v) = read("USER_ID") {
        settings.user_id = Some(v);
    }
    if let Some(v) = read("HIDE_ARCHIVED") {
        match v.as_str() {
            "1" | "true" => settings.hide_archived = true,
            "0" | "false" => settings.hide_archived = false,
            other => warn!("config: ignoring HIDE_ARCHIVED={other}"),
        }
    }
    parse_number(read("MESSAGE_PAGE_SIZE"), &mut settings.message_page_size);
    parse_number(read("MENTIONS_PAGE_SIZE"), &mut settings.mentions_page_size);
    parse_number(read("SEARCH_PAGE_SIZE"), &mut settings.search_page_size);
    parse_number(
        read("CHANNEL_LIST_DEBOUNCE_MS"),
        &mut settings.channel_list_debounce_ms,
    );
    parse_number(read("RPC_RETRY_ATTEMPTS"), &mut settings.rpc_retry_attempts);
    parse_number(read("RPC_RETRY_DELAY_MS"), &mut settings.rpc_retry_delay_ms);
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>, slot: &mut T) {
    if let Some(raw) = raw {
        match raw.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!("config: ignoring non-numeric override {raw}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
