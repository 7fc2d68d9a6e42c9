use std::{collections::HashMap, fs, time::Duration};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub history_page_size: usize,
    pub presence_poll_interval: Duration,
    pub typing_idle_timeout: Duration,
    pub read_settle_delay: Duration,
    pub presence_state_retry_attempts: usize,
    pub presence_state_retry_base_delay: Duration,
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_page_size: 20,
            presence_poll_interval: Duration::from_secs(10),
            typing_idle_timeout: Duration::from_secs(2),
            read_settle_delay: Duration::from_millis(500),
            presence_state_retry_attempts: 5,
            presence_state_retry_base_delay: Duration::from_millis(500),
            event_buffer: 1024,
        }
    }
}

pub fn load_config() -> SyncConfig {
    let mut config = SyncConfig::default();

    if let Ok(raw) = fs::read_to_string("sync.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            apply_file_values(&mut config, &file_cfg);
        }
    }

    if let Ok(v) = std::env::var("SYNC_HISTORY_PAGE_SIZE") {
        if let Ok(n) = v.parse::<usize>() {
            config.history_page_size = n.max(1);
        }
    }
    if let Ok(v) = std::env::var("SYNC_PRESENCE_POLL_SECS") {
        if let Ok(n) = v.parse::<u64>() {
            config.presence_poll_interval = Duration::from_secs(n.max(1));
        }
    }
    if let Ok(v) = std::env::var("SYNC_TYPING_IDLE_MS") {
        if let Ok(n) = v.parse::<u64>() {
            config.typing_idle_timeout = Duration::from_millis(n.max(1));
        }
    }
    if let Ok(v) = std::env::var("SYNC_READ_SETTLE_MS") {
        if let Ok(n) = v.parse::<u64>() {
            config.read_settle_delay = Duration::from_millis(n);
        }
    }

    config
}

fn apply_file_values(config: &mut SyncConfig, values: &HashMap<String, toml::Value>) {
    if let Some(n) = values.get("history_page_size").and_then(toml::Value::as_integer) {
        if n > 0 {
            config.history_page_size = n as usize;
        }
    }
    if let Some(n) = values
        .get("presence_poll_secs")
        .and_then(toml::Value::as_integer)
    {
        if n > 0 {
            config.presence_poll_interval = Duration::from_secs(n as u64);
        }
    }
    if let Some(n) = values.get("typing_idle_ms").and_then(toml::Value::as_integer) {
        if n > 0 {
            config.typing_idle_timeout = Duration::from_millis(n as u64);
        }
    }
    if let Some(n) = values.get("read_settle_ms").and_then(toml::Value::as_integer) {
        if n >= 0 {
            config.read_settle_delay = Duration::from_millis(n as u64);
        }
    }
}
