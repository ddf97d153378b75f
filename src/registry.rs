//! Provider registry and sort-mode selection.
//!
//! Pure in-memory lookups: building the per-request trial order must not do
//! I/O. Providers are soft-disabled rather than removed while requests may
//! still reference them.

use crate::config::ConfigFile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub cli_key: String,
    pub name: String,
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
}

fn default_true() -> bool {
    true
}

fn default_cost_multiplier() -> f64 {
    1.0
}

impl Provider {
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("Provider #{}", self.id)
        } else {
            self.name.clone()
        }
    }

    pub fn primary_base_url(&self) -> String {
        self.base_urls.first().cloned().unwrap_or_default()
    }

    /// Base URL for the Nth retry against this provider: retries rotate
    /// through the configured URLs in order and wrap around.
    pub fn base_url_for_retry(&self, retry_index: u32) -> String {
        if self.base_urls.is_empty() {
            return String::new();
        }
        let idx = retry_index as usize % self.base_urls.len();
        self.base_urls[idx].clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortMode {
    pub id: i64,
    pub name: String,
}

/// Ordered provider ids for one `(sort mode, cli_key)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortModeOrder {
    pub sort_mode_id: i64,
    pub cli_key: String,
    pub provider_ids: Vec<i64>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    providers: Vec<Provider>,
    sort_modes: Vec<SortMode>,
    orders: HashMap<(i64, String), Vec<i64>>,
    active_modes: HashMap<String, i64>,
    cli_proxy_enabled: HashMap<String, bool>,
}

/// Trial-order selection result for one request.
#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub sort_mode_id: Option<i64>,
    pub providers: Vec<Provider>,
}

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    pub fn from_config(config: &ConfigFile) -> Self {
        let mut orders = HashMap::with_capacity(config.sort_mode_orders.len());
        for order in &config.sort_mode_orders {
            orders.insert(
                (order.sort_mode_id, order.cli_key.clone()),
                order.provider_ids.clone(),
            );
        }

        Self {
            inner: RwLock::new(RegistryInner {
                providers: config.providers.clone(),
                sort_modes: config.sort_modes.clone(),
                orders,
                active_modes: config.active_sort_modes.clone(),
                cli_proxy_enabled: config.cli_proxy_enabled.clone(),
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cli_proxy_enabled(&self, cli_key: &str) -> bool {
        self.read()
            .cli_proxy_enabled
            .get(cli_key)
            .copied()
            .unwrap_or(true)
    }

    pub fn set_cli_proxy_enabled(&self, cli_key: &str, enabled: bool) {
        self.write()
            .cli_proxy_enabled
            .insert(cli_key.to_string(), enabled);
    }

    pub fn provider_ids_for_cli(&self, cli_key: &str) -> Vec<i64> {
        self.read()
            .providers
            .iter()
            .filter(|p| p.cli_key == cli_key)
            .map(|p| p.id)
            .collect()
    }

    pub fn get(&self, provider_id: i64) -> Option<Provider> {
        self.read()
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .cloned()
    }

    pub fn set_enabled(&self, provider_id: i64, enabled: bool) -> Result<(), String> {
        let mut guard = self.write();
        match guard.providers.iter_mut().find(|p| p.id == provider_id) {
            Some(p) => {
                p.enabled = enabled;
                Ok(())
            }
            None => Err(format!(
                "SEC_INVALID_INPUT: unknown provider_id={provider_id}"
            )),
        }
    }

    pub fn set_active_sort_mode(&self, cli_key: &str, sort_mode_id: Option<i64>) {
        let mut guard = self.write();
        match sort_mode_id {
            Some(id) => {
                guard.active_modes.insert(cli_key.to_string(), id);
            }
            None => {
                guard.active_modes.remove(cli_key);
            }
        }
    }

    pub fn sort_modes(&self) -> Vec<SortMode> {
        self.read().sort_modes.clone()
    }

    /// Enabled providers for `cli_key` in the order of the given sort mode.
    /// Providers missing from the mode's order list are appended in config
    /// order, so a stale order never hides a provider.
    pub fn enabled_in_mode(&self, cli_key: &str, sort_mode_id: i64) -> Vec<Provider> {
        let guard = self.read();
        let mut remaining: Vec<&Provider> = guard
            .providers
            .iter()
            .filter(|p| p.cli_key == cli_key && p.enabled)
            .collect();

        let mut out: Vec<Provider> = Vec::with_capacity(remaining.len());
        if let Some(order) = guard.orders.get(&(sort_mode_id, cli_key.to_string())) {
            for provider_id in order {
                if let Some(idx) = remaining.iter().position(|p| p.id == *provider_id) {
                    out.push(remaining.remove(idx).clone());
                }
            }
        }
        out.extend(remaining.into_iter().cloned());
        out
    }

    /// Enabled providers for `cli_key` using the CLI's active sort mode, or
    /// config order when no mode is active.
    pub fn enabled_using_active_mode(&self, cli_key: &str) -> ProviderSelection {
        let active = self.read().active_modes.get(cli_key).copied();
        match active {
            Some(sort_mode_id) => ProviderSelection {
                sort_mode_id: Some(sort_mode_id),
                providers: self.enabled_in_mode(cli_key, sort_mode_id),
            },
            None => ProviderSelection {
                sort_mode_id: None,
                providers: self
                    .read()
                    .providers
                    .iter()
                    .filter(|p| p.cli_key == cli_key && p.enabled)
                    .cloned()
                    .collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: i64, cli_key: &str, enabled: bool) -> Provider {
        Provider {
            id,
            cli_key: cli_key.to_string(),
            name: format!("p{id}"),
            base_urls: vec![format!("https://p{id}.example.invalid")],
            api_key: String::new(),
            enabled,
            cost_multiplier: 1.0,
        }
    }

    #[test]
    fn retries_rotate_through_base_urls_and_wrap() {
        let mut p = provider(1, "claude", true);
        p.base_urls = vec![
            "https://a.example.invalid".to_string(),
            "https://b.example.invalid".to_string(),
        ];

        assert_eq!(p.base_url_for_retry(0), "https://a.example.invalid");
        assert_eq!(p.base_url_for_retry(1), "https://b.example.invalid");
        assert_eq!(p.base_url_for_retry(2), "https://a.example.invalid");

        let empty = Provider {
            base_urls: Vec::new(),
            ..provider(2, "claude", true)
        };
        assert_eq!(empty.base_url_for_retry(3), "");
    }

    fn registry() -> ProviderRegistry {
        let config = ConfigFile {
            providers: vec![
                provider(1, "claude", true),
                provider(2, "claude", true),
                provider(3, "claude", false),
                provider(4, "codex", true),
            ],
            sort_modes: vec![SortMode {
                id: 10,
                name: "cheap-first".to_string(),
            }],
            sort_mode_orders: vec![SortModeOrder {
                sort_mode_id: 10,
                cli_key: "claude".to_string(),
                provider_ids: vec![2, 1],
            }],
            ..ConfigFile::default()
        };
        ProviderRegistry::from_config(&config)
    }

    #[test]
    fn active_mode_orders_and_filters_disabled() {
        let reg = registry();
        reg.set_active_sort_mode("claude", Some(10));

        let selection = reg.enabled_using_active_mode("claude");
        assert_eq!(selection.sort_mode_id, Some(10));
        let ids: Vec<i64> = selection.providers.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn no_active_mode_uses_config_order() {
        let reg = registry();
        let selection = reg.enabled_using_active_mode("claude");
        assert_eq!(selection.sort_mode_id, None);
        let ids: Vec<i64> = selection.providers.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn mode_order_appends_missing_providers() {
        let reg = registry();
        // Order list only mentions provider 2; provider 1 must still appear.
        let config_order = reg.enabled_in_mode("claude", 999);
        assert_eq!(config_order.len(), 2);

        reg.set_active_sort_mode("claude", Some(10));
        reg.set_enabled(3, true).expect("enable");
        let ids: Vec<i64> = reg
            .enabled_using_active_mode("claude")
            .providers
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn cli_proxy_defaults_enabled() {
        let reg = registry();
        assert!(reg.cli_proxy_enabled("claude"));
        reg.set_cli_proxy_enabled("claude", false);
        assert!(!reg.cli_proxy_enabled("claude"));
    }

    #[test]
    fn set_enabled_rejects_unknown_provider() {
        let reg = registry();
        assert!(reg.set_enabled(999, true).is_err());
    }
}
