//! Gateway settings (schema + JSON file loading + edge clamping).
//!
//! Settings come from a user-editable file, so every numeric knob is clamped
//! here rather than trusted downstream.

use crate::registry::{Provider, SortMode, SortModeOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_GATEWAY_PORT: u16 = 37123;
pub const MAX_GATEWAY_PORT: u16 = 37199;
pub const DEFAULT_PROVIDER_COOLDOWN_SECONDS: u32 = 30;
pub const DEFAULT_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS: u32 = 0;
pub const DEFAULT_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS: u32 = 0;
pub const DEFAULT_UPSTREAM_REQUEST_TIMEOUT_NON_STREAMING_SECONDS: u32 = 0;
pub const DEFAULT_FAILOVER_MAX_ATTEMPTS_PER_PROVIDER: u32 = 5;
pub const DEFAULT_FAILOVER_MAX_PROVIDERS_TO_TRY: u32 = 5;
pub const DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_CIRCUIT_BREAKER_OPEN_DURATION_MINUTES: u32 = 30;
pub const DEFAULT_PROVIDER_BASE_URL_PING_CACHE_TTL_SECONDS: u32 = 60;

const MAX_PROVIDER_COOLDOWN_SECONDS: u32 = 60 * 60;
const MAX_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS: u32 = 60 * 60;
const MAX_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS: u32 = 60 * 60;
const MAX_UPSTREAM_REQUEST_TIMEOUT_NON_STREAMING_SECONDS: u32 = 24 * 60 * 60;
const MAX_FAILOVER_MAX_ATTEMPTS_PER_PROVIDER: u32 = 20;
const MAX_FAILOVER_MAX_PROVIDERS_TO_TRY: u32 = 20;
const MAX_FAILOVER_TOTAL_ATTEMPTS: u32 = 100;
const MAX_CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 50;
const MAX_CIRCUIT_BREAKER_OPEN_DURATION_MINUTES: u32 = 24 * 60;
const MAX_PROVIDER_BASE_URL_PING_CACHE_TTL_SECONDS: u32 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub preferred_port: u16,
    pub provider_cooldown_seconds: u32,
    pub upstream_first_byte_timeout_seconds: u32,
    pub upstream_stream_idle_timeout_seconds: u32,
    pub upstream_request_timeout_non_streaming_seconds: u32,
    pub failover_max_attempts_per_provider: u32,
    pub failover_max_providers_to_try: u32,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_open_duration_minutes: u32,
    pub provider_base_url_ping_cache_ttl_seconds: u32,
    pub intercept_anthropic_warmup_requests: bool,
    pub enable_thinking_signature_rectifier: bool,
    pub enable_response_fixer: bool,
    pub response_fixer_fix_encoding: bool,
    pub response_fixer_fix_sse_format: bool,
    pub response_fixer_fix_truncated_json: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            preferred_port: DEFAULT_GATEWAY_PORT,
            provider_cooldown_seconds: DEFAULT_PROVIDER_COOLDOWN_SECONDS,
            upstream_first_byte_timeout_seconds: DEFAULT_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS,
            upstream_stream_idle_timeout_seconds: DEFAULT_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS,
            upstream_request_timeout_non_streaming_seconds:
                DEFAULT_UPSTREAM_REQUEST_TIMEOUT_NON_STREAMING_SECONDS,
            failover_max_attempts_per_provider: DEFAULT_FAILOVER_MAX_ATTEMPTS_PER_PROVIDER,
            failover_max_providers_to_try: DEFAULT_FAILOVER_MAX_PROVIDERS_TO_TRY,
            circuit_breaker_failure_threshold: DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            circuit_breaker_open_duration_minutes: DEFAULT_CIRCUIT_BREAKER_OPEN_DURATION_MINUTES,
            provider_base_url_ping_cache_ttl_seconds:
                DEFAULT_PROVIDER_BASE_URL_PING_CACHE_TTL_SECONDS,
            intercept_anthropic_warmup_requests: false,
            enable_thinking_signature_rectifier: false,
            enable_response_fixer: false,
            response_fixer_fix_encoding: true,
            response_fixer_fix_sse_format: true,
            response_fixer_fix_truncated_json: true,
        }
    }
}

fn sanitize_failover(settings: &mut GatewaySettings) -> bool {
    let mut changed = false;

    if settings.failover_max_attempts_per_provider == 0 {
        settings.failover_max_attempts_per_provider = DEFAULT_FAILOVER_MAX_ATTEMPTS_PER_PROVIDER;
        changed = true;
    }
    if settings.failover_max_providers_to_try == 0 {
        settings.failover_max_providers_to_try = DEFAULT_FAILOVER_MAX_PROVIDERS_TO_TRY;
        changed = true;
    }
    if settings.failover_max_attempts_per_provider > MAX_FAILOVER_MAX_ATTEMPTS_PER_PROVIDER {
        settings.failover_max_attempts_per_provider = MAX_FAILOVER_MAX_ATTEMPTS_PER_PROVIDER;
        changed = true;
    }
    if settings.failover_max_providers_to_try > MAX_FAILOVER_MAX_PROVIDERS_TO_TRY {
        settings.failover_max_providers_to_try = MAX_FAILOVER_MAX_PROVIDERS_TO_TRY;
        changed = true;
    }

    // Keep the worst-case total attempt count bounded.
    let providers = settings.failover_max_providers_to_try.max(1);
    let max_attempts_for_providers = (MAX_FAILOVER_TOTAL_ATTEMPTS / providers).max(1);
    if settings.failover_max_attempts_per_provider > max_attempts_for_providers {
        settings.failover_max_attempts_per_provider = max_attempts_for_providers;
        changed = true;
    }

    changed
}

fn sanitize_circuit_breaker(settings: &mut GatewaySettings) -> bool {
    let mut changed = false;

    if settings.circuit_breaker_failure_threshold == 0 {
        settings.circuit_breaker_failure_threshold = DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD;
        changed = true;
    }
    if settings.circuit_breaker_open_duration_minutes == 0 {
        settings.circuit_breaker_open_duration_minutes =
            DEFAULT_CIRCUIT_BREAKER_OPEN_DURATION_MINUTES;
        changed = true;
    }
    if settings.circuit_breaker_failure_threshold > MAX_CIRCUIT_BREAKER_FAILURE_THRESHOLD {
        settings.circuit_breaker_failure_threshold = MAX_CIRCUIT_BREAKER_FAILURE_THRESHOLD;
        changed = true;
    }
    if settings.circuit_breaker_open_duration_minutes > MAX_CIRCUIT_BREAKER_OPEN_DURATION_MINUTES {
        settings.circuit_breaker_open_duration_minutes = MAX_CIRCUIT_BREAKER_OPEN_DURATION_MINUTES;
        changed = true;
    }

    changed
}

fn sanitize_timeouts(settings: &mut GatewaySettings) -> bool {
    let mut changed = false;

    if settings.provider_cooldown_seconds > MAX_PROVIDER_COOLDOWN_SECONDS {
        settings.provider_cooldown_seconds = MAX_PROVIDER_COOLDOWN_SECONDS;
        changed = true;
    }
    if settings.upstream_first_byte_timeout_seconds > MAX_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS {
        settings.upstream_first_byte_timeout_seconds = MAX_UPSTREAM_FIRST_BYTE_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.upstream_stream_idle_timeout_seconds > MAX_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS {
        settings.upstream_stream_idle_timeout_seconds = MAX_UPSTREAM_STREAM_IDLE_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.upstream_request_timeout_non_streaming_seconds
        > MAX_UPSTREAM_REQUEST_TIMEOUT_NON_STREAMING_SECONDS
    {
        settings.upstream_request_timeout_non_streaming_seconds =
            MAX_UPSTREAM_REQUEST_TIMEOUT_NON_STREAMING_SECONDS;
        changed = true;
    }
    if settings.provider_base_url_ping_cache_ttl_seconds == 0 {
        settings.provider_base_url_ping_cache_ttl_seconds =
            DEFAULT_PROVIDER_BASE_URL_PING_CACHE_TTL_SECONDS;
        changed = true;
    }
    if settings.provider_base_url_ping_cache_ttl_seconds
        > MAX_PROVIDER_BASE_URL_PING_CACHE_TTL_SECONDS
    {
        settings.provider_base_url_ping_cache_ttl_seconds =
            MAX_PROVIDER_BASE_URL_PING_CACHE_TTL_SECONDS;
        changed = true;
    }

    changed
}

impl GatewaySettings {
    /// Clamps every knob into its allowed range. Returns whether anything changed.
    pub fn sanitize(&mut self) -> bool {
        let a = sanitize_failover(self);
        let b = sanitize_circuit_breaker(self);
        let c = sanitize_timeouts(self);
        a || b || c
    }
}

/// On-disk configuration: settings plus the provider/sort-mode registry seed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub settings: GatewaySettings,
    pub providers: Vec<Provider>,
    pub sort_modes: Vec<SortMode>,
    pub sort_mode_orders: Vec<SortModeOrder>,
    /// Active sort mode per cli_key; absent key means the built-in config order.
    pub active_sort_modes: HashMap<String, i64>,
    /// Per-CLI proxy enable switches; absent key means enabled.
    pub cli_proxy_enabled: HashMap<String, bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        let mut config: ConfigFile = serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse config {}: {e}", path.display()))?;
        config.settings.sanitize();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        for provider in &self.providers {
            if provider.id <= 0 {
                return Err(format!(
                    "SEC_INVALID_INPUT: provider id must be > 0 (name={})",
                    provider.name
                ));
            }
            crate::cli_key::validate_cli_key(&provider.cli_key)?;
            if provider.base_urls.iter().all(|u| u.trim().is_empty()) {
                return Err(format!(
                    "SEC_INVALID_INPUT: provider {} has no base_url",
                    provider.id
                ));
            }
        }

        for order in &self.sort_mode_orders {
            crate::cli_key::validate_cli_key(&order.cli_key)?;
            if !self.sort_modes.iter().any(|m| m.id == order.sort_mode_id) {
                return Err(format!(
                    "SEC_INVALID_INPUT: sort_mode_order references unknown mode id={}",
                    order.sort_mode_id
                ));
            }
        }

        Ok(())
    }
}
