//! Gateway lifecycle: port selection, server start/stop, and the control
//! surface (circuit status/reset, per-CLI proxy switches, active sessions).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::{self, ConfigFile, GatewaySettings};
use crate::events::EventBus;
use crate::registry::ProviderRegistry;
use crate::session::{ActiveSessionSnapshot, SessionAffinity};

use super::routes::build_router;
use super::util::now_unix_seconds;

#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayProviderCircuitStatus {
    pub provider_id: i64,
    pub state: String,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_until: Option<i64>,
    pub cooldown_until: Option<i64>,
}

/// Applies the per-CLI proxy switch to the CLI's own configuration (for
/// example rewriting a settings file to point the CLI at the gateway).
/// The gateway core only flips the registry switch; how a CLI learns about
/// it is up to the host application.
pub trait CliConfigWriter: Send + Sync {
    fn apply_cli_proxy(
        &self,
        cli_key: &str,
        enabled: bool,
        base_url: Option<&str>,
    ) -> Result<(), String>;
}

/// Default writer that changes nothing outside the process.
#[derive(Debug, Default)]
pub struct NoopCliConfigWriter;

impl CliConfigWriter for NoopCliConfigWriter {
    fn apply_cli_proxy(
        &self,
        _cli_key: &str,
        _enabled: bool,
        _base_url: Option<&str>,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Shared per-request state handed to the router.
#[derive(Clone)]
pub(super) struct GatewayState {
    pub(super) client: reqwest::Client,
    pub(super) settings: Arc<GatewaySettings>,
    pub(super) registry: Arc<ProviderRegistry>,
    pub(super) circuit: Arc<CircuitBreaker>,
    pub(super) session: Arc<SessionAffinity>,
    pub(super) events: EventBus,
}

struct RunningGateway {
    port: u16,
    base_url: String,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

pub struct GatewayManager {
    settings: Arc<GatewaySettings>,
    registry: Arc<ProviderRegistry>,
    circuit: Arc<CircuitBreaker>,
    session: Arc<SessionAffinity>,
    events: EventBus,
    cli_writer: Arc<dyn CliConfigWriter>,
    running: Option<RunningGateway>,
}

fn port_candidates(preferred: Option<u16>) -> impl Iterator<Item = u16> {
    let mut candidates = Vec::with_capacity(
        (config::MAX_GATEWAY_PORT - config::DEFAULT_GATEWAY_PORT + 2) as usize,
    );

    if let Some(p) = preferred {
        if p > 0 {
            candidates.push(p);
        }
    }

    for port in config::DEFAULT_GATEWAY_PORT..=config::MAX_GATEWAY_PORT {
        if candidates.first().copied() == Some(port) {
            continue;
        }
        candidates.push(port);
    }

    candidates.into_iter()
}

fn bind_first_available(preferred: Option<u16>) -> Result<(u16, std::net::TcpListener), String> {
    for port in port_candidates(preferred) {
        let std_listener = match std::net::TcpListener::bind(("127.0.0.1", port)) {
            Ok(l) => l,
            Err(_) => continue,
        };

        if std_listener.set_nonblocking(true).is_err() {
            continue;
        }

        return Ok((port, std_listener));
    }

    Err(format!(
        "no available port in range {}..{}",
        config::DEFAULT_GATEWAY_PORT,
        config::MAX_GATEWAY_PORT
    ))
}

impl GatewayManager {
    pub fn new(config: &ConfigFile) -> Self {
        let mut settings = config.settings.clone();
        settings.sanitize();

        Self {
            circuit: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                &settings,
            ))),
            settings: Arc::new(settings),
            registry: Arc::new(ProviderRegistry::from_config(config)),
            session: Arc::new(SessionAffinity::new()),
            events: EventBus::new(),
            cli_writer: Arc::new(NoopCliConfigWriter),
            running: None,
        }
    }

    pub fn with_cli_config_writer(mut self, writer: Arc<dyn CliConfigWriter>) -> Self {
        self.cli_writer = writer;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn status(&self) -> GatewayStatus {
        match &self.running {
            Some(r) => GatewayStatus {
                running: true,
                port: Some(r.port),
                base_url: Some(r.base_url.clone()),
            },
            None => GatewayStatus {
                running: false,
                port: None,
                base_url: None,
            },
        }
    }

    pub fn active_sessions(&self, now_unix: i64, limit: usize) -> Vec<ActiveSessionSnapshot> {
        self.session.list_active(now_unix, limit)
    }

    /// Binds the preferred port (falling back through the fixed range) and
    /// starts serving. Idempotent: calling while running returns the current
    /// status.
    pub fn start(&mut self) -> Result<GatewayStatus, String> {
        if self.running.is_some() {
            return Ok(self.status());
        }

        let preferred = self.settings.preferred_port;
        let requested_port = if preferred > 0 {
            preferred
        } else {
            config::DEFAULT_GATEWAY_PORT
        };

        let (port, std_listener) = bind_first_available(Some(requested_port))?;

        let base_url = format!("http://127.0.0.1:{port}");
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        if port != requested_port {
            self.events.emit_port_log(
                "warn",
                "GW_PORT_IN_USE",
                format!("port {requested_port} is in use, bound {port} instead"),
                requested_port,
                port,
                base_url.clone(),
            );
            tracing::warn!(requested_port, bound_port = port, "preferred port in use");
        }

        let client = reqwest::Client::builder()
            .user_agent(format!("cligate/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("GW_HTTP_CLIENT_INIT: {e}"))?;

        let state = GatewayState {
            client,
            settings: Arc::clone(&self.settings),
            registry: Arc::clone(&self.registry),
            circuit: Arc::clone(&self.circuit),
            session: Arc::clone(&self.session),
            events: self.events.clone(),
        };

        let app = build_router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::from_std(std_listener) {
                Ok(l) => l,
                Err(err) => {
                    tracing::error!(%bind_addr, %err, "gateway listener error");
                    return;
                }
            };

            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

            if let Err(err) = serve.await {
                tracing::error!(%bind_addr, %err, "gateway server error");
            }
        });

        tracing::info!(port, "gateway listening on {base_url}");

        self.running = Some(RunningGateway {
            port,
            base_url,
            shutdown: shutdown_tx,
            task,
        });

        Ok(self.status())
    }

    /// Signals graceful shutdown and waits for in-flight requests to drain.
    /// Returns whether a running server was stopped.
    pub async fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };

        let _ = running.shutdown.send(());
        if let Err(err) = running.task.await {
            tracing::error!(%err, "gateway task join error");
        }
        true
    }

    pub fn circuit_status(
        &self,
        cli_key: &str,
    ) -> Result<Vec<GatewayProviderCircuitStatus>, String> {
        crate::cli_key::validate_cli_key(cli_key)?;

        let provider_ids = self.registry.provider_ids_for_cli(cli_key);
        let now_unix = now_unix_seconds() as i64;

        Ok(provider_ids
            .into_iter()
            .map(|provider_id| {
                // should_allow (not snapshot) so a stale OPEN expires here too.
                let check = self.circuit.should_allow(cli_key, provider_id, now_unix);
                let snap = check.after;
                GatewayProviderCircuitStatus {
                    provider_id,
                    state: snap.state.as_str().to_string(),
                    failure_count: snap.failure_count,
                    failure_threshold: snap.failure_threshold,
                    open_until: snap.open_until,
                    cooldown_until: snap.cooldown_until,
                }
            })
            .collect())
    }

    pub fn circuit_reset_provider(&self, cli_key: &str, provider_id: i64) -> Result<(), String> {
        crate::cli_key::validate_cli_key(cli_key)?;
        if provider_id <= 0 {
            return Err("SEC_INVALID_INPUT: provider_id must be > 0".to_string());
        }

        let now_unix = now_unix_seconds() as i64;
        self.circuit.reset(cli_key, provider_id, now_unix);
        Ok(())
    }

    pub fn circuit_reset_cli(&self, cli_key: &str) -> Result<usize, String> {
        crate::cli_key::validate_cli_key(cli_key)?;

        let provider_ids = self.registry.provider_ids_for_cli(cli_key);
        let now_unix = now_unix_seconds() as i64;
        for provider_id in &provider_ids {
            self.circuit.reset(cli_key, *provider_id, now_unix);
        }
        Ok(provider_ids.len())
    }

    /// Flips the per-CLI proxy switch and lets the configured writer apply it
    /// to the CLI's own config.
    pub fn set_cli_proxy_enabled(&self, cli_key: &str, enabled: bool) -> Result<(), String> {
        crate::cli_key::validate_cli_key(cli_key)?;

        self.registry.set_cli_proxy_enabled(cli_key, enabled);
        let base_url = self.running.as_ref().map(|r| r.base_url.as_str());
        self.cli_writer.apply_cli_proxy(cli_key, enabled, base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Provider;

    fn config_with_provider() -> ConfigFile {
        ConfigFile {
            providers: vec![Provider {
                id: 1,
                cli_key: "claude".to_string(),
                name: "primary".to_string(),
                base_urls: vec!["https://api.example.com".to_string()],
                api_key: "sk-test".to_string(),
                enabled: true,
                cost_multiplier: 1.0,
            }],
            ..ConfigFile::default()
        }
    }

    #[test]
    fn port_candidates_put_preferred_first_without_duplicates() {
        let candidates: Vec<u16> = port_candidates(Some(37150)).collect();
        assert_eq!(candidates[0], 37150);
        assert_eq!(
            candidates
                .iter()
                .filter(|p| **p == 37150)
                .count(),
            1
        );
        assert!(candidates.contains(&config::DEFAULT_GATEWAY_PORT));
    }

    #[test]
    fn port_candidates_without_preference_start_at_default() {
        let candidates: Vec<u16> = port_candidates(None).collect();
        assert_eq!(candidates[0], config::DEFAULT_GATEWAY_PORT);
        assert_eq!(*candidates.last().unwrap(), config::MAX_GATEWAY_PORT);
    }

    #[test]
    fn status_reports_not_running_before_start() {
        let manager = GatewayManager::new(&config_with_provider());
        let status = manager.status();
        assert!(!status.running);
        assert!(status.port.is_none());
    }

    #[tokio::test]
    async fn start_reports_port_and_base_url() {
        let mut manager = GatewayManager::new(&config_with_provider());
        let status = manager.start().expect("start");

        assert!(status.running);
        let port = status.port.expect("port");
        let base_url = status.base_url.expect("base url");
        assert_eq!(base_url, format!("http://127.0.0.1:{port}"));

        assert!(manager.stop().await);
        assert!(!manager.stop().await);
        assert!(manager.status().base_url.is_none());
    }

    #[test]
    fn circuit_status_defaults_to_closed() {
        let manager = GatewayManager::new(&config_with_provider());
        let rows = manager.circuit_status("claude").expect("status");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "CLOSED");
        assert_eq!(rows[0].failure_count, 0);
    }

    #[test]
    fn circuit_status_rejects_unknown_cli() {
        let manager = GatewayManager::new(&config_with_provider());
        assert!(manager.circuit_status("aider").is_err());
    }

    #[test]
    fn set_cli_proxy_enabled_updates_registry() {
        let manager = GatewayManager::new(&config_with_provider());
        assert!(manager.registry().cli_proxy_enabled("claude"));

        manager
            .set_cli_proxy_enabled("claude", false)
            .expect("toggle");
        assert!(!manager.registry().cli_proxy_enabled("claude"));
    }
}
