//! The HTTP gateway: loopback server, proxy handler, failover loop, and the
//! stream tees that account for responses after the handler has returned.

pub mod manager;
mod proxy;
mod routes;
mod streams;
mod util;

pub use manager::{
    CliConfigWriter, GatewayManager, GatewayProviderCircuitStatus, GatewayStatus,
    NoopCliConfigWriter,
};
