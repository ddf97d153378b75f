//! Proxy handler and failover loop.

mod abort_guard;
mod errors;
mod failover;
mod failover_loop;
mod handler;
pub(super) mod http_util;
mod non_retryable;

pub(super) use handler::proxy_impl;

/// What kind of failure an attempt (or the whole request) terminated with.
/// Drives both the failover decision and circuit accounting: only
/// `ProviderError` counts against a provider's failure streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorCategory {
    ProviderError,
    SystemError,
    ClientAbort,
    NonRetryableClientError,
    ResourceNotFound,
}

impl ErrorCategory {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ProviderError => "PROVIDER_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
            Self::ClientAbort => "CLIENT_ABORT",
            Self::NonRetryableClientError => "NON_RETRYABLE_CLIENT_ERROR",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
        }
    }
}
