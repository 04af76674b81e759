//! Admission trait for putting any limiter in front of a request pipeline.

use std::time::Duration;

use async_trait::async_trait;

use super::interval::IntervalLimiter;
use super::keyed::KeyedLimiter;
use super::window::WindowCounter;
use crate::error::{Result, TurnstileError};

/// What the calling layer knows about one unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Identity whose quota applies; `None` for global limiters
    pub key: Option<String>,
    /// How long the caller is willing to wait for a paced grant
    pub timeout: Option<Duration>,
}

impl AdmissionRequest {
    /// A request subject only to global limits.
    pub fn global() -> Self {
        Self::default()
    }

    /// A request attributed to `key`.
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            timeout: None,
        }
    }

    /// Give up on paced waits after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// Remaining quota, for limiters that count
    pub remaining: Option<u64>,
}

/// Trait for limiter implementations.
///
/// Lets the request-handling layer treat interval, window and keyed limiters
/// the same way: `Ok` lets the request through, any rejection error turns it away.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Decide whether `request` may proceed.
    async fn admit(&self, request: &AdmissionRequest) -> Result<Admitted>;
}

#[async_trait]
impl AdmissionGate for IntervalLimiter {
    async fn admit(&self, request: &AdmissionRequest) -> Result<Admitted> {
        match request.timeout {
            Some(timeout) => self.wait_timeout(timeout).await?,
            None => self.wait(std::future::pending()).await?,
        }
        Ok(Admitted { remaining: None })
    }
}

#[async_trait]
impl AdmissionGate for WindowCounter {
    async fn admit(&self, _request: &AdmissionRequest) -> Result<Admitted> {
        let decision = self.allow();
        if decision.allowed {
            Ok(Admitted {
                remaining: Some(decision.remaining),
            })
        } else {
            Err(TurnstileError::RateLimitExceeded { key: None })
        }
    }
}

#[async_trait]
impl AdmissionGate for KeyedLimiter<String> {
    async fn admit(&self, request: &AdmissionRequest) -> Result<Admitted> {
        let key = request.key.as_deref().ok_or(TurnstileError::MissingKey)?;
        let decision = self.allow(key);
        if decision.allowed {
            Ok(Admitted {
                remaining: Some(decision.remaining),
            })
        } else {
            Err(TurnstileError::RateLimitExceeded {
                key: Some(key.to_string()),
            })
        }
    }
}

/// Reduce a remote address to the identity used as an admission key.
///
/// `host:port` and `[host]:port` yield the bare host, including a zone
/// suffix such as `fe80::1%eth0`. The port may be empty. Anything that cannot
/// be split that way, or that leaves an empty host, is used verbatim.
pub fn client_key(remote_addr: &str) -> String {
    match split_host(remote_addr) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => remote_addr.to_string(),
    }
}

fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        tail.strip_prefix(':')?;
        return Some(host);
    }

    let (host, _port) = addr.rsplit_once(':')?;
    (!host.contains(|c: char| matches!(c, ':' | '[' | ']'))).then_some(host)
}
