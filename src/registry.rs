//! Process-global counters and latches shared by every Zork session.
//!
//! Mirrors the teacher's `RelayState`: a small `Clone`-able handle over
//! `Arc`-wrapped shared state, constructed once in `main` and cloned into
//! every spawned connection task instead of reached for as a singleton.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::error;

/// Daemon-wide configuration resolved from the CLI.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub zork_port: u16,
    pub socks_port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            zork_port: 9000,
            socks_port: 9999,
        }
    }
}

struct Inner {
    num_zork_connections: AtomicU64,
    num_getters: AtomicU64,
    socks_server: Mutex<Option<u16>>,
    config: BrokerConfig,
}

/// Shared handle to the daemon's global counters and latches.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                num_zork_connections: AtomicU64::new(0),
                num_getters: AtomicU64::new(0),
                socks_server: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> BrokerConfig {
        self.inner.config
    }

    /// Allocates the next `client_id`, formatted as `zc<N>`.
    pub fn next_client_id(&self) -> String {
        let n = self.inner.num_zork_connections.fetch_add(1, Ordering::SeqCst);
        format!("zc{n}")
    }

    pub fn num_getters(&self) -> u64 {
        self.inner.num_getters.load(Ordering::SeqCst)
    }

    pub fn increment_getters(&self) {
        self.inner.num_getters.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements `num_getters`, clamping at zero. Logs an error if the
    /// clamp triggers (the counter would otherwise have gone negative).
    pub fn decrement_getters(&self) {
        let prev = self
            .inner
            .num_getters
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
        if let Ok(0) = prev {
            // fetch_update returns the *previous* value; 0 means we were
            // already at the floor before this decrement attempt.
            error!("num_getters decrement clamped at zero");
        }
    }

    /// Returns the port the getter's local SOCKS server should bind:
    /// the configured port on first call, an OS-assigned ephemeral port
    /// (0) on every subsequent call. Latches `started_socks_server`.
    pub async fn socks_bind_port(&self) -> u16 {
        let mut slot = self.inner.socks_server.lock().await;
        if slot.is_none() {
            *slot = Some(self.inner.config.socks_port);
            self.inner.config.socks_port
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_monotone_and_tagged() {
        let registry = Registry::new(BrokerConfig::default());
        assert_eq!(registry.next_client_id(), "zc0");
        assert_eq!(registry.next_client_id(), "zc1");
        assert_eq!(registry.next_client_id(), "zc2");
    }

    #[test]
    fn num_getters_clamps_at_zero() {
        let registry = Registry::new(BrokerConfig::default());
        registry.decrement_getters();
        assert_eq!(registry.num_getters(), 0);
        registry.increment_getters();
        registry.increment_getters();
        assert_eq!(registry.num_getters(), 2);
        registry.decrement_getters();
        registry.decrement_getters();
        registry.decrement_getters();
        assert_eq!(registry.num_getters(), 0);
    }

    #[tokio::test]
    async fn first_getter_binds_configured_port_rest_are_ephemeral() {
        let registry = Registry::new(BrokerConfig {
            zork_port: 9000,
            socks_port: 9999,
        });
        assert_eq!(registry.socks_bind_port().await, 9999);
        assert_eq!(registry.socks_bind_port().await, 0);
        assert_eq!(registry.socks_bind_port().await, 0);
    }
}
