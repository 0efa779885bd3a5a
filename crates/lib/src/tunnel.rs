//! Tunnels: long-lived connections to managed targets, shared across the
//! chunks of one run.
//!
//! Resource plugins that talk to remote systems (SSH hosts, provider APIs
//! with session handshakes) register a tunnel under a stable key the first
//! time they connect; later chunks targeting the same system reuse it. The
//! pool is shut down exactly once at the end of the run, including early
//! exits on cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TunnelError {
  #[error("tunnel is not connected")]
  NotConnected,

  #[error("{0}")]
  Transport(String),
}

/// A live connection to one managed target.
#[async_trait]
pub trait Tunnel: Send + Sync {
  /// Open the connection. Called once by the owning plugin before the tunnel
  /// is registered.
  async fn create(&self, options: &Value) -> Result<(), TunnelError>;

  /// Run a command on the target and return its output.
  async fn cmd(&self, command: &str) -> Result<Value, TunnelError>;

  /// Push a payload to a path on the target.
  async fn send(&self, payload: &[u8], dest: &str) -> Result<(), TunnelError>;

  /// Fetch a path from the target.
  async fn get(&self, src: &str) -> Result<Vec<u8>, TunnelError>;

  /// Tear the connection down. Idempotent.
  async fn destroy(&self) -> Result<(), TunnelError>;

  /// Whether the connection is currently usable.
  async fn connected(&self) -> bool;
}

/// Run-scoped registry of live tunnels, keyed by target identity.
#[derive(Default)]
pub struct ConnectionPool {
  tunnels: Mutex<HashMap<String, Arc<dyn Tunnel>>>,
}

impl ConnectionPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a connected tunnel. Replacing an existing key drops the old
  /// tunnel from the pool without destroying it; the caller owns that.
  pub fn register(&self, key: impl Into<String>, tunnel: Arc<dyn Tunnel>) {
    let key = key.into();
    debug!(key, "tunnel registered");
    if let Ok(mut tunnels) = self.tunnels.lock() {
      tunnels.insert(key, tunnel);
    }
  }

  pub fn get(&self, key: &str) -> Option<Arc<dyn Tunnel>> {
    self.tunnels.lock().ok()?.get(key).cloned()
  }

  /// Destroy every tunnel. Errors are logged, not propagated: shutdown runs
  /// on paths (cancellation, post-failure exit) that must not themselves
  /// fail.
  pub async fn shutdown(&self) {
    let drained: Vec<(String, Arc<dyn Tunnel>)> = match self.tunnels.lock() {
      Ok(mut tunnels) => tunnels.drain().collect(),
      Err(_) => return,
    };

    for (key, tunnel) in drained {
      if let Err(e) = tunnel.destroy().await {
        warn!(key, error = %e, "tunnel teardown failed");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct FakeTunnel {
    destroyed: Arc<AtomicBool>,
  }

  #[async_trait]
  impl Tunnel for FakeTunnel {
    async fn create(&self, _options: &Value) -> Result<(), TunnelError> {
      Ok(())
    }

    async fn cmd(&self, _command: &str) -> Result<Value, TunnelError> {
      Ok(Value::Null)
    }

    async fn send(&self, _payload: &[u8], _dest: &str) -> Result<(), TunnelError> {
      Ok(())
    }

    async fn get(&self, _src: &str) -> Result<Vec<u8>, TunnelError> {
      Ok(Vec::new())
    }

    async fn destroy(&self) -> Result<(), TunnelError> {
      self.destroyed.store(true, Ordering::SeqCst);
      Ok(())
    }

    async fn connected(&self) -> bool {
      !self.destroyed.load(Ordering::SeqCst)
    }
  }

  #[tokio::test]
  async fn registered_tunnels_are_shared() {
    let pool = ConnectionPool::new();
    let destroyed = Arc::new(AtomicBool::new(false));
    pool.register("host-a", Arc::new(FakeTunnel { destroyed }));

    assert!(pool.get("host-a").is_some());
    assert!(pool.get("host-b").is_none());
  }

  #[tokio::test]
  async fn shutdown_destroys_everything() {
    let pool = ConnectionPool::new();
    let destroyed = Arc::new(AtomicBool::new(false));
    pool.register(
      "host-a",
      Arc::new(FakeTunnel {
        destroyed: destroyed.clone(),
      }),
    );

    pool.shutdown().await;
    assert!(destroyed.load(Ordering::SeqCst));
    assert!(pool.get("host-a").is_none());
  }
}
