//! The live set of tunnels, keyed by id.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::tunnel::{Tunnel, TunnelState};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to start tunnel: {0}")]
    Pool(#[from] crate::pool::PoolError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub tunnels: usize,
}

/// Concurrent map of id → tunnel, with creation/removal serialized per id so
/// two racing `Create` calls for the same id can't both win.
pub struct Registry {
    tunnels: DashMap<String, Arc<Tunnel>>,
    /// Guards the read-then-insert sequence in `create`; `DashMap` alone
    /// only makes the map's individual operations atomic, not the
    /// check-then-act across them.
    creation_lock: Mutex<()>,
    max_sockets: u32,
}

impl Registry {
    pub fn new(max_sockets: u32) -> Arc<Self> {
        Arc::new(Self {
            tunnels: DashMap::new(),
            creation_lock: Mutex::new(()),
            max_sockets,
        })
    }

    /// Create and register a new tunnel under `id`. A caller racing another
    /// `create` for the same id loses outright rather than being merged:
    /// the most recent call wins and the previous tunnel (if any already
    /// finished starting) is closed.
    pub async fn create(self: &Arc<Self>, id: String) -> Result<Arc<Tunnel>, RegistryError> {
        let _guard = self.creation_lock.lock().await;

        let previous = self.tunnels.get(&id).map(|entry| Arc::clone(&entry));
        if let Some(existing) = previous {
            existing.close().await;
        }

        let tunnel = Tunnel::new(id.clone(), self.max_sockets).await?;
        self.tunnels.insert(id.clone(), Arc::clone(&tunnel));
        self.watch_for_close(id, Arc::clone(&tunnel));
        Ok(tunnel)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(id).map(|entry| Arc::clone(&entry))
    }

    pub fn has(&self, id: &str) -> bool {
        self.tunnels.contains_key(id)
    }

    /// Close and remove a tunnel if present. No-op if `id` is unknown.
    pub async fn remove(&self, id: &str) {
        if let Some((_, tunnel)) = self.tunnels.remove(id) {
            tunnel.close().await;
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.tunnels.len(),
        }
    }

    /// Remove a tunnel from the map once it transitions to `Closed` on its
    /// own (grace timer expiry, pool failure) rather than via `remove`.
    fn watch_for_close(self: &Arc<Self>, id: String, tunnel: Arc<Tunnel>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut state = tunnel.subscribe_state();
            loop {
                if *state.borrow() == TunnelState::Closed {
                    break;
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
            // Only remove the entry if it still belongs to this tunnel —
            // `create` may already have replaced it with a newer one.
            if let Some(current) = registry.tunnels.get(&id) {
                if Arc::ptr_eq(&current, &tunnel) {
                    drop(current);
                    registry.tunnels.remove(&id);
                }
            }
        });
    }
}
