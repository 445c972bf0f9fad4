//! Process-wide client registry
//!
//! Maps subdomain ids to live tunnels. The map entry is claimed before the
//! tunnel starts so concurrent creates cannot race for one id, and a
//! watcher task drops the entry when the tunnel emits its end signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use burrow_core::{ClientId, Result};

use crate::tunnel::{ClientTunnel, TunnelInfo, TunnelOptions};

/// Registry counters exposed by the management API.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    /// Tunnels currently started and not yet ended
    pub tunnels: usize,
}

/// Maps subdomain ids to tunnels and owns their lifecycle.
pub struct ClientRegistry {
    tunnels: DashMap<ClientId, Arc<ClientTunnel>>,
    opts: TunnelOptions,
    active: AtomicUsize,
}

impl ClientRegistry {
    pub fn new(opts: TunnelOptions) -> Arc<Self> {
        Arc::new(Self {
            tunnels: DashMap::new(),
            opts,
            active: AtomicUsize::new(0),
        })
    }

    /// Create and start a tunnel.
    ///
    /// A requested id that is already taken is silently substituted with a
    /// fresh random one; the caller learns the actual id from the returned
    /// info. If the tunnel fails to start, the entry is removed and the
    /// error surfaced.
    pub async fn create(self: &Arc<Self>, requested: Option<ClientId>) -> Result<TunnelInfo> {
        let mut requested = requested;
        let tunnel = loop {
            let id = match requested.take() {
                Some(id) if !self.tunnels.contains_key(&id) => id,
                _ => self.vacant_id(),
            };
            match self.tunnels.entry(id.clone()) {
                // Lost a race for the id; roll a new one.
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let tunnel = ClientTunnel::new(id, self.opts.clone());
                    slot.insert(Arc::clone(&tunnel));
                    break tunnel;
                }
            }
        };

        match tunnel.start().await {
            Ok(info) => {
                self.active.fetch_add(1, Ordering::AcqRel);
                self.watch_end(Arc::clone(&tunnel));
                info!(id = %info.id, port = info.port, "client tunnel created");
                Ok(info)
            }
            Err(e) => {
                self.tunnels.remove(tunnel.id());
                Err(e)
            }
        }
    }

    /// Drop the registry entry once the tunnel ends.
    fn watch_end(self: &Arc<Self>, tunnel: Arc<ClientTunnel>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tunnel.closed().await;
            registry.tunnels.remove(tunnel.id());
            registry.active.fetch_sub(1, Ordering::AcqRel);
            debug!(id = %tunnel.id(), "client tunnel removed from registry");
        });
    }

    /// Look up a tunnel by subdomain id. Strings that do not even parse as
    /// ids cannot be registered, so they resolve to `None`.
    pub fn lookup(&self, id: &str) -> Option<Arc<ClientTunnel>> {
        let id = ClientId::new(id).ok()?;
        self.tunnels.get(&id).map(|entry| Arc::clone(&entry))
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.active.load(Ordering::Acquire),
        }
    }

    fn vacant_id(&self) -> ClientId {
        loop {
            let id = ClientId::generate();
            if !self.tunnels.contains_key(&id) {
                return id;
            }
        }
    }
}
