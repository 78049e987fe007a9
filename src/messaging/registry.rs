// src/messaging/registry.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::broker::{BrokerClient, Connector};
use super::error::Result;
use super::types::ConnectionId;

type ClientCell = Arc<OnceCell<Arc<dyn BrokerClient>>>;

/// Caches one broker client per connection identifier.
///
/// The registry is held by the composition root and handed to whoever
/// needs a client. Construction of the client for a given identifier runs
/// at most once, even when several callers race on the first lookup.
pub struct ClientRegistry {
    connector: Arc<dyn Connector>,
    clients: Mutex<HashMap<ConnectionId, ClientCell>>,
}

impl ClientRegistry {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::with_connector(Arc::new(connector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Return the client for `id`, connecting on first use.
    ///
    /// A failed connection is not cached; the next lookup tries again.
    pub async fn get_client(&self, id: &ConnectionId) -> Result<Arc<dyn BrokerClient>> {
        let cell = {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(clients.entry(id.clone()).or_default())
        };

        let client = cell
            .get_or_try_init(|| async {
                info!(connection = %id, "Creating broker client");
                self.connector.connect(id).await
            })
            .await?;

        debug!(connection = %id, "Using cached broker client");
        Ok(Arc::clone(client))
    }

    /// Number of identifiers with a live client.
    pub fn len(&self) -> usize {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.get(id).is_some_and(|cell| cell.initialized())
    }
}
