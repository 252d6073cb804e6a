use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;
use worker_protocol::message::FlowListItem;
use worker_protocol::worker_actor::{RpcError, WorkerHandle};

use crate::error::{CatalogError, ChannelError, ClientError};

/// Snapshot of the flows the worker offered on the last listing.
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    snapshot: Option<Arc<Vec<FlowListItem>>>,
}

impl FlowCatalog {
    pub fn replace(&mut self, flows: Vec<FlowListItem>) {
        self.snapshot = Some(Arc::new(flows));
    }

    /// `false` when no listing was taken yet.
    pub fn contains(&self, item: &FlowListItem) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|flows| flows.iter().any(|f| f.id == item.id))
    }

    pub fn flows(&self) -> Option<Arc<Vec<FlowListItem>>> {
        self.snapshot.clone()
    }
}

/// Asks the worker for its flows, keeping the worker's order.
pub async fn fetch(handle: &WorkerHandle, limit: Duration) -> Result<Vec<FlowListItem>, ClientError> {
    match timeout(limit, handle.list_flows()).await {
        Ok(Ok(list)) => {
            debug!(count = list.flows.len(), "flow list received");
            Ok(list.flows)
        }
        Ok(Err(err @ (RpcError::Decode(_) | RpcError::MissingResult))) => {
            Err(CatalogError::Malformed(err.to_string()).into())
        }
        Ok(Err(err)) => Err(ChannelError::from(err).into()),
        Err(_) => Err(CatalogError::Timeout(limit).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_catalog_contains_nothing() {
        let catalog = FlowCatalog::default();
        assert!(!catalog.contains(&FlowListItem::new("a", "A")));
        assert!(catalog.flows().is_none());
    }

    #[test]
    fn replace_swaps_the_snapshot() {
        let mut catalog = FlowCatalog::default();
        catalog.replace(vec![FlowListItem::new("a", "A"), FlowListItem::new("b", "B")]);
        assert!(catalog.contains(&FlowListItem::new("b", "renamed")));

        catalog.replace(vec![FlowListItem::new("c", "C")]);
        assert!(!catalog.contains(&FlowListItem::new("a", "A")));
        assert_eq!(catalog.flows().unwrap().len(), 1);
    }
}
