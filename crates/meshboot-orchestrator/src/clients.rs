//! Client lookup by topology role.

use std::sync::Arc;

use meshboot_api::{ClientProvider, ControlPlane, Tenancy};
use meshboot_core::{Node, Topology};

use crate::error::BootstrapResult;

/// Topology-aware wrapper around a [`ClientProvider`]. Cheap to clone.
#[derive(Clone)]
pub struct Clients {
    provider: Arc<dyn ClientProvider>,
    topology: Arc<Topology>,
}

impl Clients {
    pub fn new(provider: Arc<dyn ClientProvider>, topology: Arc<Topology>) -> Self {
        Self { provider, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Client for the node that fronts the cluster's leader.
    pub fn leader(&self, cluster: &str, token: &str) -> BootstrapResult<Arc<dyn ControlPlane>> {
        let address = self.topology.leader_address(cluster)?;
        Ok(self.provider.client(&address, token))
    }

    pub fn node(&self, node: &Node, token: &str) -> Arc<dyn ControlPlane> {
        self.provider
            .client(&node.api_address(self.topology.http_port), token)
    }

    /// Every server of the cluster with its own client, bypassing the leader.
    pub fn servers<'a>(
        &'a self,
        cluster: &'a str,
        token: &'a str,
    ) -> impl Iterator<Item = (&'a Node, Arc<dyn ControlPlane>)> + 'a {
        self.topology
            .servers(cluster)
            .map(move |node| (node, self.node(node, token)))
    }
}

/// Request scopes covering a cluster: one per partition with every
/// namespace when tenancy is enabled, else the implicit scope.
pub fn scopes(topology: &Topology, cluster: &str, tenancy: bool) -> Vec<Tenancy> {
    if !tenancy {
        return vec![Tenancy::none()];
    }
    topology
        .partitions(cluster)
        .iter()
        .map(|partition| Tenancy::new(partition, "*"))
        .collect()
}
