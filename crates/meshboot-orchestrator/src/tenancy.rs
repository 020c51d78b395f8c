//! Admin partitions and namespaces.

use std::collections::BTreeSet;

use meshboot_core::DEFAULT_TENANCY;
use tracing::{debug, info};

use crate::classify::is_booting;
use crate::clients::Clients;
use crate::error::{BootstrapError, BootstrapResult, ResultExt};
use crate::poll::{Attempt, CHECK_INTERVAL, Op, poll};

/// Make the cluster's partitions and namespaces match the topology.
///
/// Referenced ones are created when missing; non-default ones nothing
/// references any more are deleted, namespaces before their partitions.
pub async fn init_tenancy(clients: &Clients, cluster: &str, token: &str) -> BootstrapResult<()> {
    let topology = clients.topology();
    let client = clients.leader(cluster, token)?;
    let want_partitions = topology.partitions(cluster);
    let want_namespaces = topology.namespaces(cluster);

    let op = Op::new("partition listing", cluster);
    let have_partitions: BTreeSet<String> = poll(op, CHECK_INTERVAL, || async {
        Attempt::classify(client.partitions_list().await, is_booting)
    })
    .await
    .map_err(|e| BootstrapError::api(format!("list partitions in {cluster}"), e))?
    .into_iter()
    .map(|p| p.name)
    .collect();

    for partition in want_partitions.difference(&have_partitions) {
        client
            .partition_create(partition)
            .await
            .context(|| format!("create partition {partition} in {cluster}"))?;
        info!(%cluster, %partition, "partition created");
    }

    let mut have_namespaces = BTreeSet::new();
    for partition in have_partitions.union(&want_partitions) {
        let listed = client
            .namespaces_list(partition)
            .await
            .context(|| format!("list namespaces of {partition} in {cluster}"))?;
        have_namespaces.extend(listed.into_iter().map(|ns| {
            let partition = if ns.partition.is_empty() {
                partition.clone()
            } else {
                ns.partition
            };
            (partition, ns.name)
        }));
    }

    for (partition, namespace) in want_namespaces.difference(&have_namespaces) {
        client
            .namespace_create(partition, namespace)
            .await
            .context(|| format!("create namespace {partition}/{namespace} in {cluster}"))?;
        info!(%cluster, %partition, %namespace, "namespace created");
    }

    for (partition, namespace) in have_namespaces.difference(&want_namespaces) {
        if namespace == DEFAULT_TENANCY || !want_partitions.contains(partition) {
            continue;
        }
        client
            .namespace_delete(partition, namespace)
            .await
            .context(|| format!("delete namespace {partition}/{namespace} in {cluster}"))?;
        info!(%cluster, %partition, %namespace, "unreferenced namespace deleted");
    }

    for partition in have_partitions.difference(&want_partitions) {
        if partition == DEFAULT_TENANCY {
            continue;
        }
        client
            .partition_delete(partition)
            .await
            .context(|| format!("delete partition {partition} in {cluster}"))?;
        info!(%cluster, %partition, "unreferenced partition deleted");
    }

    debug!(
        %cluster,
        partitions = want_partitions.len(),
        namespaces = want_namespaces.len(),
        "tenancy in place"
    );
    Ok(())
}
