//! Convergence waiters.
//!
//! Each waiter blocks until some observable steady state is reached:
//! a leader, a token that every server accepts, agents that have completed
//! anti-entropy, a WAN path to a remote datacenter, and finally a mesh
//! where every service instance is passing. Only the final health wait is
//! bounded.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use meshboot_api::{AgentTokenKind, ControlPlane, HealthCheck, Tenancy};
use meshboot_core::{ConfigError, Node};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::classify::{always, is_booting, is_token_not_live};
use crate::clients::{Clients, scopes};
use crate::error::{BootstrapError, BootstrapResult};
use crate::poll::{
    ACL_INTERVAL, ANTI_ENTROPY_INTERVAL, Attempt, CHECK_INTERVAL, Op, poll, poll_until,
};
use crate::registry::{CredentialKey, RegistryError, TokenRegistry};

/// Key written to prove a cluster accepts writes.
pub const READY_KEY: &str = "meshboot/ready";
/// Key written across the WAN to prove federation has converged.
pub const WAN_CHECK_KEY: &str = "meshboot/wan-check";

// ── Leader ─────────────────────────────────────────────────────────

/// Block until the cluster reports a leader; returns its address.
pub async fn wait_for_leader(clients: &Clients, cluster: &str, token: &str) -> BootstrapResult<String> {
    let client = clients.leader(cluster, token)?;
    let leader = poll(Op::new("leader election", cluster), CHECK_INTERVAL, || async {
        match client.leader().await {
            Ok(leader) if !leader.is_empty() => Attempt::Done(leader),
            Ok(_) => Attempt::Retry("no leader elected".to_string()),
            Err(e) => Attempt::classify(Err(e), is_booting),
        }
    })
    .await
    .map_err(|e| BootstrapError::api(format!("wait for leader in {cluster}"), e))?;
    info!(%cluster, %leader, "leader elected");
    Ok(leader)
}

// ── Token liveness ─────────────────────────────────────────────────

/// Block until `token` resolves on every server of `cluster`.
pub async fn wait_token_live(clients: &Clients, cluster: &str, token: &str) -> BootstrapResult<()> {
    for (node, server) in clients.servers(cluster, token) {
        let op = Op::new("token replication", cluster).on(&node.name);
        poll(op, ACL_INTERVAL, || async {
            Attempt::classify(server.token_read_self().await.map(|_| ()), is_token_not_live)
        })
        .await
        .map_err(|e| {
            BootstrapError::api(format!("check token on server {} of {cluster}", node.name), e)
        })?;
    }
    debug!(%cluster, "token live on every server");
    Ok(())
}

// ── Anti-entropy ───────────────────────────────────────────────────

/// Re-inject agent tokens and re-list the catalog until every agent of the
/// cluster has posted tagged addresses.
///
/// Any tagged address counts as synced; the value is not compared.
pub async fn wait_anti_entropy(
    clients: &Clients,
    registry: &TokenRegistry,
    cluster: &str,
    token: &str,
    tenancy: bool,
) -> BootstrapResult<()> {
    let topology = clients.topology();
    let injections = topology
        .agents(cluster)
        .map(|node| {
            let secret = registry.get(&CredentialKey::agent(cluster, &node.name))?;
            Ok((node, clients.node(node, token), secret))
        })
        .collect::<Result<Vec<_>, RegistryError>>()?;
    let leader = clients.leader(cluster, token)?;
    let partitions: Vec<Tenancy> = scopes(topology, cluster, tenancy);

    poll(Op::new("anti-entropy sync", cluster), ANTI_ENTROPY_INTERVAL, || async {
        for (node, client, secret) in &injections {
            let result = client.agent_update_token(AgentTokenKind::Agent, secret).await;
            if let Err(e) = result {
                return Attempt::classify(Err(e), is_booting).map_err(|e| {
                    BootstrapError::api(format!("inject agent token on {cluster}/{}", node.name), e)
                });
            }
        }

        let mut synced = BTreeSet::new();
        for scope in &partitions {
            match leader.catalog_nodes(&scope.partition).await {
                Ok(nodes) => synced.extend(
                    nodes
                        .into_iter()
                        .filter(|n| n.has_tagged_addresses())
                        .map(|n| n.node),
                ),
                Err(e) => {
                    return Attempt::classify(Err(e), is_booting)
                        .map_err(|e| BootstrapError::api(format!("list catalog nodes in {cluster}"), e));
                }
            }
        }

        let stragglers = stragglers(injections.iter().map(|(node, _, _)| *node), &synced);
        if stragglers.is_empty() {
            Attempt::Done(())
        } else {
            Attempt::Retry(format!(
                "{} agent(s) not yet synced: {}",
                stragglers.len(),
                stragglers.join(", ")
            ))
        }
    })
    .await?;

    info!(%cluster, agents = injections.len(), "anti-entropy sync complete");
    Ok(())
}

/// Expected agents that have not posted any tagged address.
fn stragglers<'a>(expected: impl Iterator<Item = &'a Node>, synced: &BTreeSet<String>) -> Vec<String> {
    expected
        .filter(|node| !synced.contains(&node.name))
        .map(|node| node.name.clone())
        .collect()
}

// ── Cross-cluster KV ───────────────────────────────────────────────

/// Block until a KV write from `from` reaches datacenter `to`.
pub async fn wait_cross_cluster_kv(
    clients: &Clients,
    from: &str,
    to: &str,
    token: &str,
) -> BootstrapResult<()> {
    let client = clients.leader(from, token)?;
    let what = format!("WAN path to {to}");
    poll(Op::new(&what, from), CHECK_INTERVAL, || async {
        Attempt::classify(client.kv_put(WAN_CHECK_KEY, from, Some(to)).await, always)
    })
    .await
    .map_err(|e| BootstrapError::api(format!("write KV from {from} to {to}"), e))?;
    info!(%from, %to, "cross-cluster KV write succeeded");
    Ok(())
}

// ── Completion ─────────────────────────────────────────────────────

/// Health of one check, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

impl CheckStatus {
    /// Unknown status strings are treated as critical.
    pub fn of(check: &HealthCheck) -> Self {
        if check.check_id.starts_with("_node_maintenance")
            || check.check_id.starts_with("_service_maintenance")
        {
            return CheckStatus::Maintenance;
        }
        match check.status.as_str() {
            "passing" => CheckStatus::Passing,
            "warning" => CheckStatus::Warning,
            "maintenance" => CheckStatus::Maintenance,
            _ => CheckStatus::Critical,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Merge the checks of one instance: the worst status wins.
pub fn worst_status(checks: &[HealthCheck]) -> CheckStatus {
    checks
        .iter()
        .map(CheckStatus::of)
        .max()
        .unwrap_or(CheckStatus::Passing)
}

/// Block until every processed cluster accepts writes and reports every
/// service instance passing, or fail once `budget` has elapsed.
pub async fn wait_for_completion(
    clients: &Clients,
    clusters: &[String],
    tokens: &BTreeMap<String, String>,
    tenancy: bool,
    budget: Duration,
) -> BootstrapResult<()> {
    let deadline = Instant::now().checked_add(budget).ok_or_else(|| {
        ConfigError::Invalid(format!("final check deadline {budget:?} is out of range"))
    })?;
    let elapsed = |detail: String| BootstrapError::DeadlineExceeded {
        deadline: budget,
        detail,
    };

    for cluster in clusters {
        let token = tokens.get(cluster).map(String::as_str).unwrap_or_default();
        let client = clients.leader(cluster, token)?;

        poll_until(
            Op::new("local write", cluster),
            CHECK_INTERVAL,
            deadline,
            || async {
                Attempt::classify(client.kv_put(READY_KEY, cluster, None).await, always)
                    .map_err(|e| BootstrapError::api(format!("write KV in {cluster}"), e))
            },
            elapsed,
        )
        .await?;

        let cluster_scopes = scopes(clients.topology(), cluster, tenancy);
        poll_until(
            Op::new("mesh health", cluster),
            CHECK_INTERVAL,
            deadline,
            || scan_health(client.as_ref(), cluster, &cluster_scopes),
            elapsed,
        )
        .await?;
        info!(%cluster, "all service instances passing");
    }
    Ok(())
}

/// One pass over every service instance of the cluster.
async fn scan_health(
    client: &dyn ControlPlane,
    cluster: &str,
    scopes: &[Tenancy],
) -> Attempt<(), BootstrapError> {
    let mut unhealthy = Vec::new();
    for scope in scopes {
        let services = match client.catalog_services(scope).await {
            Ok(services) => services,
            Err(e) => {
                return Attempt::classify(Err(e), is_booting)
                    .map_err(|e| BootstrapError::api(format!("list services in {cluster}"), e));
            }
        };
        for name in services.keys() {
            let instances = match client.health_service(name, scope).await {
                Ok(instances) => instances,
                Err(e) => {
                    return Attempt::classify(Err(e), is_booting).map_err(|e| {
                        BootstrapError::api(format!("read health of {name} in {cluster}"), e)
                    });
                }
            };
            for instance in instances {
                let status = worst_status(&instance.checks);
                if status > CheckStatus::Passing {
                    unhealthy.push(format!("{name} on {} is {status}", instance.node.node));
                }
            }
        }
    }

    if unhealthy.is_empty() {
        Attempt::Done(())
    } else {
        Attempt::Retry(format!("{cluster}: {}", unhealthy.join(", ")))
    }
}
