//! Inter-cluster linking: WAN federation or cluster peering.

use std::collections::BTreeMap;

use meshboot_api::{AgentTokenKind, ControlPlane, Peering};
use tracing::{debug, info};

use crate::classify::is_booting;
use crate::clients::Clients;
use crate::error::{BootstrapError, BootstrapResult};
use crate::poll::{ACL_INTERVAL, Attempt, CHECK_INTERVAL, Op, poll};
use crate::registry::{CredentialKey, TokenRegistry};

/// Push the replication token to every server of every secondary.
///
/// Servers refuse the token until their ACL system is up, so each push is
/// retried until accepted.
pub async fn push_replication_token(
    clients: &Clients,
    registry: &TokenRegistry,
    token: &str,
) -> BootstrapResult<()> {
    let secret = registry.get(&CredentialKey::replication())?;
    let topology = clients.topology();
    for cluster in topology.secondaries() {
        for (node, server) in clients.servers(&cluster.name, token) {
            let op = Op::new("replication token push", &cluster.name)
                .on(&node.name)
                .kind("replication");
            poll(op, ACL_INTERVAL, || async {
                Attempt::classify(
                    server
                        .agent_update_token(AgentTokenKind::Replication, secret)
                        .await,
                    is_booting,
                )
            })
            .await
            .map_err(|e| {
                BootstrapError::api(
                    format!("set replication token on {} of {}", node.name, cluster.name),
                    e,
                )
            })?;
        }
        info!(cluster = %cluster.name, "replication token installed");
    }
    Ok(())
}

/// Peer the primary with every other cluster.
///
/// Each direction is read first; a token is generated and established
/// only when either side lacks an established peering, so re-running on
/// a fully peered topology makes no token exchange.
pub async fn establish_peerings(
    clients: &Clients,
    tokens: &BTreeMap<String, String>,
) -> BootstrapResult<()> {
    let topology = clients.topology();
    let primary = topology.primary().name.as_str();
    let dialer = clients.leader(primary, token_of(tokens, primary))?;

    for peer in topology.secondaries() {
        let peer = peer.name.as_str();
        let acceptor = clients.leader(peer, token_of(tokens, peer))?;

        let forward = read_peering(dialer.as_ref(), primary, peer).await?;
        let backward = read_peering(acceptor.as_ref(), peer, primary).await?;
        let established = |p: &Option<Peering>| p.as_ref().is_some_and(Peering::is_established);
        if established(&forward) && established(&backward) {
            debug!(%primary, %peer, "peering already established");
            continue;
        }

        let what = format!("peering token for {peer}");
        let peering_token = poll(Op::new(&what, primary), CHECK_INTERVAL, || async {
            Attempt::classify(dialer.peering_generate_token(peer, "").await, is_booting)
        })
        .await
        .map_err(|e| BootstrapError::api(format!("generate peering token in {primary} for {peer}"), e))?;

        let what = format!("peering establish with {primary}");
        poll(Op::new(&what, peer), CHECK_INTERVAL, || async {
            Attempt::classify(
                acceptor
                    .peering_establish(primary, &peering_token, "")
                    .await,
                is_booting,
            )
        })
        .await
        .map_err(|e| BootstrapError::api(format!("establish peering from {peer} to {primary}"), e))?;

        info!(%primary, %peer, "peering established");
    }
    Ok(())
}

fn token_of<'a>(tokens: &'a BTreeMap<String, String>, cluster: &str) -> &'a str {
    tokens.get(cluster).map(String::as_str).unwrap_or_default()
}

async fn read_peering(
    client: &dyn ControlPlane,
    cluster: &str,
    peer: &str,
) -> BootstrapResult<Option<Peering>> {
    let what = format!("peering read for {peer}");
    poll(Op::new(&what, cluster), CHECK_INTERVAL, || async {
        Attempt::classify(client.peering_read(peer, "").await, is_booting)
    })
    .await
    .map_err(|e| BootstrapError::api(format!("read peering {peer} in {cluster}"), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use meshboot_api::ApiError;

    #[tokio::test(start_paused = true)]
    async fn replication_push_retries_until_acl_available() {
        let (mesh, clients) = testutil::federation();
        let mut registry = TokenRegistry::new();
        registry
            .insert(CredentialKey::replication(), "repl-secret".into())
            .unwrap();
        mesh.fail_next(
            "agent_update_token",
            "dc2-server1",
            3,
            ApiError::status(500, "10.0.2.11:8500", "ACL system not yet available"),
        );

        push_replication_token(&clients, &registry, "root").await.unwrap();
        assert_eq!(mesh.count_in("agent_update_token", "dc2"), 4);
        assert_eq!(
            mesh.agent_token("dc2", "dc2-server1", AgentTokenKind::Replication)
                .as_deref(),
            Some("repl-secret")
        );
        assert_eq!(mesh.count_in("agent_update_token", "dc1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replication_push_requires_registered_token() {
        let (_mesh, clients) = testutil::federation();
        let err = push_replication_token(&clients, &TokenRegistry::new(), "root")
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Registry(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn peering_is_idempotent() {
        let (mesh, clients) = testutil::peering();
        let tokens = BTreeMap::new();

        establish_peerings(&clients, &tokens).await.unwrap();
        assert!(mesh.peering("dc1", "dc2").unwrap().is_established());
        assert!(mesh.peering("dc2", "dc1").unwrap().is_established());
        assert_eq!(mesh.count("peering_generate_token"), 1);

        mesh.clear_calls();
        establish_peerings(&clients, &tokens).await.unwrap();
        assert_eq!(mesh.count("peering_generate_token"), 0);
        assert_eq!(mesh.count("peering_establish"), 0);
        assert_eq!(mesh.count("peering_read"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_established_peering_is_redone() {
        let (mesh, clients) = testutil::peering();
        // A token generated by an interrupted run, never established.
        clients
            .leader("dc1", "")
            .unwrap()
            .peering_generate_token("dc2", "")
            .await
            .unwrap();
        mesh.clear_calls();

        establish_peerings(&clients, &BTreeMap::new()).await.unwrap();
        assert_eq!(mesh.count("peering_generate_token"), 1);
        assert_eq!(mesh.count("peering_establish"), 1);
        assert!(mesh.peering("dc2", "dc1").unwrap().is_established());
    }
}
