//! Credential issuance with immediate or deferred commit.
//!
//! Issuance is create-or-update: the control plane has no "create if
//! absent", so policies are looked up by name and tokens by description,
//! then updated in place (keeping their secret) or created.
//!
//! A credential issued through its own cluster is committed immediately:
//! registered and saved to the cache. A credential minted through cluster
//! A for cluster B is registered immediately but only cached by its
//! [`CommitFn`], which first waits for the token to resolve on every
//! server of B.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use meshboot_api::{
    AclPolicy, AclToken, ApiResult, ControlPlane, NodeIdentity, PolicyLink, ServiceIdentity,
    Tenancy,
};
use meshboot_cache::SecretCache;
use meshboot_core::DEFAULT_TENANCY;
use tracing::{debug, info};

use crate::clients::Clients;
use crate::error::{BootstrapResult, ResultExt};
use crate::registry::{CredentialKey, CredentialKind, TokenRegistry};
use crate::wait::wait_token_live;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Deferred cache write, invoked once the target cluster is ready.
pub type CommitFn = Box<dyn FnOnce() -> BoxFuture<'static, BootstrapResult<()>> + Send>;

pub const MESH_GATEWAY_POLICY: &str = "mesh-gateway";
pub const REPLICATION_POLICY: &str = "acl-replication";

const MESH_GATEWAY_RULES: &str = r#"mesh = "write"
peering = "read"
service_prefix "" {
  policy = "read"
}
node_prefix "" {
  policy = "read"
}
agent_prefix "" {
  policy = "read"
}
"#;

const REPLICATION_RULES: &str = r#"acl = "write"
operator = "write"
service_prefix "" {
  policy = "read"
  intentions = "read"
}
"#;

/// One issued credential.
pub struct IssueResult {
    pub key: CredentialKey,
    pub secret: String,
    /// Present when the credential still has to be cached.
    pub commit: Option<CommitFn>,
}

/// Which cluster's API mints the credential, and for which cluster.
#[derive(Debug, Clone)]
pub struct Route {
    pub via: String,
    pub token: String,
    pub target: String,
}

impl Route {
    pub fn local(cluster: &str, token: &str) -> Self {
        Self::through(cluster, token, cluster)
    }

    pub fn through(via: &str, token: &str, target: &str) -> Self {
        Self {
            via: via.to_string(),
            token: token.to_string(),
            target: target.to_string(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.via != self.target
    }
}

/// Mints credentials and commits them.
pub struct Issuer {
    clients: Clients,
    cache: Arc<dyn SecretCache>,
    tenancy: bool,
}

impl Issuer {
    pub fn new(clients: Clients, cache: Arc<dyn SecretCache>, tenancy: bool) -> Self {
        Self {
            clients,
            cache,
            tenancy,
        }
    }

    /// Issue agent, mesh-gateway and service credentials for the route's
    /// target. Returns the commits still pending (deferred routes only).
    pub async fn issue_cluster(
        &self,
        registry: &mut TokenRegistry,
        route: &Route,
    ) -> BootstrapResult<Vec<CommitFn>> {
        let mut pending = Vec::new();
        for kind in [
            CredentialKind::Agent,
            CredentialKind::MeshGateway,
            CredentialKind::Service,
        ] {
            for issued in self.issue(registry, kind, route).await? {
                pending.extend(issued.commit);
            }
        }
        Ok(pending)
    }

    /// Issue every credential of one kind. Nothing is registered unless
    /// the whole kind succeeds.
    pub async fn issue(
        &self,
        registry: &mut TokenRegistry,
        kind: CredentialKind,
        route: &Route,
    ) -> BootstrapResult<Vec<IssueResult>> {
        let client = self.clients.leader(&route.via, &route.token)?;
        let target = route.target.as_str();
        let context = || format!("issue {kind} tokens for {target} via {}", route.via);

        if let Some(policy) = self.policy_for(kind) {
            create_or_update_policy(client.as_ref(), policy)
                .await
                .context(context)?;
        }

        let mut minted = Vec::new();
        for (key, desired) in self.desired_tokens(kind, target) {
            let token = create_or_update_token(client.as_ref(), desired)
                .await
                .context(context)?;
            debug!(cluster = %target, %kind, credential = %key, "token issued");
            minted.push((key, token.secret_id));
        }

        let mut results = Vec::with_capacity(minted.len());
        for (key, secret) in minted {
            registry.insert(key.clone(), secret.clone())?;
            let commit = if route.is_deferred() {
                Some(self.deferred_commit(target, &key, &secret))
            } else {
                let name = key.cache_name();
                self.cache
                    .save(&name, &secret)
                    .context(|| format!("cache {name}"))?;
                None
            };
            results.push(IssueResult {
                key,
                secret,
                commit,
            });
        }

        if !results.is_empty() {
            info!(cluster = %target, %kind, count = results.len(), deferred = route.is_deferred(), "credentials issued");
        }
        Ok(results)
    }

    fn deferred_commit(&self, target: &str, key: &CredentialKey, secret: &str) -> CommitFn {
        let clients = self.clients.clone();
        let cache = Arc::clone(&self.cache);
        let target = target.to_string();
        let name = key.cache_name();
        let secret = secret.to_string();
        Box::new(move || -> BoxFuture<'static, BootstrapResult<()>> {
            Box::pin(async move {
                wait_token_live(&clients, &target, &secret).await?;
                cache
                    .save(&name, &secret)
                    .context(|| format!("cache {name}"))?;
                debug!(cluster = %target, %name, "deferred credential committed");
                Ok(())
            })
        })
    }

    fn policy_for(&self, kind: CredentialKind) -> Option<AclPolicy> {
        let (name, description, rules) = match kind {
            CredentialKind::MeshGateway => (
                MESH_GATEWAY_POLICY,
                "Mesh gateway policy",
                MESH_GATEWAY_RULES,
            ),
            CredentialKind::Replication => (
                REPLICATION_POLICY,
                "ACL replication policy",
                REPLICATION_RULES,
            ),
            CredentialKind::Agent | CredentialKind::Service => return None,
        };
        Some(AclPolicy {
            name: name.to_string(),
            description: description.to_string(),
            rules: rules.to_string(),
            partition: self.partition(DEFAULT_TENANCY),
            ..Default::default()
        })
    }

    /// Tokens the target cluster should hold for one kind, with their keys.
    fn desired_tokens(&self, kind: CredentialKind, cluster: &str) -> Vec<(CredentialKey, AclToken)> {
        let topology = self.clients.topology();
        match kind {
            CredentialKind::Agent => topology
                .agents(cluster)
                .map(|node| {
                    let token = AclToken {
                        description: format!("agent token for {cluster}/{}", node.name),
                        node_identities: vec![NodeIdentity {
                            node_name: node.name.clone(),
                            datacenter: cluster.to_string(),
                        }],
                        partition: self.partition(node.partition()),
                        ..Default::default()
                    };
                    (CredentialKey::agent(cluster, &node.name), token)
                })
                .collect(),
            CredentialKind::MeshGateway => {
                if topology.gateways(cluster).next().is_none() {
                    return Vec::new();
                }
                let token = AclToken {
                    description: format!("mesh gateway token for {cluster}"),
                    policies: vec![PolicyLink {
                        name: MESH_GATEWAY_POLICY.to_string(),
                        ..Default::default()
                    }],
                    service_identities: vec![ServiceIdentity {
                        service_name: "mesh-gateway".to_string(),
                        datacenters: vec![cluster.to_string()],
                    }],
                    partition: self.partition(DEFAULT_TENANCY),
                    ..Default::default()
                };
                vec![(CredentialKey::mesh_gateway(cluster), token)]
            }
            CredentialKind::Service => topology
                .services(cluster)
                .map(|(_, service)| {
                    let token = AclToken {
                        description: format!("service token for {cluster}/{}", service.id.key()),
                        service_identities: vec![ServiceIdentity {
                            service_name: service.id.name.clone(),
                            datacenters: vec![cluster.to_string()],
                        }],
                        namespace: self.partition(service.id.namespace()),
                        partition: self.partition(service.id.partition()),
                        ..Default::default()
                    };
                    (CredentialKey::service(cluster, &service.id), token)
                })
                .collect(),
            CredentialKind::Replication => {
                let token = AclToken {
                    description: "ACL replication token".to_string(),
                    policies: vec![PolicyLink {
                        name: REPLICATION_POLICY.to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                };
                vec![(CredentialKey::replication(), token)]
            }
        }
    }

    /// Tenancy field value: empty when tenancy is disabled.
    fn partition(&self, value: &str) -> String {
        if self.tenancy {
            value.to_string()
        } else {
            String::new()
        }
    }
}

/// Update the policy with the same name, or create it.
pub async fn create_or_update_policy(client: &dyn ControlPlane, desired: AclPolicy) -> ApiResult<AclPolicy> {
    let scope = Tenancy::new(&desired.partition, &desired.namespace);
    match client.policy_read_by_name(&desired.name, &scope).await? {
        Some(existing) => {
            let update = AclPolicy {
                id: existing.id,
                ..desired
            };
            client.policy_update(&update).await
        }
        None => client.policy_create(&desired).await,
    }
}

/// Update the token with the same description (keeping its secret), or
/// create it.
pub async fn create_or_update_token(client: &dyn ControlPlane, desired: AclToken) -> ApiResult<AclToken> {
    let scope = Tenancy::new(&desired.partition, &desired.namespace);
    let existing = client
        .token_list(&scope)
        .await?
        .into_iter()
        .find(|t| t.description == desired.description);

    match existing {
        Some(existing) => {
            let update = AclToken {
                accessor_id: existing.accessor_id,
                secret_id: existing.secret_id.clone(),
                ..desired
            };
            let mut updated = client.token_update(&update).await?;
            if updated.secret_id.is_empty() {
                updated.secret_id = existing.secret_id;
            }
            Ok(updated)
        }
        None => client.token_create(&desired).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use meshboot_api::ApiError;
    use meshboot_cache::SecretStore;

    async fn bootstrap(clients: &Clients) -> String {
        clients
            .leader("dc1", "")
            .unwrap()
            .acl_bootstrap()
            .await
            .unwrap()
            .secret_id
    }

    fn issuer(clients: &Clients) -> (Issuer, Arc<SecretStore>) {
        let cache = Arc::new(SecretStore::open_in_memory().unwrap());
        (Issuer::new(clients.clone(), cache.clone(), false), cache)
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_issue_registers_and_caches() {
        let (mesh, clients) = testutil::federation();
        let root = bootstrap(&clients).await;
        let (issuer, cache) = issuer(&clients);
        let mut registry = TokenRegistry::new();

        let pending = issuer
            .issue_cluster(&mut registry, &Route::local("dc1", &root))
            .await
            .unwrap();
        assert!(pending.is_empty());

        // 4 agents, 1 gateway, 1 service.
        assert_eq!(registry.len(), 6);
        let key = CredentialKey::agent("dc1", "dc1-client1");
        assert_eq!(cache.load(&key.cache_name()).unwrap(), registry.get(&key).unwrap());
        assert!(mesh.policies("dc1").iter().any(|p| p.name == MESH_GATEWAY_POLICY));
    }

    #[tokio::test(start_paused = true)]
    async fn reissue_updates_and_keeps_secrets() {
        let (mesh, clients) = testutil::federation();
        let root = bootstrap(&clients).await;
        let (issuer, _cache) = issuer(&clients);

        let mut first = TokenRegistry::new();
        issuer
            .issue_cluster(&mut first, &Route::local("dc1", &root))
            .await
            .unwrap();
        let created = mesh.count("token_create");

        let mut second = TokenRegistry::new();
        issuer
            .issue_cluster(&mut second, &Route::local("dc1", &root))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(mesh.count("token_create"), created);
        assert_eq!(mesh.count("token_update"), 6);
        assert_eq!(mesh.count("policy_create"), 1);
        assert_eq!(mesh.count("policy_update"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_kind_registers_nothing() {
        let (mesh, clients) = testutil::federation();
        let root = bootstrap(&clients).await;
        let (issuer, cache) = issuer(&clients);
        let mut registry = TokenRegistry::new();

        // Two agent tokens get minted, the third create fails.
        mesh.fail_after(
            "token_create",
            "dc1",
            2,
            ApiError::status(500, "10.0.1.11:8500", "Permission denied"),
        );
        let err = issuer
            .issue(&mut registry, CredentialKind::Agent, &Route::local("dc1", &root))
            .await
            .err()
            .unwrap();

        assert!(err.to_string().starts_with("issue agent tokens for dc1 via dc1"));
        assert_eq!(mesh.count("token_create"), 3);
        assert!(registry.is_empty());
        assert!(cache.names().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_commit_waits_for_target() {
        let (mesh, clients) = testutil::federation();
        let root = bootstrap(&clients).await;
        let (issuer, cache) = issuer(&clients);
        let mut registry = TokenRegistry::new();

        let pending = issuer
            .issue_cluster(&mut registry, &Route::through("dc1", &root, "dc2"))
            .await
            .unwrap();

        // dc2: 2 agents, no gateway, 1 service.
        assert_eq!(pending.len(), 3);
        let key = CredentialKey::agent("dc2", "dc2-client1");
        assert!(registry.contains(&key));
        assert!(cache.names().unwrap().is_empty());

        mesh.fail_next(
            "token_read_self",
            "dc2",
            1,
            ApiError::status(500, "10.0.2.11:8500", "Permission denied"),
        );
        let mut pending = pending.into_iter();
        let first = pending.next().unwrap();
        assert!(first().await.is_err());
        assert!(cache.names().unwrap().is_empty());

        for commit in pending {
            commit().await.unwrap();
        }
        assert_eq!(cache.names().unwrap().len(), 2);
        assert!(!cache.load(&key.cache_name()).unwrap().is_empty());
    }

    #[test]
    fn route_is_deferred_across_clusters() {
        assert!(!Route::local("dc1", "t").is_deferred());
        assert!(Route::through("dc1", "t", "dc2").is_deferred());
    }
}
