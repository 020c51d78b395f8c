//! ACL bootstrap.
//!
//! The control plane hands out its management token exactly once, so the
//! secret is persisted before anything uses it. A cached secret is
//! validated against the leader on every run; a rejected one is forgotten
//! and the cluster is bootstrapped again.

use meshboot_cache::SecretCache;
use meshboot_core::config::SecurityConfig;
use tracing::{debug, info, warn};

use crate::classify::is_booting;
use crate::clients::Clients;
use crate::error::{BootstrapError, BootstrapResult, ResultExt};
use crate::poll::{ACL_INTERVAL, Attempt, Op, poll};
use crate::secrets::management_token_name;
use crate::wait::wait_token_live;

/// Obtain a working management token for `cluster`, bootstrapping its ACL
/// system if needed, and wait until every server accepts it.
pub async fn bootstrap_acls(
    clients: &Clients,
    cache: &dyn SecretCache,
    security: &SecurityConfig,
    cluster: &str,
) -> BootstrapResult<String> {
    let name = management_token_name(cluster);

    let mut secret = cache.load(&name).context(|| format!("load {name}"))?;
    if !secret.is_empty() && !validate_cached(clients, cluster, &secret).await? {
        cache.delete(&name).context(|| format!("delete {name}"))?;
        secret.clear();
    }

    if secret.is_empty() {
        secret = match &security.initial_management_token {
            Some(seeded) if !seeded.is_empty() => {
                cache.save(&name, seeded).context(|| format!("cache {name}"))?;
                info!(%cluster, "using pre-seeded management token");
                seeded.clone()
            }
            _ => bootstrap(clients, cache, cluster, &name).await?,
        };
    }

    wait_token_live(clients, cluster, &secret).await?;
    Ok(secret)
}

/// Self-read the cached token on the leader. Returns false when the
/// control plane rejects it for any reason other than still booting.
async fn validate_cached(clients: &Clients, cluster: &str, secret: &str) -> BootstrapResult<bool> {
    let leader = clients.leader(cluster, secret)?;
    let op = Op::new("management token check", cluster).kind("management");
    let result = poll(op, ACL_INTERVAL, || async {
        Attempt::classify(leader.token_read_self().await, is_booting)
    })
    .await;

    match result {
        Ok(token) => {
            debug!(%cluster, accessor = %token.accessor_id, "cached management token valid");
            Ok(true)
        }
        Err(e) => {
            warn!(%cluster, error = %e, "cached management token rejected, discarding");
            Ok(false)
        }
    }
}

async fn bootstrap(
    clients: &Clients,
    cache: &dyn SecretCache,
    cluster: &str,
    name: &str,
) -> BootstrapResult<String> {
    let leader = clients.leader(cluster, "")?;
    let op = Op::new("ACL bootstrap", cluster).kind("management");
    let token = poll(op, ACL_INTERVAL, || async {
        Attempt::classify(leader.acl_bootstrap().await, is_booting)
    })
    .await
    .map_err(|e| BootstrapError::api(format!("bootstrap ACLs in {cluster}"), e))?;

    cache
        .save(name, &token.secret_id)
        .context(|| format!("cache {name}"))?;
    info!(%cluster, accessor = %token.accessor_id, "ACL system bootstrapped");
    Ok(token.secret_id)
}
