//! Central configuration entries.
//!
//! The desired set is the stock entries derived from the topology with the
//! user's entries merged over them. Every desired entry is written, then
//! observed entries with no desired counterpart are deleted, most
//! dependent kinds first.

use std::collections::{BTreeMap, BTreeSet};

use meshboot_api::Tenancy;
use meshboot_core::config::BootstrapConfig;
use meshboot_core::entry::{
    DELETION_ORDER, EXPORTED_SERVICES, PROXY_DEFAULTS, SERVICE_INTENTIONS, deletion_rank,
};
use meshboot_core::{ConfigEntry, EntryKey, LinkMode, ServiceId, Topology, UpstreamLocality};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::classify::is_booting;
use crate::clients::{Clients, scopes};
use crate::error::{BootstrapError, BootstrapResult};
use crate::poll::{Attempt, CHECK_INTERVAL, Op, poll};

pub const PROMETHEUS_BIND_ADDR: &str = "0.0.0.0:9102";

// ── Desired set ────────────────────────────────────────────────────

/// Clusters whose entries live in `cluster`: all of them under
/// federation (entries replicate from the primary), else just itself.
fn owned_clusters<'a>(topology: &'a Topology, cluster: &'a str) -> Vec<&'a str> {
    match topology.link_mode {
        LinkMode::Federation => topology.clusters.iter().map(|c| c.name.as_str()).collect(),
        LinkMode::Peering => vec![cluster],
    }
}

/// Entries derived from the topology and mesh settings.
pub fn stock_entries(topology: &Topology, config: &BootstrapConfig, cluster: &str) -> Vec<ConfigEntry> {
    let owned = owned_clusters(topology, cluster);
    let mut out = Vec::new();

    let has_gateways = owned.iter().any(|c| topology.gateways(c).next().is_some());
    if config.mesh.prometheus || has_gateways {
        let mut entry = ConfigEntry::new(PROXY_DEFAULTS, "global");
        if config.mesh.prometheus {
            entry = entry.with_field(
                "Config",
                json!({ "envoy_prometheus_bind_addr": PROMETHEUS_BIND_ADDR }),
            );
        }
        if has_gateways {
            entry = entry.with_field("MeshGateway", json!({ "Mode": "local" }));
        }
        out.push(entry);
    }

    if config.mesh.default_intentions {
        out.extend(intentions(topology, cluster, &owned));
    }

    if topology.link_mode == LinkMode::Peering {
        out.extend(exported_services(topology, cluster));
    }

    out
}

/// One allow-all-downstreams intention per upstream destination.
fn intentions(topology: &Topology, cluster: &str, owned: &[&str]) -> Vec<ConfigEntry> {
    let mut sources: BTreeMap<ServiceId, Vec<Value>> = BTreeMap::new();

    for (node, service) in topology.all_services() {
        let Some(upstream) = &service.upstream else {
            continue;
        };
        let mut source = Map::new();
        source.insert("Name".into(), json!(service.id.name));
        source.insert("Namespace".into(), json!(service.id.namespace()));
        match upstream.locality() {
            UpstreamLocality::Peer(peer) => {
                if peer != cluster {
                    continue;
                }
                source.insert("Peer".into(), json!(node.cluster));
            }
            UpstreamLocality::Local | UpstreamLocality::Datacenter(_) => {
                if !owned.contains(&node.cluster.as_str()) {
                    continue;
                }
                source.insert("Partition".into(), json!(service.id.partition()));
            }
        }
        source.insert("Action".into(), json!("allow"));
        let list = sources.entry(upstream.id.clone()).or_default();
        let source = Value::Object(source);
        if !list.contains(&source) {
            list.push(source);
        }
    }

    sources
        .into_iter()
        .map(|(dest, sources)| {
            ConfigEntry::new(SERVICE_INTENTIONS, &dest.name)
                .with_tenancy(dest.namespace(), dest.partition())
                .with_field("Sources", Value::Array(sources))
        })
        .collect()
}

/// Per partition of `cluster`, export every service a peer consumes.
fn exported_services(topology: &Topology, cluster: &str) -> Vec<ConfigEntry> {
    // partition -> (namespace, name) -> consuming peers
    let mut exports: BTreeMap<String, BTreeMap<(String, String), BTreeSet<String>>> =
        BTreeMap::new();
    for (node, service) in topology.all_services() {
        let Some(upstream) = &service.upstream else {
            continue;
        };
        if upstream.locality() != UpstreamLocality::Peer(cluster) {
            continue;
        }
        exports
            .entry(upstream.id.partition().to_string())
            .or_default()
            .entry((
                upstream.id.namespace().to_string(),
                upstream.id.name.clone(),
            ))
            .or_default()
            .insert(node.cluster.clone());
    }

    exports
        .into_iter()
        .map(|(partition, services)| {
            let services: Vec<Value> = services
                .into_iter()
                .map(|((namespace, name), peers)| {
                    let consumers: Vec<Value> =
                        peers.into_iter().map(|peer| json!({ "Peer": peer })).collect();
                    json!({ "Name": name, "Namespace": namespace, "Consumers": consumers })
                })
                .collect();
            ConfigEntry::new(EXPORTED_SERVICES, &partition)
                .with_tenancy("", &partition)
                .with_field("Services", Value::Array(services))
        })
        .collect()
}

/// Overlay user entries on the stock set.
///
/// A user `proxy-defaults` entry merges into the stock one: its `Config`
/// keys win one by one and its other fields replace the stock fields.
/// Any other user entry replaces the stock entry with the same key.
pub fn merge_entries(stock: Vec<ConfigEntry>, user: &[ConfigEntry]) -> Vec<ConfigEntry> {
    let mut merged: BTreeMap<EntryKey, ConfigEntry> =
        stock.into_iter().map(|e| (e.key(), e)).collect();

    for entry in user {
        let key = entry.key();
        match merged.get_mut(&key) {
            Some(base) if entry.kind == PROXY_DEFAULTS => merge_proxy_defaults(base, entry),
            _ => {
                merged.insert(key, entry.clone());
            }
        }
    }
    merged.into_values().collect()
}

fn merge_proxy_defaults(base: &mut ConfigEntry, user: &ConfigEntry) {
    for (field, value) in &user.body {
        let merged = match (base.body.get(field), value) {
            (Some(Value::Object(stock)), Value::Object(overrides)) if field == "Config" => {
                let mut config = stock.clone();
                config.extend(overrides.clone());
                Value::Object(config)
            }
            _ => value.clone(),
        };
        base.body.insert(field.clone(), merged);
    }
}

/// Every entry `cluster` should hold, in write order.
pub fn desired_entries(topology: &Topology, config: &BootstrapConfig, cluster: &str) -> Vec<ConfigEntry> {
    let user = config
        .config_entries
        .get(cluster)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut entries = merge_entries(stock_entries(topology, config, cluster), user);
    if !config.tenancy.enabled {
        entries.iter_mut().for_each(ConfigEntry::scrub_tenancy);
    }
    entries.sort_by_cached_key(|e| (write_rank(&e.kind), e.key()));
    entries
}

/// Referenced kinds are written before the kinds that reference them.
fn write_rank(kind: &str) -> usize {
    match deletion_rank(kind) {
        0 => usize::MAX,
        rank => DELETION_ORDER.len() - rank,
    }
}

// ── Reconcile ──────────────────────────────────────────────────────

/// Write the desired entries to `cluster` and delete stale ones.
pub async fn reconcile_entries(
    clients: &Clients,
    config: &BootstrapConfig,
    cluster: &str,
    token: &str,
) -> BootstrapResult<()> {
    let topology = clients.topology();
    let client = clients.leader(cluster, token)?;
    let desired = desired_entries(topology, config, cluster);

    for entry in &desired {
        let what = format!("write config entry {}", entry.name);
        let op = Op::new(&what, cluster).kind(&entry.kind);
        poll(op, CHECK_INTERVAL, || async {
            Attempt::classify(client.config_entry_set(entry).await, is_booting)
        })
        .await
        .map_err(|e| BootstrapError::api(format!("write config entry {} in {cluster}", entry.key()), e))?;
        info!(
            %cluster,
            kind = %entry.kind,
            name = %entry.name,
            namespace = %entry.namespace,
            partition = %entry.partition,
            "config entry written"
        );
    }

    let wanted: BTreeSet<EntryKey> = desired.iter().map(ConfigEntry::key).collect();
    let mut kinds: BTreeSet<&str> = DELETION_ORDER.iter().copied().collect();
    kinds.extend(desired.iter().map(|e| e.kind.as_str()));

    let mut stale = Vec::new();
    for scope in scopes(topology, cluster, config.tenancy.enabled) {
        for kind in &kinds {
            let observed = client
                .config_entries_list(kind, &scope)
                .await
                .map_err(|e| BootstrapError::api(format!("list {kind} entries in {cluster}"), e))?;
            stale.extend(
                observed
                    .iter()
                    .map(ConfigEntry::key)
                    .filter(|key| !wanted.contains(key)),
            );
        }
    }
    stale.sort_by(|a, b| a.deletion_sort_key().cmp(&b.deletion_sort_key()));
    stale.dedup();

    for key in &stale {
        let scope = if config.tenancy.enabled {
            Tenancy::new(&key.partition, &key.namespace)
        } else {
            Tenancy::none()
        };
        client
            .config_entry_delete(&key.kind, &key.name, &scope)
            .await
            .map_err(|e| BootstrapError::api(format!("delete config entry {key} in {cluster}"), e))?;
        info!(
            %cluster,
            kind = %key.kind,
            name = %key.name,
            namespace = %key.namespace,
            partition = %key.partition,
            "stale config entry deleted"
        );
    }

    debug!(%cluster, written = desired.len(), deleted = stale.len(), "config entries reconciled");
    Ok(())
}
