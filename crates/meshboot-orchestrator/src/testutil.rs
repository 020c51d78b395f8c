//! Shared fixtures for unit tests.

use std::sync::Arc;

use meshboot_api::fake::FakeMesh;
use meshboot_core::Topology;

use crate::clients::Clients;

pub const TWO_DC: &str = r#"
link_mode = "federation"

[[clusters]]
name = "dc1"
primary = true

[[clusters]]
name = "dc2"

[[nodes]]
cluster = "dc1"
name = "dc1-server1"
role = "server"
address = "10.0.1.11"

[[nodes]]
cluster = "dc1"
name = "dc1-server2"
role = "server"
address = "10.0.1.14"

[[nodes]]
cluster = "dc1"
name = "dc1-client1"
role = "agent"
address = "10.0.1.12"

[nodes.service]
name = "ping"

[nodes.service.upstream]
name = "pong"
datacenter = "dc2"

[[nodes]]
cluster = "dc1"
name = "dc1-mgw"
role = "mesh-gateway"
address = "10.0.1.13"

[[nodes]]
cluster = "dc2"
name = "dc2-server1"
role = "server"
address = "10.0.2.11"

[[nodes]]
cluster = "dc2"
name = "dc2-client1"
role = "agent"
address = "10.0.2.12"

[nodes.service]
name = "pong"
"#;

pub fn topology(toml: &str) -> Arc<Topology> {
    Arc::new(Topology::from_toml_str(toml).unwrap())
}

pub fn federation() -> (FakeMesh, Clients) {
    let topo = topology(TWO_DC);
    let mesh = FakeMesh::from_topology(&topo);
    let clients = Clients::new(Arc::new(mesh.clone()), topo);
    (mesh, clients)
}

pub fn peering() -> (FakeMesh, Clients) {
    let toml = TWO_DC
        .replace("link_mode = \"federation\"", "link_mode = \"peering\"")
        .replace("datacenter = \"dc2\"", "peer = \"dc2\"");
    let topo = topology(&toml);
    let mesh = FakeMesh::from_topology(&topo);
    let clients = Clients::new(Arc::new(mesh.clone()), topo);
    (mesh, clients)
}
