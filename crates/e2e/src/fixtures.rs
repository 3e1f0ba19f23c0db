//! Desired state builders

use meshagent_common::{DesiredState, Host, MeshConfig};

/// Host group used for the agent under test
pub const LOCAL_GROUP: &str = "local-group";

/// API key the fake server accepts by default
pub const LOCAL_API_KEY: &str = "key-one";

/// A host record with one address and a public key
pub fn host(name: &str, group: &str, address: &str, public_key: &str) -> Host {
    let now = chrono::Utc::now().to_rfc3339();
    let mut h = Host {
        id: uuid::Uuid::new_v4().to_string(),
        host_group: group.to_string(),
        name: name.to_string(),
        email: format!("{}@example.com", name),
        enable: true,
        created: now.clone(),
        updated: now,
        ..Default::default()
    };
    h.current.address = vec![address.to_string()];
    h.current.public_key = public_key.to_string();
    h.current.listen_port = 51820;
    h
}

/// The local host of a mesh, carrying the default API key
pub fn local_host(address: &str, public_key: &str, private_key: &str) -> Host {
    let mut h = host("me", LOCAL_GROUP, address, public_key);
    h.api_key = LOCAL_API_KEY.to_string();
    h.current.private_key = private_key.to_string();
    h
}

/// Endpoint every fixture peer advertises
pub const PEER_ENDPOINT: &str = "203.0.113.10:51820";

/// A peer routing the given subnets
pub fn peer(name: &str, address: &str, public_key: &str, routes: &[&str]) -> Host {
    let mut h = host(name, &format!("{}-group", name), address, public_key);
    h.current.allowed_ips = routes.iter().map(|r| r.to_string()).collect();
    h.current.endpoint = PEER_ENDPOINT.to_string();
    h.current.persistent_keepalive = 25;
    h
}

/// Mesh with every host's mesh fields filled in
pub fn mesh(name: &str, hosts: Vec<Host>) -> MeshConfig {
    let mesh_id = uuid::Uuid::new_v4().to_string();
    let hosts = hosts
        .into_iter()
        .map(|mut h| {
            h.mesh_name = name.to_string();
            h.mesh_id = mesh_id.clone();
            h
        })
        .collect();
    MeshConfig {
        mesh_name: name.to_string(),
        mesh_id,
        hosts,
    }
}

/// Serialized desired state, as the control server sends it
pub fn body(meshes: Vec<MeshConfig>) -> Vec<u8> {
    let state = DesiredState {
        id: uuid::Uuid::new_v4().to_string(),
        config: meshes,
    };
    serde_json::to_vec(&state).unwrap_or_default()
}
