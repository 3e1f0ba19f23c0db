//! Core types for meshagent
//!
//! These mirror the control server's JSON wire format. Every field defaults so
//! that older or newer servers with missing/extra fields still decode.

use serde::{Deserialize, Serialize};

/// Desired state pushed by the control server: every mesh this node belongs to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    pub id: String,
    pub config: Vec<MeshConfig>,
}

/// One mesh and all of its hosts, self included
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    pub mesh_name: String,
    pub mesh_id: String,
    pub hosts: Vec<Host>,
}

/// A host record as declared by the control server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub host_group: String,
    pub api_key: String,
    pub name: String,
    pub email: String,
    pub mesh_id: String,
    pub mesh_name: String,
    pub enable: bool,
    pub created: String,
    pub updated: String,
    pub current: HostSettings,
}

/// Tunnel settings snapshot for a host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostSettings {
    pub address: Vec<String>,
    pub dns: Vec<String>,
    pub listen_port: u16,
    pub endpoint: String,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    pub public_key: String,
    pub private_key: String,
    pub preshared_key: String,
    pub persistent_keepalive: u32,
    pub mtu: u32,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    #[serde(rename = "upnp")]
    pub upnp: bool,
}

/// A mesh split into the local host and its peers
#[derive(Debug, Clone)]
pub struct MeshView {
    pub mesh_name: String,
    pub self_host: Host,
    pub peers: Vec<Host>,
}

impl DesiredState {
    /// Decode a desired state from the raw response body
    pub fn from_slice(body: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Find a mesh by name
    pub fn mesh(&self, name: &str) -> Option<&MeshConfig> {
        self.config.iter().find(|m| m.mesh_name == name)
    }

    /// Meshes present in `self` but absent from `next`
    pub fn removed_meshes<'a>(&'a self, next: &DesiredState) -> Vec<&'a MeshConfig> {
        self.config
            .iter()
            .filter(|m| next.mesh(&m.mesh_name).is_none())
            .collect()
    }

    /// Every host record across all meshes that belongs to the given host group
    pub fn hosts_in_group<'a>(&'a self, host_id: &'a str) -> impl Iterator<Item = &'a Host> + 'a {
        self.config
            .iter()
            .flat_map(|m| m.hosts.iter())
            .filter(move |h| h.host_group == host_id)
    }
}

impl MeshConfig {
    /// Index of the local host within this mesh
    pub fn self_index(&self, host_id: &str) -> Option<usize> {
        self.hosts.iter().position(|h| h.host_group == host_id)
    }

    /// The local host record, if present
    pub fn self_host(&self, host_id: &str) -> Option<&Host> {
        self.self_index(host_id).map(|i| &self.hosts[i])
    }

    /// Split the host list into self and peers.
    ///
    /// Only the first host of the group is treated as self; the returned peer
    /// list never contains it.
    pub fn split(&self, host_id: &str) -> crate::Result<MeshView> {
        let index = self.self_index(host_id).ok_or_else(|| crate::Error::SelfHostMissing {
            mesh: self.mesh_name.clone(),
            host_id: host_id.to_string(),
        })?;

        let mut peers = self.hosts.clone();
        let self_host = peers.remove(index);

        Ok(MeshView {
            mesh_name: self.mesh_name.clone(),
            self_host,
            peers,
        })
    }
}

impl HostSettings {
    /// Endpoint IP with the port stripped; `[v6]:port` is unwrapped
    pub fn endpoint_ip(&self) -> Option<&str> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return None;
        }
        if let Some(rest) = endpoint.strip_prefix('[') {
            return rest.split(']').next().filter(|s| !s.is_empty());
        }
        match endpoint.rsplit_once(':') {
            Some((ip, _)) if !ip.contains(':') => Some(ip),
            Some(_) => Some(endpoint),
            None => Some(endpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, group: &str) -> Host {
        Host {
            name: name.to_string(),
            host_group: group.to_string(),
            enable: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_wire_format() {
        let body = br#"{
            "id": "m1",
            "config": [{
                "meshName": "office",
                "hosts": [{
                    "id": "h1", "hostGroup": "g1", "apiKey": "k", "name": "alpha",
                    "enable": true, "unknownField": 7,
                    "current": {
                        "address": ["10.0.0.1/24"],
                        "allowedIPs": ["10.0.0.1/32"],
                        "publicKey": "pub", "listenPort": 51820, "upnp": true
                    }
                }]
            }]
        }"#;

        let state = DesiredState::from_slice(body).unwrap();
        assert_eq!(state.config.len(), 1);
        let h = &state.config[0].hosts[0];
        assert_eq!(h.host_group, "g1");
        assert_eq!(h.api_key, "k");
        assert_eq!(h.current.allowed_ips, vec!["10.0.0.1/32"]);
        assert_eq!(h.current.listen_port, 51820);
        assert!(h.current.upnp);
        assert!(h.current.private_key.is_empty());
    }

    #[test]
    fn test_malformed_body_is_error() {
        assert!(DesiredState::from_slice(b"{not json").is_err());
    }

    #[test]
    fn test_split_removes_self() {
        let mesh = MeshConfig {
            mesh_name: "office".to_string(),
            hosts: vec![host("a", "peer-1"), host("me", "local"), host("b", "peer-2")],
            ..Default::default()
        };

        let view = mesh.split("local").unwrap();
        assert_eq!(view.self_host.name, "me");
        assert_eq!(view.peers.len(), 2);
        assert!(view.peers.iter().all(|p| p.host_group != "local"));
    }

    #[test]
    fn test_split_without_self() {
        let mesh = MeshConfig {
            mesh_name: "office".to_string(),
            hosts: vec![host("a", "peer-1")],
            ..Default::default()
        };

        let err = mesh.split("local").unwrap_err();
        assert!(matches!(err, crate::Error::SelfHostMissing { .. }));
    }

    #[test]
    fn test_removed_meshes() {
        let mesh = |name: &str| MeshConfig {
            mesh_name: name.to_string(),
            ..Default::default()
        };
        let prev = DesiredState {
            config: vec![mesh("a"), mesh("b")],
            ..Default::default()
        };
        let next = DesiredState {
            config: vec![mesh("b"), mesh("c")],
            ..Default::default()
        };

        let removed: Vec<_> = prev.removed_meshes(&next).iter().map(|m| m.mesh_name.clone()).collect();
        assert_eq!(removed, vec!["a"]);
    }

    #[test]
    fn test_endpoint_ip() {
        let mut s = HostSettings::default();
        assert_eq!(s.endpoint_ip(), None);
        s.endpoint = "203.0.113.7:51820".to_string();
        assert_eq!(s.endpoint_ip(), Some("203.0.113.7"));
        s.endpoint = "[2001:db8::1]:51820".to_string();
        assert_eq!(s.endpoint_ip(), Some("2001:db8::1"));
        s.endpoint = "vpn.example.com".to_string();
        assert_eq!(s.endpoint_ip(), Some("vpn.example.com"));
    }
}
