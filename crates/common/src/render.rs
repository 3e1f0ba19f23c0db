//! Tunnel configuration rendering
//!
//! The reconciler only needs a deterministic byte blob per mesh; the default
//! renderer emits a wg-quick INI file.

use crate::types::Host;
use crate::{Error, Result};
use std::fmt::Write;

/// Renders the tunnel configuration for the local host and its peers.
///
/// Implementations must be deterministic: identical input must yield
/// identical bytes, since the output is diffed byte-for-byte.
pub trait TunnelRenderer: Send + Sync {
    fn render(&self, self_host: &Host, peers: &[Host]) -> Result<Vec<u8>>;
}

/// wg-quick configuration renderer
#[derive(Debug, Clone, Default)]
pub struct WgQuickRenderer;

fn line(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{} = {}", key, value);
}

fn line_if(out: &mut String, key: &str, value: &str) {
    if !value.is_empty() {
        line(out, key, value);
    }
}

fn header(out: &mut String, host: &Host) {
    let _ = writeln!(
        out,
        "# {} / {} / Updated: {} / Created: {}",
        host.name, host.email, host.updated, host.created
    );
}

impl TunnelRenderer for WgQuickRenderer {
    fn render(&self, self_host: &Host, peers: &[Host]) -> Result<Vec<u8>> {
        let current = &self_host.current;
        if current.private_key.is_empty() {
            return Err(Error::Render(format!(
                "no private key for host {}",
                self_host.name
            )));
        }

        let mut out = String::new();
        header(&mut out, self_host);
        out.push_str("[Interface]\n");
        for address in &current.address {
            line(&mut out, "Address", address);
        }
        line(&mut out, "PrivateKey", &current.private_key);
        if current.listen_port != 0 {
            line(&mut out, "ListenPort", current.listen_port);
        }
        if !current.dns.is_empty() {
            line(&mut out, "DNS", current.dns.join(", "));
        }
        if current.mtu != 0 {
            line(&mut out, "MTU", current.mtu);
        }
        line_if(&mut out, "PreUp", &current.pre_up);
        line_if(&mut out, "PostUp", &current.post_up);
        line_if(&mut out, "PreDown", &current.pre_down);
        line_if(&mut out, "PostDown", &current.post_down);

        // Peers without an endpoint are kept: they dial in to our listen port
        for peer in peers.iter().filter(|p| p.enable) {
            let settings = &peer.current;
            if settings.public_key.is_empty() {
                continue;
            }
            out.push('\n');
            header(&mut out, peer);
            out.push_str("[Peer]\n");
            line(&mut out, "PublicKey", &settings.public_key);
            line_if(&mut out, "PresharedKey", &settings.preshared_key);
            line(&mut out, "AllowedIPs", settings.allowed_ips.join(", "));
            line_if(&mut out, "Endpoint", &settings.endpoint);
            if settings.persistent_keepalive != 0 {
                line(&mut out, "PersistentKeepalive", settings.persistent_keepalive);
            }
        }

        Ok(out.into_bytes())
    }
}
