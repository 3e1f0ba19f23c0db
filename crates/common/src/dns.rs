//! Mesh DNS table and authoritative responder
//!
//! The table is rebuilt wholesale from each desired state and published by
//! swapping an `Arc`, so a query always sees one complete table.
//!
//! Unknown names answer SERVFAIL rather than NXDOMAIN: the peer set changes on
//! every reconciliation and a resolver must not cache a negative answer.

use crate::types::DesiredState;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

/// TTL of every answer
pub const ANSWER_TTL: u32 = 300;

/// Name and reverse-lookup index for one desired state
#[derive(Debug, Clone, Default)]
pub struct DnsTable {
    names: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
}

/// Distinct peer endpoint IPs seen in the desired state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerTable {
    servers: BTreeSet<String>,
}

/// Reverse lookup label for an IPv4 address
pub fn reverse_label(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa", d, c, b, a)
}

/// Parse `10.0.0.1/24` or a bare address
fn parse_address(address: &str) -> Option<IpAddr> {
    address.trim().parse::<IpNetwork>().ok().map(|n| n.ip())
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

impl DnsTable {
    /// Build the table for the local host.
    ///
    /// The self host of each mesh is always recorded; other hosts only when
    /// enabled. Meshes without a self host contribute nothing.
    pub fn build(state: &DesiredState, host_id: &str) -> (Self, ServerTable) {
        let mut table = Self::default();
        let mut servers = ServerTable::default();

        for mesh in &state.config {
            let Ok(view) = mesh.split(host_id) else {
                debug!("No self host in mesh {}, not serving its names", mesh.mesh_name);
                continue;
            };

            table.insert(&view.self_host.name, &view.self_host.current.address);

            for peer in view.peers.iter().filter(|p| p.enable) {
                table.insert(&peer.name, &peer.current.address);
                if let Some(ip) = peer.current.endpoint_ip() {
                    servers.servers.insert(ip.to_string());
                }
            }
        }

        (table, servers)
    }

    /// Record addresses for a name, keeping first-seen order and no duplicates
    pub fn insert(&mut self, name: &str, addresses: &[String]) {
        let name = normalize(name);
        if name.is_empty() {
            return;
        }

        let entry = self.names.entry(name.clone()).or_default();
        for address in addresses {
            if entry.contains(address) {
                continue;
            }
            entry.push(address.clone());

            if let Some(IpAddr::V4(v4)) = parse_address(address) {
                let names = self.reverse.entry(reverse_label(v4)).or_default();
                if !names.contains(&name) {
                    names.push(name.clone());
                }
            }
        }
    }

    /// Addresses recorded for a name
    pub fn lookup(&self, name: &str) -> Option<&[String]> {
        self.names.get(&normalize(name)).map(Vec::as_slice)
    }

    /// First name recorded for a reverse label
    pub fn reverse_lookup(&self, label: &str) -> Option<&str> {
        self.reverse
            .get(&normalize(label))
            .and_then(|names| names.first())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Sorted list of every name, for diagnostics
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Answer a query against this table
    pub fn answer<R: Rng + ?Sized>(&self, request: &Message, rng: &mut R) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired());

        if request.op_code() != OpCode::Query {
            response.set_response_code(ResponseCode::NotImp);
            return response;
        }

        let Some(query) = request.queries().first() else {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        };
        response.add_query(query.clone());

        let qname = query.name().clone();
        let name = normalize(&qname.to_ascii());

        match query.query_type() {
            RecordType::PTR => match self.reverse_lookup(&name) {
                Some(target) => match Name::from_ascii(format!("{}.", target)) {
                    Ok(target) => {
                        response.add_answer(Record::from_rdata(
                            qname,
                            ANSWER_TTL,
                            RData::PTR(PTR(target)),
                        ));
                        response.set_authoritative(true);
                    }
                    Err(e) => {
                        debug!("Cannot encode PTR target {}: {}", target, e);
                        response.set_response_code(ResponseCode::ServFail);
                    }
                },
                None => {
                    response.set_response_code(ResponseCode::ServFail);
                }
            },
            qtype => match self.lookup(&name) {
                Some(addresses) => {
                    for ip in rotate(addresses, rng) {
                        let rdata = match (qtype, ip) {
                            (RecordType::A, IpAddr::V4(v4)) => RData::A(A(v4)),
                            (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(v6)),
                            _ => continue,
                        };
                        response.add_answer(Record::from_rdata(qname.clone(), ANSWER_TTL, rdata));
                    }
                    response.set_authoritative(true);
                }
                None => {
                    response.set_response_code(ResponseCode::ServFail);
                }
            },
        }

        response
    }
}

/// Parsed addresses in round-robin order starting at a random offset
fn rotate<R: Rng + ?Sized>(addresses: &[String], rng: &mut R) -> Vec<IpAddr> {
    if addresses.is_empty() {
        return Vec::new();
    }
    let offset = rng.gen_range(0..addresses.len());
    (0..addresses.len())
        .filter_map(|i| parse_address(&addresses[(offset + i) % addresses.len()]))
        .collect()
}

impl ServerTable {
    pub fn contains(&self, ip: &str) -> bool {
        self.servers.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(String::as_str)
    }
}

/// Addresses the DNS service should listen on: the addresses of every
/// enabled self host, prefix stripped
pub fn listen_addresses(state: &DesiredState, host_id: &str) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for mesh in &state.config {
        let Some(me) = mesh.self_host(host_id) else {
            continue;
        };
        if !me.enable {
            continue;
        }
        for ip in me.current.address.iter().filter_map(|a| parse_address(a)) {
            if !out.contains(&ip) {
                out.push(ip);
            }
        }
    }
    out
}

/// DNS and server tables built from the same desired state
#[derive(Debug, Default)]
pub struct DnsSnapshot {
    pub table: Arc<DnsTable>,
    pub servers: Arc<ServerTable>,
}

/// Shared snapshot of both tables, swapped as one
#[derive(Debug, Default)]
pub struct DnsHandle {
    current: RwLock<Arc<DnsSnapshot>>,
}

impl DnsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild both tables from a desired state and publish them
    pub fn rebuild(&self, state: &DesiredState, host_id: &str) {
        let (table, servers) = DnsTable::build(state, host_id);
        debug!("DNS table rebuilt: {} names, {} servers", table.len(), servers.len());
        self.publish(table, servers);
    }

    /// Replace the published tables in one swap
    pub fn publish(&self, table: DnsTable, servers: ServerTable) {
        let snapshot = DnsSnapshot {
            table: Arc::new(table),
            servers: Arc::new(servers),
        };
        *self.current.write() = Arc::new(snapshot);
    }

    /// Both tables as last published
    pub fn snapshot(&self) -> Arc<DnsSnapshot> {
        self.current.read().clone()
    }

    /// Current DNS table
    pub fn table(&self) -> Arc<DnsTable> {
        self.snapshot().table.clone()
    }

    /// Current server table
    pub fn servers(&self) -> Arc<ServerTable> {
        self.snapshot().servers.clone()
    }
}
