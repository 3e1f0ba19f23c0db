//! Mesh DNS listeners and the query reporter
//!
//! One UDP listener per self-host address. Listeners bind in the background
//! and are re-requested after every reconciliation, so an address that only
//! appears once its tunnel is up gets picked up on a later pass.

use hickory_proto::op::Message;
use meshagent_common::DnsHandle;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bind attempts per listener request
const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(2);
const RECV_MAX_FAILURES: u32 = 10;
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pending query reports before new ones are dropped
const REPORT_QUEUE: usize = 256;

struct Listener {
    task: JoinHandle<()>,
    bound: Arc<Mutex<Option<SocketAddr>>>,
}

/// UDP front end for the shared DNS table
pub struct DnsServer {
    table: Arc<DnsHandle>,
    port: u16,
    reporter: Option<QueryReporter>,
    listeners: Mutex<HashMap<IpAddr, Listener>>,
    cancel: CancellationToken,
}

impl DnsServer {
    pub fn new(
        table: Arc<DnsHandle>,
        port: u16,
        reporter: Option<QueryReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            table,
            port,
            reporter,
            listeners: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Make the set of listeners match `addresses`.
    ///
    /// Addresses with a live listener are left alone, dead ones are retried,
    /// listeners for addresses no longer wanted are stopped.
    pub fn ensure_listeners(&self, addresses: &[IpAddr]) {
        let mut listeners = self.listeners.lock();

        listeners.retain(|ip, listener| {
            let keep = addresses.contains(ip);
            if !keep {
                info!("Stopping DNS listener on {}", ip);
                listener.task.abort();
            }
            keep
        });

        for &ip in addresses {
            if listeners.get(&ip).is_some_and(|l| !l.task.is_finished()) {
                continue;
            }

            let bound = Arc::new(Mutex::new(None));
            let task = tokio::spawn(listen(
                SocketAddr::new(ip, self.port),
                self.table.clone(),
                self.reporter.clone(),
                bound.clone(),
                self.cancel.clone(),
            ));
            listeners.insert(ip, Listener { task, bound });
        }
    }

    /// Addresses currently being served
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let listeners = self.listeners.lock();
        let mut addrs: Vec<SocketAddr> = listeners
            .values()
            .filter(|l| !l.task.is_finished())
            .filter_map(|l| *l.bound.lock())
            .collect();
        addrs.sort();
        addrs
    }

    /// Stop every listener
    pub fn shutdown(&self) {
        for (_, listener) in self.listeners.lock().drain() {
            listener.task.abort();
        }
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Pause after `failures` consecutive receive errors; None once the socket
/// should be given up and respawned by the next `ensure_listeners`
fn recv_retry_delay(failures: u32) -> Option<Duration> {
    (failures < RECV_MAX_FAILURES).then(|| RECV_RETRY_DELAY * failures)
}

async fn listen(
    addr: SocketAddr,
    table: Arc<DnsHandle>,
    reporter: Option<QueryReporter>,
    bound: Arc<Mutex<Option<SocketAddr>>>,
    cancel: CancellationToken,
) {
    let mut attempt = 0;
    let socket = loop {
        attempt += 1;
        match bind_udp(addr).and_then(UdpSocket::from_std) {
            Ok(socket) => break socket,
            Err(e) if attempt < BIND_ATTEMPTS => {
                debug!("DNS bind {} attempt {} failed: {}", addr, attempt, e);
            }
            Err(e) => {
                warn!("Giving up on DNS listener {} for now: {}", addr, e);
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(BIND_RETRY_DELAY) => {}
        }
    };

    let local = socket.local_addr().unwrap_or(addr);
    *bound.lock() = Some(local);
    info!("DNS listening on {}", local);

    let mut buf = vec![0u8; 4096];
    let mut failures = 0;
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => {
                    failures = 0;
                    r
                }
                Err(e) => {
                    failures += 1;
                    let Some(delay) = recv_retry_delay(failures) else {
                        warn!("DNS listener {} failing, stopping until next reconciliation: {}", local, e);
                        break;
                    };
                    debug!("DNS recv on {} failed: {}", local, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            },
        };

        let Some(response) = handle_packet(&table, reporter.as_ref(), &buf[..len]) else {
            continue;
        };
        if let Err(e) = socket.send_to(&response, peer).await {
            debug!("DNS reply to {} failed: {}", peer, e);
        }
    }

    debug!("DNS listener {} stopped", local);
}

/// Decode, answer and encode one datagram. Undecodable input yields nothing.
pub fn handle_packet(
    table: &DnsHandle,
    reporter: Option<&QueryReporter>,
    packet: &[u8],
) -> Option<Vec<u8>> {
    let request = match Message::from_vec(packet) {
        Ok(m) => m,
        Err(e) => {
            debug!("Dropping undecodable DNS packet: {}", e);
            return None;
        }
    };

    if let Some(reporter) = reporter {
        for query in request.queries() {
            reporter.report(format!("{} {}", query.name(), query.query_type()));
        }
    }

    let response = table.table().answer(&request, &mut rand::thread_rng());
    match response.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode DNS response: {}", e);
            None
        }
    }
}

/// Fire-and-forget sink for query reports
#[derive(Debug, Clone)]
pub struct QueryReporter {
    tx: mpsc::Sender<String>,
}

impl QueryReporter {
    /// Reporter plus the receiving end, for callers that ship reports themselves
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Reporter sending every line to a multicast group
    pub fn spawn(group: SocketAddr, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (reporter, rx) = Self::channel(REPORT_QUEUE);
        (reporter, tokio::spawn(send_reports(group, rx, cancel)))
    }

    /// Queue a report. Never blocks; a full queue drops the line.
    pub fn report(&self, line: String) {
        if let Err(e) = self.tx.try_send(line) {
            debug!(target: "meshagent::dns_report", "Query report dropped: {}", e);
        }
    }
}

fn report_socket(group: SocketAddr) -> std::io::Result<UdpSocket> {
    let local = match group {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    if group.is_ipv4() {
        socket.set_multicast_ttl_v4(1)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

async fn send_reports(group: SocketAddr, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) {
    let socket = match report_socket(group) {
        Ok(s) => s,
        Err(e) => {
            warn!(target: "meshagent::dns_report", "Query reports disabled: {}", e);
            return;
        }
    };

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        if let Err(e) = socket.send_to(line.as_bytes(), group).await {
            debug!(target: "meshagent::dns_report", "Query report to {} failed: {}", group, e);
        }
    }
}
