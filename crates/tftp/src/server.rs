//! TFTP Server Implementation
//!
//! The dispatcher owns the listening socket. It reads one datagram at a time,
//! starts a [`Session`] task for every valid RRQ and routes ACKs to the
//! session registered for the sending address. It never waits on a transfer.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::protocol::{TftpErrorCode, TftpOpcode, build_error, get_opcode, get_tftp_opcode, parse_ack, parse_rrq};
use crate::registry::SessionRegistry;
use crate::session::{Outgoing, ReadHandler, Session, SessionContext, Timeouts};

/// Conventional TFTP listen address
pub const DEFAULT_BIND: &str = "0.0.0.0:69";

/// Smallest datagram worth decoding: opcode plus two more bytes
const MIN_DATAGRAM: usize = 4;

const RECV_BUFFER: usize = 2048;

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub timeouts: Timeouts,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND.to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Main TFTP server
pub struct TftpServer<H> {
    config: TftpServerConfig,
    handler: Arc<H>,
    registry: SessionRegistry,
    socket: Option<Arc<UdpSocket>>,
}

impl<H: ReadHandler> TftpServer<H> {
    /// Create a server answering read requests with `handler`
    pub fn new(config: TftpServerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            registry: SessionRegistry::new(),
            socket: None,
        }
    }

    /// Create a server with the default configuration
    pub fn with_defaults(handler: H) -> Self {
        Self::new(TftpServerConfig::default(), handler)
    }

    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TftpServerConfig {
        &mut self.config
    }

    /// Registry of the transfers currently in progress
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Get the local address the server is bound to (if bound)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the listening socket without serving yet
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = tokio::net::lookup_host(&self.config.bind_address)
            .await
            .with_context(|| format!("Invalid bind address: {}", self.config.bind_address))?
            .next()
            .ok_or_else(|| anyhow!("Bind address {} did not resolve", self.config.bind_address))?;

        let socket = bind_socket(addr)?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;
        tracing::info!("TFTP server listening on {}", local_addr);

        self.socket = Some(Arc::new(socket));
        Ok(local_addr)
    }

    /// Bind if needed, then run the receive loop. Returns only if the socket
    /// cannot be set up.
    pub async fn run(&mut self) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        self.serve().await
    }

    async fn serve(&self) -> Result<()> {
        let socket = self
            .socket
            .clone()
            .ok_or_else(|| anyhow!("Server must be bound before serving"))?;

        let (outbox, outgoing) = mpsc::unbounded_channel();
        tokio::spawn(write_datagrams(socket.clone(), outgoing));

        let dispatcher = Dispatcher {
            ctx: SessionContext {
                registry: self.registry.clone(),
                outbox,
                timeouts: self.config.timeouts,
            },
            handler: self.handler.clone(),
        };

        let mut buffer = [0u8; RECV_BUFFER];

        loop {
            let (len, peer) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Error receiving TFTP datagram: {}", e);
                    continue;
                }
            };
            tracing::trace!("Received {} bytes from {}", len, peer);

            if let Err(e) = dispatcher.handle_datagram(&buffer[..len], peer) {
                tracing::debug!("Dropped datagram from {}: {:#}", peer, e);
            }
        }
    }
}

/// Routes decoded datagrams to new or existing sessions
struct Dispatcher<H> {
    ctx: SessionContext,
    handler: Arc<H>,
}

impl<H: ReadHandler> Dispatcher<H> {
    fn handle_datagram(&self, packet: &[u8], peer: SocketAddr) -> Result<()> {
        if packet.len() < MIN_DATAGRAM {
            return Err(anyhow!("datagram too short ({} bytes)", packet.len()));
        }

        match get_tftp_opcode(packet) {
            Some(TftpOpcode::ReadRequest) => self.handle_read_request(packet, peer),
            Some(TftpOpcode::Acknowledgment) => self.handle_ack(packet, peer),
            opcode => {
                tracing::debug!(
                    "Unsupported opcode {:?} ({:?}) from {}",
                    get_opcode(packet),
                    opcode.map(TftpOpcode::name),
                    peer
                );
                self.reply_error(peer, TftpErrorCode::IllegalOpcode, "Unknown opcode")
            }
        }
    }

    fn handle_read_request(&self, packet: &[u8], peer: SocketAddr) -> Result<()> {
        let request = parse_rrq(packet).context("malformed RRQ")?;
        tracing::info!(
            "RRQ for '{}' in {} mode from {} (options: {:?})",
            request.filename,
            request.mode,
            peer,
            request.options
        );

        match Session::open(peer, request, &self.ctx) {
            Ok(session) => {
                tokio::spawn(session.run(self.handler.clone()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Rejecting RRQ from {}: {}", peer, e);
                self.reply_error(peer, TftpErrorCode::OptionNegotiationFailed, &e.to_string())
            }
        }
    }

    fn handle_ack(&self, packet: &[u8], peer: SocketAddr) -> Result<()> {
        let block = parse_ack(packet)?;

        if self.ctx.registry.deliver_ack(peer, block) {
            return Ok(());
        }

        tracing::debug!("ACK {} from {} matches no transfer", block, peer);
        self.reply_error(peer, TftpErrorCode::UnknownTransfer, "Unknown transfer")
    }

    fn reply_error(&self, peer: SocketAddr, code: TftpErrorCode, message: &str) -> Result<()> {
        self.ctx
            .outbox
            .send(Outgoing {
                peer,
                packet: build_error(code, message),
            })
            .map_err(|_| anyhow!("socket writer has stopped"))
    }
}

/// Send queued datagrams until every sender is gone
async fn write_datagrams(socket: Arc<UdpSocket>, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = outgoing.recv().await {
        if let Err(e) = socket.send_to(&out.packet, out.peer).await {
            tracing::warn!("Failed to send {} bytes to {}: {}", out.packet.len(), out.peer, e);
        }
    }
}

/// Create the listening socket for `addr`
fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).context("Failed to create socket")?;

    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR on TFTP socket")?;

    if addr.is_ipv6()
        && let Err(e) = socket.set_only_v6(false)
    {
        tracing::warn!("Failed to accept IPv4 on {}: {}", addr, e);
    }

    socket
        .set_nonblocking(true)
        .context("Failed to set socket to non-blocking mode")?;

    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind TFTP server to {}", addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("Failed to convert to Tokio socket")
}

/// Run a TFTP server on `bind_address` until it fails
///
/// This is a convenience function that creates and runs a TFTP server with
/// default timeouts.
pub async fn run_tftp_server<H: ReadHandler>(bind_address: String, handler: H) -> Result<()> {
    let config = TftpServerConfig {
        bind_address,
        ..Default::default()
    };
    TftpServer::new(config, handler).run().await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::protocol::{build_ack, build_data, build_rrq, parse_error, parse_oack};

    struct Counting(AtomicUsize);

    impl ReadHandler for Counting {
        async fn handle(&self, session: &mut Session) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            session.close().await?;
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    fn dispatcher() -> (Dispatcher<Counting>, UnboundedReceiver<Outgoing>, SessionRegistry) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new();
        let dispatcher = Dispatcher {
            ctx: SessionContext {
                registry: registry.clone(),
                outbox,
                timeouts: Timeouts::default(),
            },
            handler: Arc::new(Counting(AtomicUsize::new(0))),
        };
        (dispatcher, rx, registry)
    }

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_tftp_server_config_default() {
        let config = TftpServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:69");
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[tokio::test]
    async fn test_short_datagram_is_dropped() {
        let (dispatcher, mut rx, registry) = dispatcher();

        assert!(dispatcher.handle_datagram(&[0, 4, 0], peer()).is_err());
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_opcode_gets_illegal_opcode_error() {
        let (dispatcher, mut rx, _registry) = dispatcher();

        // WRQ is recognized on the wire but not served
        let mut wrq = build_rrq("upload.bin", "octet", &BTreeMap::new());
        wrq[1] = TftpOpcode::WriteRequest.as_u16() as u8;
        dispatcher.handle_datagram(&wrq, peer()).unwrap();
        dispatcher.handle_datagram(&build_data(1, b"zz"), peer()).unwrap();
        dispatcher.handle_datagram(&[0, 42, 0, 0], peer()).unwrap();

        for _ in 0..3 {
            let out = rx.recv().await.unwrap();
            assert_eq!(out.peer, peer());
            assert_eq!(parse_error(&out.packet).unwrap(), (4, "Unknown opcode".to_string()));
        }
    }

    #[tokio::test]
    async fn test_ack_for_unknown_peer() {
        let (dispatcher, mut rx, _registry) = dispatcher();

        dispatcher.handle_datagram(&build_ack(1), peer()).unwrap();

        let out = rx.try_recv().unwrap();
        assert_eq!(parse_error(&out.packet).unwrap(), (5, "Unknown transfer".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rrq_registers_session_and_routes_acks() {
        let (dispatcher, mut rx, registry) = dispatcher();

        let rrq = build_rrq("foo.txt", "octet", &options(&[("blksize", "1024"), ("tsize", "0")]));
        dispatcher.handle_datagram(&rrq, peer()).unwrap();
        assert!(registry.contains(&peer()));

        let oack = rx.recv().await.unwrap();
        assert_eq!(parse_oack(&oack.packet).unwrap(), options(&[("blksize", "1024")]));

        dispatcher.handle_datagram(&build_ack(0), peer()).unwrap();
        let data = rx.recv().await.unwrap();
        assert_eq!(data.packet, build_data(1, &[]));

        dispatcher.handle_datagram(&build_ack(1), peer()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_empty());
        assert_eq!(dispatcher.handler.0.load(Ordering::SeqCst), 1);

        // Transfer is over, so a late ack is unknown
        dispatcher.handle_datagram(&build_ack(1), peer()).unwrap();
        let out = rx.recv().await.unwrap();
        assert_eq!(parse_error(&out.packet).unwrap().0, 5);
    }

    #[tokio::test]
    async fn test_invalid_blksize_rejected_before_session() {
        let (dispatcher, mut rx, registry) = dispatcher();

        let rrq = build_rrq("foo.txt", "octet", &options(&[("blksize", "4")]));
        dispatcher.handle_datagram(&rrq, peer()).unwrap();

        let out = rx.try_recv().unwrap();
        assert_eq!(parse_error(&out.packet).unwrap().0, 8);
        assert!(registry.is_empty());
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.handler.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_rrq_is_dropped() {
        let (dispatcher, mut rx, registry) = dispatcher();

        let mut rrq = build_rrq("foo.txt", "octet", &BTreeMap::new());
        rrq.extend_from_slice(b"blksize\0");

        assert!(dispatcher.handle_datagram(&rrq, peer()).is_err());
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_server_bind() {
        let config = TftpServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let mut server = TftpServer::new(config, Counting(AtomicUsize::new(0)));
        assert!(server.local_addr().is_none());

        let addr = server.bind().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_server_bind_rejects_garbage_address() {
        let config = TftpServerConfig {
            bind_address: "not an address".to_string(),
            ..Default::default()
        };
        let mut server = TftpServer::new(config, Counting(AtomicUsize::new(0)));
        assert!(server.bind().await.is_err());
    }
}
