//! TFTP Transfer Session
//!
//! One [`Session`] drives one download: optional option negotiation (OACK and
//! ACK 0), then stop-and-wait DATA blocks fed by the application's
//! [`ReadHandler`], until the handler closes the session, reports an error, or
//! the client stops acknowledging.
//!
//! ```text
//!  Negotiating ──ACK(0)──▶ Transferring ──close()/write_error()──▶ Terminated
//!       │                                                              ▲
//!       └───────────────────── timeout ───────────────────────────────┘
//! ```
//!
//! Every send waits for the ack of exactly the block in flight. The packet is
//! resent each retransmission interval; once the time since the first send of
//! that block exceeds the request timeout the session terminates with
//! [`SessionError::TimedOut`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::options::{BlockSize, OptionError, TransferOptions};
use crate::protocol::{ReadRequest, TftpErrorCode, build_data, build_error, build_oack};
use crate::registry::{AckReceiver, Registration, SessionRegistry};

/// Retransmission and give-up intervals, shared by every session of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Time to wait for an ack before resending
    pub retransmission: Duration,
    /// Time since the first send of a block after which the transfer is abandoned
    pub request: Duration,
}

impl Timeouts {
    pub const DEFAULT_RETRANSMISSION: Duration = Duration::from_secs(1);

    /// Timeouts with the request timeout derived as four retransmission intervals
    pub fn new(retransmission: Duration) -> Self {
        Self {
            retransmission,
            request: retransmission * 4,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETRANSMISSION)
    }
}

/// Failures surfaced to a read handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Request already closed")]
    Closed,

    #[error("Request timed out")]
    TimedOut,

    #[error("Server is no longer sending datagrams")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// OACK sent or about to be sent, waiting for ACK 0
    Negotiating,
    /// Handler is producing DATA blocks
    Transferring,
    Terminated,
}

/// A datagram queued for the server socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub peer: SocketAddr,
    pub packet: Vec<u8>,
}

/// Queue drained by the server's socket writer
pub type Outbox = mpsc::UnboundedSender<Outgoing>;

/// Application callback producing the content of a read request
///
/// Called once per accepted request, after option negotiation succeeded. The
/// handler resolves [`Session::filename`] and [`Session::mode`], pushes bytes
/// with [`Session::write`] or [`Session::write_all`], then calls
/// [`Session::close`], or [`Session::write_error`] if the request cannot be
/// served.
///
/// A handler that returns without doing either gets its session closed for
/// it. Returning an error sends the error text to the client instead.
pub trait ReadHandler: Send + Sync + 'static {
    fn handle(&self, session: &mut Session) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// What every session of a server shares
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub registry: SessionRegistry,
    pub outbox: Outbox,
    pub timeouts: Timeouts,
}

enum WaitOutcome {
    Acked,
    Retransmit,
    DeadlineExceeded,
}

pub struct Session {
    peer: SocketAddr,
    filename: String,
    mode: String,
    options: TransferOptions,
    block_number: u16,
    buffer: Vec<u8>,
    state: SessionState,
    acks: AckReceiver,
    registration: Registration,
    ctx: SessionContext,
}

impl Session {
    /// Validate the request's options and register a session for `peer`.
    ///
    /// Nothing is registered if an option is rejected.
    pub(crate) fn open(peer: SocketAddr, request: ReadRequest, ctx: &SessionContext) -> Result<Self, OptionError> {
        let options = TransferOptions::negotiate(&request.options)?;
        let (registration, acks) = ctx.registry.insert(peer);

        let state = if options.needs_oack() {
            SessionState::Negotiating
        } else {
            SessionState::Transferring
        };

        Ok(Self {
            peer,
            filename: request.filename,
            mode: request.mode,
            buffer: Vec::with_capacity(options.block_size.get()),
            options,
            block_number: 1,
            state,
            acks,
            registration,
            ctx: ctx.clone(),
        })
    }

    /// Address of the client that sent the read request
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Transfer mode string as sent by the client
    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn block_size(&self) -> BlockSize {
        self.options.block_size
    }

    /// Number of the next DATA block to be sent
    pub fn block_number(&self) -> u16 {
        self.block_number
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Negotiate options, then hand the session to `handler`.
    pub(crate) async fn run<H: ReadHandler>(mut self, handler: Arc<H>) {
        if let Err(e) = self.negotiate().await {
            tracing::warn!("Option negotiation with {} for '{}' failed: {}", self.peer, self.filename, e);
            return;
        }

        tracing::info!(
            "Serving '{}' ({}) to {} with block size {}",
            self.filename,
            self.mode,
            self.peer,
            self.block_size()
        );

        let result = handler.handle(&mut self).await;

        match result {
            Ok(()) if self.is_terminated() => {}
            Ok(()) => {
                tracing::debug!("Handler for '{}' returned without closing; closing", self.filename);
                if let Err(e) = self.close().await {
                    tracing::warn!("Failed to finish '{}' for {}: {}", self.filename, self.peer, e);
                }
            }
            Err(e) => {
                tracing::warn!("Handler failed to serve '{}' to {}: {:#}", self.filename, self.peer, e);
                self.write_error(TftpErrorCode::Generic, &e.to_string());
            }
        }
    }

    /// Send the OACK and wait for ACK 0. Does nothing without accepted options.
    pub(crate) async fn negotiate(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Negotiating => {}
            SessionState::Transferring => return Ok(()),
            SessionState::Terminated => return Err(SessionError::Closed),
        }

        tracing::debug!("Sending OACK to {}: opts={:?}", self.peer, self.options.accepted);
        let oack = build_oack(&self.options.accepted);
        self.send_and_wait(&oack, 0).await?;

        self.state = SessionState::Transferring;
        Ok(())
    }

    /// Append as much of `data` as fits in the current block.
    ///
    /// A block that becomes full is sent before returning, which waits for
    /// its ack. Returns the number of bytes consumed; the caller passes the
    /// rest in a later call.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Closed);
        }

        let room = self.block_size().get() - self.buffer.len();
        let n = data.len().min(room);
        self.buffer.extend_from_slice(&data[..n]);

        if self.buffer.len() == self.block_size().get() {
            self.flush_block(false).await?;
        }

        Ok(n)
    }

    /// Write all of `data`, sending every block it completes.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), SessionError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Send the buffered bytes as the final block and end the transfer.
    ///
    /// The final block is sent even when empty, so a transfer whose length is
    /// a multiple of the block size still ends with a short block. Calling
    /// this on a terminated session does nothing.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Ok(());
        }

        let result = self.flush_block(true).await;
        if result.is_ok() {
            tracing::info!("Finished '{}' for {}", self.filename, self.peer);
        }
        self.terminate();
        result
    }

    /// Send one ERROR packet and end the transfer. Does nothing once terminated.
    pub fn write_error(&mut self, code: TftpErrorCode, message: &str) {
        if self.is_terminated() {
            return;
        }

        tracing::info!("Ending '{}' for {} with {}: {}", self.filename, self.peer, code, message);
        if let Err(e) = self.send(build_error(code, message)) {
            tracing::debug!("Error packet for {} not sent: {}", self.peer, e);
        }
        self.terminate();
    }

    async fn flush_block(&mut self, is_final: bool) -> Result<(), SessionError> {
        if self.buffer.is_empty() && !is_final {
            return Ok(());
        }
        debug_assert!(is_final || self.buffer.len() == self.block_size().get());

        let packet = build_data(self.block_number, &self.buffer);
        self.send_and_wait(&packet, self.block_number).await?;

        tracing::trace!("Block {} acknowledged by {}", self.block_number, self.peer);
        self.buffer.clear();
        self.block_number = self.block_number.wrapping_add(1);
        Ok(())
    }

    /// Send `packet` until the peer acks `block`, or terminate on timeout.
    async fn send_and_wait(&mut self, packet: &[u8], block: u16) -> Result<(), SessionError> {
        let started = Instant::now();

        loop {
            if let Err(e) = self.send(packet.to_vec()) {
                self.terminate();
                return Err(e);
            }

            match self.wait_for_ack(block, started).await {
                WaitOutcome::Acked => return Ok(()),
                WaitOutcome::Retransmit => {
                    tracing::debug!("No ack {} from {}; retransmitting", block, self.peer);
                }
                WaitOutcome::DeadlineExceeded => {
                    tracing::warn!(
                        "Transfer of '{}' to {} timed out waiting for ack {}",
                        self.filename,
                        self.peer,
                        block
                    );
                    self.terminate();
                    return Err(SessionError::TimedOut);
                }
            }
        }
    }

    /// Wait one retransmission interval for an ack of exactly `block`.
    async fn wait_for_ack(&mut self, block: u16, started: Instant) -> WaitOutcome {
        let tick = Instant::now() + self.ctx.timeouts.retransmission;

        loop {
            match time::timeout_at(tick, self.acks.changed()).await {
                Ok(Ok(())) => {
                    let acked = *self.acks.borrow_and_update();
                    if acked == Some(block) {
                        return WaitOutcome::Acked;
                    }
                    tracing::trace!("Ignoring ack {:?} from {} while waiting for {}", acked, self.peer, block);
                }
                Ok(Err(_)) => {
                    // Replaced in the registry; no ack can arrive any more
                    time::sleep_until(tick).await;
                    break;
                }
                Err(_) => break,
            }
        }

        if started.elapsed() > self.ctx.timeouts.request {
            WaitOutcome::DeadlineExceeded
        } else {
            WaitOutcome::Retransmit
        }
    }

    fn send(&self, packet: Vec<u8>) -> Result<(), SessionError> {
        self.ctx
            .outbox
            .send(Outgoing {
                peer: self.peer,
                packet,
            })
            .map_err(|_| SessionError::Disconnected)
    }

    fn terminate(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.state = SessionState::Terminated;
        self.buffer.clear();
        self.ctx.registry.remove(self.registration);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Aborted task: stop tracking the peer
        if !self.is_terminated() {
            self.ctx.registry.remove(self.registration);
        }
    }
}
