//! TFTP read-request server
//!
//! Serves downloads over UDP following RFC 1350, with block size negotiation
//! (RFC 2347 / RFC 2348). Write requests are not supported.
//!
//! The crate is split along the path a datagram takes:
//!
//! - [`protocol`] - packet encoding and decoding
//! - [`server`] - the dispatcher: socket, receive loop and request routing
//! - [`registry`] - active transfers keyed by client address
//! - [`session`] - the per-transfer state machine handed to a [`ReadHandler`]
//! - [`options`] - option negotiation
//!
//! Where the bytes come from is up to the application, which implements
//! [`ReadHandler`]:
//!
//! ```rust,no_run
//! use tftp::{ReadHandler, Session, TftpErrorCode, TftpServer, TftpServerConfig};
//!
//! struct Hello;
//!
//! impl ReadHandler for Hello {
//!     async fn handle(&self, session: &mut Session) -> anyhow::Result<()> {
//!         if session.filename() != "hello.txt" {
//!             session.write_error(TftpErrorCode::FileNotFound, "not found");
//!             return Ok(());
//!         }
//!         session.write_all(b"Hello, TFTP!\n").await?;
//!         session.close().await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TftpServerConfig {
//!         bind_address: "0.0.0.0:6969".to_string(),
//!         ..Default::default()
//!     };
//!     TftpServer::new(config, Hello).run().await
//! }
//! ```

pub mod options;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use options::{BlockSize, OptionError, TransferOptions};
pub use protocol::*;
pub use registry::SessionRegistry;
pub use server::{DEFAULT_BIND, TftpServer, TftpServerConfig, run_tftp_server};
pub use session::{Outgoing, ReadHandler, Session, SessionError, SessionState, Timeouts};
