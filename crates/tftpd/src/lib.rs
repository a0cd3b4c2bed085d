//! TFTP daemon
//!
//! Serves the files of one directory to TFTP clients, read-only. The protocol
//! work is done by the [`tftp`] crate; this crate supplies the filesystem
//! [`ReadHandler`](tftp::ReadHandler) and the command line front end.

pub mod fs;

pub use fs::FsReadHandler;
