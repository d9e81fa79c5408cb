//! SFTP, versions 3 to 6, for a byte stream such as an SSH `sftp` subsystem
//! channel.
//!
//! [`SftpHandler`] serves requests against an application supplied
//! [`SftpBackend`]. [`SftpClient`] is a client with request pipelining, and
//! [`Transfer`] runs pipelined downloads and uploads over it.

#![forbid(unsafe_code)]
// avoids headscratching
#![deny(unused_must_use)]

pub mod attrs;
pub mod backend;
pub mod config;
// exported so that Status errors can be matched on
pub mod error;
pub mod handles;
pub mod proto;
pub mod sshwire;

mod client;
mod opaquefilehandle;
mod sftphandler;
mod sftplog;
mod sftpsink;
mod sftpsource;
mod transfer;

#[cfg(test)]
mod testfs;

// Application API
pub use attrs::{Attrs, FileTime, FileType};
pub use backend::{BackendFile, FsError, FsResult, OpenOptions, RenameFlags, SftpBackend};
pub use client::{Correlator, DirEntry, ReadData, RemoteHandle, SftpClient};
pub use config::{ClientConfig, NameFilter, ServerConfig};
pub use error::{Error, Result};
pub use opaquefilehandle::{HandleToken, OpaqueFileHandle};
pub use proto::{ReqId, StatusCode};
pub use sftphandler::{SftpHandler, SftpOutputConsumer, SftpOutputPipe, SftpOutputProducer};
pub use transfer::{CancelToken, Transfer, UploadMode};
