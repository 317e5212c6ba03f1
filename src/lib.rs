//! Device-side (responder) implementation of the Media Transfer Protocol
//! over USB FunctionFS: a host browses object storages backed by POSIX
//! filesystem subtrees, reads and writes object content, and receives
//! change notifications.

use std::io;

use thiserror::Error;

mod command;
mod container;
mod data;
mod dataset;
mod deviceinfo;
mod event;
mod extension;
mod factory;
mod format;
mod inotify;
mod properties;
mod responder;
mod response;
mod storage;
mod thumbnailer;
mod transport;

pub use crate::command::*;
pub use crate::container::*;
pub use crate::data::*;
pub use crate::dataset::*;
pub use crate::deviceinfo::*;
pub use crate::event::*;
pub use crate::extension::*;
pub use crate::factory::*;
pub use crate::format::*;
pub use crate::properties::*;
pub use crate::responder::*;
pub use crate::response::*;
pub use crate::storage::*;
pub use crate::thumbnailer::*;
pub use crate::transport::*;

/// Operation outcome carrying an MTP response code on failure. Handlers
/// package the code into the response container.
pub type OpResult<T> = Result<T, crate::response::StandardResponseCode>;

/// An error in the MTP plumbing itself, outside the response-code space.
#[derive(Error, Debug)]
pub enum Error {
    /// Data received was malformed
    #[error("the data received was malformed: {0}")]
    Malformed(String),

    #[error("the transport is not available")]
    TransportUnavailable,

    /// Another IO error
    #[error("an i/o error occurred: {0}")]
    Io(#[from] io::Error),
}
