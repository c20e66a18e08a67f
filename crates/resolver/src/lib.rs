//! Module resolution and cache indexing.
//!
//! This crate provides:
//! - The [`Engine`], answering `info`, `latest`, `go_mod`, `zip` and `list`
//!   queries from the object store and the toolchain
//! - Scoped sandboxes and a bounded pool for toolchain invocations
//! - The transitional concat object format
//! - A client for the parent proxy

pub mod classify;
pub mod concat;
pub mod engine;
pub mod environ;
pub mod error;
pub mod gitconfig;
pub mod list;
pub mod pool;
pub mod runner;
pub mod sandbox;
pub mod shared_file;
pub mod toolchain;
pub mod upstream;

pub use classify::{LogPhrasePolicy, NeverNotFound, NotFoundPolicy};
pub use engine::{COMMIT_TIME_METADATA_KEY, Engine};
pub use environ::Environ;
pub use error::{ErrorKind, ResolveError, ResolveResult};
pub use pool::{Pool, PoolToken};
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner};
pub use sandbox::{Sandbox, SandboxFile};
pub use shared_file::SharedFile;
pub use upstream::UpstreamClient;

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Streamed object or file contents.
pub type DataStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;
