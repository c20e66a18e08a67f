//! Core domain types and shared logic for the caching module proxy.
//!
//! This crate defines the data model used across all other crates:
//! - Module identities (`path@version`) and version metadata
//! - The canonical version grammar, pseudo-version detection and ordering
//! - Case-encoding of module paths for URLs and file names
//! - Configuration types

pub mod config;
pub mod error;
pub mod escape;
pub mod module;
pub mod version;

pub use error::{Error, Result};
pub use escape::{escape_path, path_is_lexical_descendant, unescape_path, unescape_version};
pub use module::{Info, ModuleVersion};
pub use version::LATEST;
