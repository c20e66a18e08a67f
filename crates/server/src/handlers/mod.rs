//! HTTP request handlers.

pub mod health;
pub mod modules;

pub use health::*;
pub use modules::*;
