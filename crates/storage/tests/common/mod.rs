#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::{metadata, seeded_bytes, source, test_store};
