//! Dovecote Core
//!
//! This crate contains the runtime-agnostic engine building blocks:
//! - Subject grammar and wildcard validation (`subject`)
//! - Subject-match index: trie + bounded result cache (`sublist`)
//! - Error types (`error`)
//! - Server options and shared constants (`options`)
//!
//! Nothing in this crate performs I/O; the broker crate layers the wire
//! protocol and session handling on top.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::return_self_not_must_use)] // Builder patterns are self-documenting

pub mod error;
pub mod options;
pub mod subject;
pub mod sublist;

// A small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::error::{DovecoteError, Result};
    pub use crate::options::ServerOptions;
    pub use crate::sublist::{MatchResult, Sublist, SublistStats};
}
