//! A concurrent, in-memory cache for JPIP-style data-bins.
//!
//! Bins are addressed by `(class, codestream, in-class bin id)` and filled
//! incrementally, in any order, by byte range. The tree that indexes them is
//! a 128-ary hierarchy of pooled [`Segment`](segment::Segment)s, grown
//! upward on demand as codestream/bin ids exceed the current root's range
//! (§4.3). Readers descend it lock-free, synchronizing against the single
//! mutex-holding writer purely through per-node access counters and a
//! seqlock-style verify-and-retry (§4.4, see [`walker`]); writers run under
//! one [`std::sync::Mutex`] guarding [`cache::state::CacheState`].
//!
//! The [`Cache`] type is the public entry point.
#![forbid(unsafe_code)]

mod arena;
mod bin;
pub mod cache;
mod cell;
mod config;
mod error;
mod mru;
mod segment;
mod slot;
mod walker;

pub use cache::{BinFlags, BinMarkInfo, Cache, Reader, ScanEntry};
pub use config::Config;
pub use error::{Error, Result};
