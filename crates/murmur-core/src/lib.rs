//! murmur-core: Pure types, wire codec and text processing.
//!
//! No async runtime, no device access. Everything here works over plain
//! `std::io::Read`/`Write` so both the daemon and producer processes can share it.

pub mod config;
pub mod pcm;
pub mod protocol;
pub mod text_prep;
pub mod types;
