//! murmur-lib: speech audio delivery engine.
//!
//! Output backends, the audio server, the synthesis session, the Kokoro
//! engine, and the HTTP control API. Depends on murmur-core for pure types,
//! the wire codec and text preparation.

pub mod backend;
pub mod codec;
pub mod control;
pub mod engine;
pub mod kokoro;
pub mod output;
pub mod server;
pub mod session;
pub mod voice;

// Re-export murmur-core for convenience
pub use murmur_core;
