//! meshstore-net: connection core and request multiplexer.
//!
//! # Modules
//!
//! - [`framing`]: length-prefixed wire frames (text/binary/ping/pong) (spec §6)
//! - [`connection`]: `Connection`, its `{connecting, open, closed}` state
//!   machine, and ping/pong keepalive (spec §4.8)
//! - [`mux`]: request multiplexer built atop one `Connection` — services,
//!   `send`, streamed responses (spec §4.8, §6 "Wire protocol — request
//!   multiplexer")

pub mod connection;
pub mod framing;
pub mod mux;

pub use connection::{Connection, ConnectionState};
pub use framing::{Frame, FrameCodec, FrameType};
pub use mux::{RequestMultiplexer, ResponseStream, ServiceFn, StreamChunk};
