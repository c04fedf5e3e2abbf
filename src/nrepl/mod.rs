//! nREPL-compatible TCP server.
//!
//! Runs beside the line-oriented sessions rather than through them: it keeps
//! its own op table and session ids, and only shares the compile-and-evaluate
//! entry point with the `eval` method.

pub mod bencode;
pub mod ops;
pub mod server;

pub use bencode::{Bencode, BencodeError, FrameDecoder};
pub use ops::SessionTable;
pub use server::{NreplServer, PortFile};
