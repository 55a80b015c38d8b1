#![forbid(unsafe_code)]
//! A CouchDB-compatible view server: the subordinate process a document
//! database spawns to compile and execute the functions stored in design
//! documents (map, reduce, validation, filter, show, list, update).
//!
//! The host drives the engine over stdin/stdout with newline-delimited JSON
//! frames; every input frame is a `[command, args...]` array and every output
//! frame is a single JSON value. The engine is strictly single-threaded: the
//! host spawns more engines when it wants parallelism.
//!
//! User functions are [rhai](https://rhai.rs) scripts defining exactly one
//! `fn`, compiled and run by [`RhaiEvaluator`] behind the pluggable
//! [`Evaluator`] seam. Script code talks back to the engine through injected
//! capabilities: `log`, `emit`, `Error`/`FatalError`/`Forbidden`, `assert`,
//! `require`, and (for render functions) `start`, `send`, `get_row`,
//! `provides` and `register_type`.
//!
//! The wire dialect is parameterized by [`ProtocolVersion`]: error and log
//! envelopes switch shape at 0.11.0, streaming list rendering arrives at
//! 0.10.0, the `ddoc` sub-protocol at 0.11.0, and shared view libraries at
//! 1.1.0.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use viewserver::{LineStream, ProtocolVersion, QueryServer, SharedIo};
//!
//! let io: SharedIo = Rc::new(RefCell::new(LineStream::new(
//!     std::io::stdin().lock(),
//!     std::io::stdout(),
//! )));
//! let mut server = QueryServer::new(ProtocolVersion::latest(), io);
//! std::process::exit(server.serve());
//! ```

pub mod ddoc;
pub mod error;
pub mod eval;
pub mod filters;
pub mod mime;
pub mod render;
pub mod require;
pub mod server;
pub mod state;
pub mod stream;
pub mod validate;
pub mod version;
pub mod views;

pub use crate::error::ViewServerError;
pub use crate::eval::{
    CallContext, CallError, Evaluator, FunctionHandle, ModuleHandle, ProviderHandle,
    RhaiEvaluator,
};
pub use crate::server::{QueryServer, ServerConfig};
pub use crate::stream::{FrameIo, LineStream, SharedIo};
pub use crate::version::{InvalidVersion, ProtocolVersion};

#[cfg(test)]
mod tests;
