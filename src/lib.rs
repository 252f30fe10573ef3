//! Out-of-process debugger control.
//!
//! The crate is split along the path a debugger command travels:
//!
//! * [`remoting`] - the inter-process channel, framing and the bidirectional call endpoint.
//! * [`controller`] - supervision of the child debugger-server process.
//! * [`session`] - per-run session state machine used by a front end.
//! * [`server`] - the child side: bootstrap handshake, request dispatch and the emulated runtime.
//! * [`backtrace`], [`eval`], [`adaptor`] - stack introspection, expression evaluation and
//!   display-ready value rendering, working on the debuggee [`model`].

pub mod adaptor;
pub mod backtrace;
pub mod config;
pub mod controller;
pub mod error;
pub mod eval;
pub mod log;
pub mod model;
pub mod remoting;
pub mod server;
pub mod session;
pub mod utils;

pub use error::Error;
