//! LSP multiplexing sidecar library. `main.rs` is a thin binary wrapper
//! around [`dispatcher::Sidecar`]; tests drive the pieces here directly so
//! they never need a real language server binary installed.

pub mod control;
pub mod dispatcher;
pub mod framing;
pub mod instance;
pub mod json_walk;
pub mod policy;
pub mod registry;
pub mod resolver;
