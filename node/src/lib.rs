//! Composition root: wires `NodeConfig`, logging, the shutdown signal, and
//! the object pipeline together, the way `ckb-bin` wires `AppConfig`,
//! `ckb-logger`, and the service runtimes it starts — just without an
//! actual `main` (this crate is a library; turning it into a running
//! daemon binary is out of this repository's scope, per DESIGN.md).

pub mod config;
pub mod logger;
pub mod pipeline;
pub mod shutdown;

pub use config::NodeConfig;
pub use logger::LoggerConfig;
pub use pipeline::{ObjectVerifier, Pipeline, SubmitOutcome};
pub use shutdown::Shutdown;
