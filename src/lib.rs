//! Framefarm library
//!
//! Distributes a per-frame batch computation across a pool of remote
//! workers. A controller ships input files to each worker, runs a command
//! with frame-substituted arguments, and collects the outputs; an optional
//! proxy pairs workers behind restricted networks with controllers that
//! cannot dial them directly.

pub mod controller;
pub mod endpoint;
pub mod frames;
pub mod job;
pub mod paths;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod subst;
pub mod worker;
