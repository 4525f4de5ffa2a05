//! Chain lifecycle for the Snow family of consensus protocols.
//!
//! A chain moves through up to three gears, each driven by the same
//! [`handler::Handler`] loop:
//!
//! - **State syncer**: jumps to a recent summary agreed on by the beacons
//! - **Bootstrapper**: fetches and executes the accepted history
//! - **Engine**: runs Snowman (linear) or Avalanche (DAG) consensus
//!
//! # Architecture
//!
//! - **Poll set**: FIFO tracking of outstanding network polls
//! - **Queue**: persistent dependency queue used while bootstrapping
//! - **Common**: frontier discovery, request tracking, timeouts and halting
//! - **Manager**: creates chains, wires their gears and tracks subnets
//!
//! # Example
//!
//! ```
//! use savannah_snow::Parameters;
//!
//! let params = Parameters::default();
//! assert!(params.validate().is_ok());
//! ```

pub mod avalanche;
pub mod choices;
pub mod codec;
pub mod common;
pub mod consensus;
pub mod context;
mod error;
pub mod handler;
pub mod manager;
pub mod message;
pub mod metrics;
mod parameters;
pub mod poll;
pub mod queue;
pub mod snowman;
pub mod subnet;
pub mod syncer;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod validators;
pub mod vm;

pub use context::{ChainState, ConsensusContext};
pub use error::{ConsensusError, Result};
pub use handler::{ChainHandle, Handler};
pub use manager::{ChainParameters, ChainVmKind, Manager, ManagerConfig};
pub use parameters::Parameters;
pub use subnet::Subnet;
