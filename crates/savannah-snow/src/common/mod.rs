//! Pieces shared by every gear of a chain.

mod config;
mod engine;
mod frontier;
mod halter;
mod requests;
mod sender;
mod timeout;

pub use config::{BootstrapConfig, CommonConfig};
pub use engine::{Engine, GetServer, OnFinished};
pub use frontier::{Frontier, FrontierOutcome};
pub use halter::Halter;
pub use requests::OutstandingRequests;
pub use sender::{send_mixed_query, Sender};
pub use timeout::{HandlerTimeouts, Timeouts};
