//! Gears of a linear chain.

mod block_job;
pub mod bootstrap;
mod getter;
pub mod transitive;

pub use bootstrap::Bootstrapper;
pub use getter::Getter;
pub use transitive::Transitive;
