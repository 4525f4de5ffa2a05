//! Gears of a DAG chain.

pub mod bootstrap;
mod getter;
pub mod state;
pub mod transitive;
mod tx_job;
pub mod vertex;
mod vertex_job;

pub use bootstrap::Bootstrapper;
pub use getter::Getter;
pub use state::Serializer;
pub use transitive::Transitive;
pub use vertex::{StatelessVertex, VertexError};
