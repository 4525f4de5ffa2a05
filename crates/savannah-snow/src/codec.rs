//! Codec registry for persisted jobs and DAG vertices.
//!
//! Built once when a chain is created and shared by reference; nothing is
//! registered after construction.

use savannah_codec::{Codec, CodecError, CodecManager, DEFAULT_MAX_SIZE};

/// Version used for job records and regular vertices.
pub const CODEC_VERSION: u16 = 0;

/// Vertex version that allows stop vertices.
pub const STOP_VERTEX_VERSION: u16 = 1;

pub const BLOCK_JOB: &str = "block";
pub const VERTEX_JOB: &str = "vertex";
pub const TX_JOB: &str = "tx";

pub const STATELESS_VERTEX: &str = "stateless_vertex";

/// The chain's codecs.
#[derive(Debug)]
pub struct Codecs {
    jobs: CodecManager,
    vertices: CodecManager,
}

impl Codecs {
    /// # Errors
    ///
    /// Fails only on a duplicate registration.
    pub fn new() -> Result<Self, CodecError> {
        let mut job_codec = Codec::new();
        job_codec.register_type(BLOCK_JOB)?;
        job_codec.register_type(VERTEX_JOB)?;
        job_codec.register_type(TX_JOB)?;
        let mut jobs = CodecManager::new(DEFAULT_MAX_SIZE);
        jobs.register_codec(CODEC_VERSION, job_codec)?;

        let mut vertices = CodecManager::new(DEFAULT_MAX_SIZE);
        for version in [CODEC_VERSION, STOP_VERTEX_VERSION] {
            let mut codec = Codec::new();
            codec.register_type(STATELESS_VERTEX)?;
            vertices.register_codec(version, codec)?;
        }
        Ok(Self { jobs, vertices })
    }

    pub fn jobs(&self) -> &CodecManager {
        &self.jobs
    }

    pub fn vertices(&self) -> &CodecManager {
        &self.vertices
    }
}
