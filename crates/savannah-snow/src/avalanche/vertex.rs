//! Wire format of DAG vertices.
//!
//! A vertex is written as a typed codec record: the codec version, the
//! stateless vertex type id, then
//!
//! - chain id (32 bytes)
//! - height (`u64`)
//! - parent ids (`u32` count, sorted and unique)
//! - transactions (`u32` count of length-prefixed byte strings, sorted by
//!   hash and unique)
//!
//! Version 0 carries regular vertices, which must hold at least one
//! transaction. Version 1 carries stop vertices, which hold none.

use savannah_codec::{finish, CodecError, CodecManager, Pack, Packer, Unpack, UnpackError, Unpacker};
use savannah_ids::Id;
use thiserror::Error;

use crate::codec::{CODEC_VERSION, STATELESS_VERTEX, STOP_VERTEX_VERSION};
use crate::vm::VmError;

pub const MAX_PARENTS: usize = 128;
pub const MAX_TXS: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VertexError {
    #[error("vertex contains no transactions")]
    NoTxs,

    #[error("stop vertex contains {0} transactions")]
    StopVertexWithTxs(usize),

    #[error("vertex contains {0} parents, more than {MAX_PARENTS}")]
    TooManyParents(usize),

    #[error("vertex contains {0} transactions, more than {MAX_TXS}")]
    TooManyTxs(usize),

    #[error("vertex parents are not sorted and unique")]
    UnsortedParents,

    #[error("vertex transactions are not sorted and unique")]
    UnsortedTxs,

    #[error("vertex for chain {actual}, expected {expected}")]
    WrongChain { expected: Id, actual: Id },

    #[error("unexpected record type {0:?}")]
    WrongType(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<UnpackError> for VertexError {
    fn from(err: UnpackError) -> Self {
        Self::Codec(err.into())
    }
}

impl From<VertexError> for VmError {
    fn from(err: VertexError) -> Self {
        VmError::Invalid(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InnerVertex {
    chain_id: Id,
    height: u64,
    parent_ids: Vec<Id>,
    txs: Vec<Vec<u8>>,
}

impl Pack for InnerVertex {
    fn pack(&self, packer: &mut Packer) {
        self.chain_id.pack(packer);
        packer.pack_long(self.height);
        self.parent_ids.pack(packer);
        packer.pack_len(self.txs.len());
        for tx in &self.txs {
            packer.pack_bytes(tx);
        }
    }
}

impl Unpack for InnerVertex {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        let chain_id = Id::unpack(unpacker)?;
        let height = unpacker.unpack_long()?;
        let parent_ids = Vec::<Id>::unpack(unpacker)?;
        let num_txs = unpacker.unpack_int()? as usize;
        let mut txs = Vec::with_capacity(num_txs.min(MAX_TXS));
        for _ in 0..num_txs {
            txs.push(unpacker.unpack_bytes()?);
        }
        Ok(Self {
            chain_id,
            height,
            parent_ids,
            txs,
        })
    }
}

impl InnerVertex {
    fn verify(&self, version: u16) -> Result<(), VertexError> {
        if self.parent_ids.len() > MAX_PARENTS {
            return Err(VertexError::TooManyParents(self.parent_ids.len()));
        }
        if !sorted_and_unique(&self.parent_ids) {
            return Err(VertexError::UnsortedParents);
        }
        if version == STOP_VERTEX_VERSION {
            if !self.txs.is_empty() {
                return Err(VertexError::StopVertexWithTxs(self.txs.len()));
            }
            return Ok(());
        }
        if self.txs.is_empty() {
            return Err(VertexError::NoTxs);
        }
        if self.txs.len() > MAX_TXS {
            return Err(VertexError::TooManyTxs(self.txs.len()));
        }
        let hashes: Vec<Id> = self.txs.iter().map(|tx| Id::from_hash(tx)).collect();
        if !sorted_and_unique(&hashes) {
            return Err(VertexError::UnsortedTxs);
        }
        Ok(())
    }
}

fn sorted_and_unique(ids: &[Id]) -> bool {
    ids.windows(2).all(|pair| pair[0] < pair[1])
}

/// A parsed, verified vertex and its canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatelessVertex {
    version: u16,
    id: Id,
    bytes: Vec<u8>,
    inner: InnerVertex,
}

impl StatelessVertex {
    /// Builds a regular vertex, sorting parents and transactions into their
    /// canonical order.
    pub fn build(
        codec: &CodecManager,
        chain_id: Id,
        height: u64,
        mut parent_ids: Vec<Id>,
        mut txs: Vec<Vec<u8>>,
    ) -> Result<Self, VertexError> {
        parent_ids.sort();
        parent_ids.dedup();
        txs.sort_by_cached_key(|tx| Id::from_hash(tx));
        txs.dedup();
        Self::encode(
            codec,
            CODEC_VERSION,
            InnerVertex {
                chain_id,
                height,
                parent_ids,
                txs,
            },
        )
    }

    /// Builds a stop vertex, which carries no transactions.
    pub fn build_stop(
        codec: &CodecManager,
        chain_id: Id,
        height: u64,
        mut parent_ids: Vec<Id>,
    ) -> Result<Self, VertexError> {
        parent_ids.sort();
        parent_ids.dedup();
        Self::encode(
            codec,
            STOP_VERTEX_VERSION,
            InnerVertex {
                chain_id,
                height,
                parent_ids,
                txs: Vec::new(),
            },
        )
    }

    fn encode(codec: &CodecManager, version: u16, inner: InnerVertex) -> Result<Self, VertexError> {
        inner.verify(version)?;
        let bytes = codec.marshal_typed(version, STATELESS_VERTEX, &inner)?;
        Ok(Self {
            version,
            id: Id::from_hash(&bytes),
            bytes,
            inner,
        })
    }

    /// Parses and verifies `bytes`.
    pub fn parse(codec: &CodecManager, bytes: &[u8]) -> Result<Self, VertexError> {
        let (version, type_name, mut unpacker) = codec.unmarshal_typed(bytes)?;
        if type_name != STATELESS_VERTEX {
            return Err(VertexError::WrongType(type_name));
        }
        let inner = InnerVertex::unpack(&mut unpacker)?;
        finish(&unpacker)?;
        inner.verify(version)?;
        Ok(Self {
            version,
            id: Id::from_hash(bytes),
            bytes: bytes.to_vec(),
            inner,
        })
    }

    /// Parses `bytes` and checks the vertex belongs to `chain_id`.
    pub fn parse_for_chain(
        codec: &CodecManager,
        chain_id: Id,
        bytes: &[u8],
    ) -> Result<Self, VertexError> {
        let vtx = Self::parse(codec, bytes)?;
        if vtx.inner.chain_id != chain_id {
            return Err(VertexError::WrongChain {
                expected: chain_id,
                actual: vtx.inner.chain_id,
            });
        }
        Ok(vtx)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn chain_id(&self) -> Id {
        self.inner.chain_id
    }

    pub fn height(&self) -> u64 {
        self.inner.height
    }

    pub fn parent_ids(&self) -> &[Id] {
        &self.inner.parent_ids
    }

    pub fn txs(&self) -> &[Vec<u8>] {
        &self.inner.txs
    }

    pub fn stop_vertex(&self) -> bool {
        self.version == STOP_VERTEX_VERSION
    }
}
