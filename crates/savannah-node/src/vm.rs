//! A development VM whose blocks carry opaque payloads.
//!
//! Block layout: parent ID (32 bytes), height (`u64`), then the payload as
//! length-prefixed bytes. A block's ID is the hash of its bytes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use savannah_codec::{Pack, Packer, Unpack, Unpacker};
use savannah_ids::Id;
use savannah_snow::choices::Status;
use savannah_snow::vm::{Block, BlockRef, ChainVm, CommonVm, VmError, VmResult};
use savannah_snow::ChainState;
use serde_json::json;
use tracing::{debug, info};

struct ChainData {
    blocks: HashMap<Id, Arc<DevBlock>>,
    last_accepted: Id,
    last_accepted_height: u64,
    preference: Id,
    pending: VecDeque<Vec<u8>>,
    state: Option<ChainState>,
}

pub struct DevBlock {
    id: Id,
    parent: Id,
    height: u64,
    payload: Vec<u8>,
    bytes: Vec<u8>,
    status: Mutex<Status>,
    chain: Weak<Mutex<ChainData>>,
}

impl DevBlock {
    fn new(
        parent: Id,
        height: u64,
        payload: Vec<u8>,
        status: Status,
        chain: Weak<Mutex<ChainData>>,
    ) -> VmResult<Self> {
        let mut packer = Packer::new(32 + 8 + 4 + payload.len());
        parent.pack(&mut packer);
        packer.pack_long(height);
        packer.pack_bytes(&payload);
        let bytes = packer
            .into_bytes()
            .map_err(|e| VmError::Internal(e.to_string()))?;
        Ok(Self {
            id: Id::from_hash(&bytes),
            parent,
            height,
            payload,
            bytes,
            status: Mutex::new(status),
            chain,
        })
    }

    fn parse(bytes: &[u8], chain: Weak<Mutex<ChainData>>) -> VmResult<Self> {
        let invalid = |e: savannah_codec::UnpackError| VmError::Invalid(e.to_string());
        let mut unpacker = Unpacker::new(bytes);
        let parent = Id::unpack(&mut unpacker).map_err(invalid)?;
        let height = unpacker.unpack_long().map_err(invalid)?;
        let payload = unpacker.unpack_bytes().map_err(invalid)?;
        if !unpacker.is_empty() {
            return Err(VmError::Invalid(format!(
                "{} trailing bytes",
                unpacker.remaining()
            )));
        }
        Self::new(parent, height, payload, Status::Processing, chain)
    }

    fn chain(&self) -> VmResult<Arc<Mutex<ChainData>>> {
        self.chain
            .upgrade()
            .ok_or_else(|| VmError::Internal("vm shut down".to_string()))
    }
}

impl Block for DevBlock {
    fn id(&self) -> Id {
        self.id
    }

    fn parent(&self) -> Id {
        self.parent
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn status(&self) -> Status {
        *self.status.lock()
    }

    fn verify(&self) -> VmResult<()> {
        let chain = self.chain()?;
        let chain = chain.lock();
        let parent = chain
            .blocks
            .get(&self.parent)
            .ok_or(VmError::NotFound(self.parent))?;
        if parent.height + 1 != self.height {
            return Err(VmError::Invalid(format!(
                "height {} on parent at height {}",
                self.height, parent.height
            )));
        }
        Ok(())
    }

    fn accept(&self) -> VmResult<()> {
        *self.status.lock() = Status::Accepted;
        let chain = self.chain()?;
        let mut chain = chain.lock();
        chain.last_accepted = self.id;
        chain.last_accepted_height = self.height;
        info!(
            block_id = %self.id,
            height = self.height,
            payload = %String::from_utf8_lossy(&self.payload),
            "accepted block"
        );
        Ok(())
    }

    fn reject(&self) -> VmResult<()> {
        *self.status.lock() = Status::Rejected;
        debug!(block_id = %self.id, height = self.height, "rejected block");
        Ok(())
    }
}

/// Builds one block per submitted payload on top of the current preference.
pub struct DevVm {
    chain: Arc<Mutex<ChainData>>,
}

impl DevVm {
    pub fn new(genesis: &[u8]) -> VmResult<Self> {
        let chain = Arc::new(Mutex::new(ChainData {
            blocks: HashMap::new(),
            last_accepted: Id::EMPTY,
            last_accepted_height: 0,
            preference: Id::EMPTY,
            pending: VecDeque::new(),
            state: None,
        }));
        let genesis = Arc::new(DevBlock::new(
            Id::EMPTY,
            0,
            genesis.to_vec(),
            Status::Accepted,
            Arc::downgrade(&chain),
        )?);
        {
            let mut data = chain.lock();
            data.last_accepted = genesis.id;
            data.preference = genesis.id;
            data.blocks.insert(genesis.id, genesis);
        }
        Ok(Self { chain })
    }

    /// Queues a payload for the next built block.
    pub fn submit(&self, payload: Vec<u8>) {
        self.chain.lock().pending.push_back(payload);
    }

    pub fn last_accepted_height(&self) -> u64 {
        self.chain.lock().last_accepted_height
    }

    pub fn state(&self) -> Option<ChainState> {
        self.chain.lock().state
    }
}

impl CommonVm for DevVm {
    fn set_state(&self, state: ChainState) -> VmResult<()> {
        debug!(?state, "vm state changed");
        self.chain.lock().state = Some(state);
        Ok(())
    }

    fn health_check(&self) -> VmResult<serde_json::Value> {
        let chain = self.chain.lock();
        Ok(json!({
            "last_accepted": chain.last_accepted.to_string(),
            "height": chain.last_accepted_height,
            "pending": chain.pending.len(),
        }))
    }
}

impl ChainVm for DevVm {
    fn parse_block(&self, bytes: &[u8]) -> VmResult<BlockRef> {
        let parsed = DevBlock::parse(bytes, Arc::downgrade(&self.chain))?;
        let mut chain = self.chain.lock();
        let block = chain
            .blocks
            .entry(parsed.id)
            .or_insert_with(|| Arc::new(parsed));
        Ok(block.clone())
    }

    fn get_block(&self, id: &Id) -> VmResult<BlockRef> {
        let chain = self.chain.lock();
        match chain.blocks.get(id) {
            Some(block) => Ok(block.clone()),
            None => Err(VmError::NotFound(*id)),
        }
    }

    fn last_accepted(&self) -> VmResult<Id> {
        Ok(self.chain.lock().last_accepted)
    }

    fn build_block(&self) -> VmResult<BlockRef> {
        let mut chain = self.chain.lock();
        let parent = chain
            .blocks
            .get(&chain.preference)
            .cloned()
            .ok_or(VmError::NotFound(chain.preference))?;
        let Some(payload) = chain.pending.pop_front() else {
            return Err(VmError::Internal("no pending payloads".to_string()));
        };
        let block = Arc::new(DevBlock::new(
            parent.id,
            parent.height + 1,
            payload,
            Status::Processing,
            Arc::downgrade(&self.chain),
        )?);
        debug!(block_id = %block.id, height = block.height, "built block");
        chain.blocks.insert(block.id, block.clone());
        Ok(block)
    }

    fn set_preference(&self, id: &Id) -> VmResult<()> {
        self.chain.lock().preference = *id;
        Ok(())
    }
}
