//! Persistent vertex storage.
//!
//! Vertices are stored by id together with their decision status. The
//! accepted edge, the accepted vertices no accepted vertex builds on, is
//! kept in memory and rewritten on every accept.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use savannah_codec::{finish, Pack, Packer, Unpack, Unpacker};
use savannah_db::{Database, KeyValueReader, KeyValueWriter, PrefixDb};
use savannah_ids::Id;
use tracing::{debug, trace};

use super::vertex::StatelessVertex;
use crate::choices::Status;
use crate::codec::Codecs;
use crate::vm::{DagVm, TxRef, Vertex, VertexManager, VertexRef, VmError, VmResult};

const VERTEX_PREFIX: &[u8] = b"vertex";
const STATUS_PREFIX: &[u8] = b"status";
const EDGE_KEY: &[u8] = b"edge";

fn db_error(err: impl std::fmt::Display) -> VmError {
    VmError::Internal(format!("vertex storage: {err}"))
}

fn status_byte(status: Status) -> u8 {
    match status {
        Status::Unknown => 0,
        Status::Processing => 1,
        Status::Rejected => 2,
        Status::Accepted => 3,
    }
}

fn status_from_byte(byte: u8) -> Status {
    match byte {
        1 => Status::Processing,
        2 => Status::Rejected,
        3 => Status::Accepted,
        _ => Status::Unknown,
    }
}

struct Store {
    chain_id: Id,
    vertices: PrefixDb,
    statuses: PrefixDb,
    metadata: Arc<dyn Database>,
    codecs: Arc<Codecs>,
    vm: Arc<dyn DagVm>,
    edge: Mutex<BTreeSet<Id>>,
}

impl Store {
    fn status(&self, id: &Id) -> VmResult<Status> {
        let status = self.statuses.get(id.as_bytes()).map_err(db_error)?;
        Ok(status
            .and_then(|bytes| bytes.first().copied())
            .map_or(Status::Unknown, status_from_byte))
    }

    fn set_status(&self, id: &Id, status: Status) -> VmResult<()> {
        self.statuses
            .put(id.as_bytes(), &[status_byte(status)])
            .map_err(db_error)
    }

    fn put_edge(&self, edge: &BTreeSet<Id>) -> VmResult<()> {
        let ids: Vec<Id> = edge.iter().copied().collect();
        let mut packer = Packer::new(4 + ids.len() * 32);
        ids.pack(&mut packer);
        let bytes = packer.into_bytes().map_err(db_error)?;
        self.metadata.put(EDGE_KEY, &bytes).map_err(db_error)
    }

    /// Stores a freshly parsed or built vertex as processing.
    fn track(self: &Arc<Self>, vtx: StatelessVertex) -> VmResult<VertexRef> {
        let id = vtx.id();
        if self.status(&id)? == Status::Unknown {
            self.vertices.put(id.as_bytes(), vtx.bytes()).map_err(db_error)?;
            self.set_status(&id, Status::Processing)?;
            trace!(vtx_id = %id, height = vtx.height(), "stored vertex");
        }
        Ok(Arc::new(StoredVertex {
            vtx,
            store: Arc::clone(self),
        }))
    }
}

/// A vertex backed by the [`Serializer`]'s storage.
struct StoredVertex {
    vtx: StatelessVertex,
    store: Arc<Store>,
}

impl Vertex for StoredVertex {
    fn id(&self) -> Id {
        self.vtx.id()
    }

    fn bytes(&self) -> Vec<u8> {
        self.vtx.bytes().to_vec()
    }

    fn status(&self) -> Status {
        // A storage failure reads as unknown, which only makes the vertex be
        // fetched again.
        self.store.status(&self.vtx.id()).unwrap_or(Status::Unknown)
    }

    fn height(&self) -> u64 {
        self.vtx.height()
    }

    fn parent_ids(&self) -> Vec<Id> {
        self.vtx.parent_ids().to_vec()
    }

    fn txs(&self) -> VmResult<Vec<TxRef>> {
        self.vtx
            .txs()
            .iter()
            .map(|bytes| self.store.vm.parse_tx(bytes))
            .collect()
    }

    fn accept(&self) -> VmResult<()> {
        let id = self.vtx.id();
        self.store.set_status(&id, Status::Accepted)?;
        let mut edge = self.store.edge.lock();
        for parent in self.vtx.parent_ids() {
            edge.remove(parent);
        }
        edge.insert(id);
        self.store.put_edge(&edge)?;
        debug!(vtx_id = %id, edge = edge.len(), "accepted vertex");
        Ok(())
    }

    fn reject(&self) -> VmResult<()> {
        self.store.set_status(&self.vtx.id(), Status::Rejected)
    }
}

/// [`VertexManager`] storing vertices in a database namespace.
pub struct Serializer {
    store: Arc<Store>,
}

impl Serializer {
    /// Opens the vertex storage in `db`, reloading the accepted edge.
    pub fn new(
        chain_id: Id,
        db: Arc<dyn Database>,
        codecs: Arc<Codecs>,
        vm: Arc<dyn DagVm>,
    ) -> VmResult<Self> {
        let edge = match db.get(EDGE_KEY).map_err(db_error)? {
            None => BTreeSet::new(),
            Some(bytes) => {
                let mut unpacker = Unpacker::new(&bytes);
                let ids = Vec::<Id>::unpack(&mut unpacker).map_err(db_error)?;
                finish(&unpacker).map_err(db_error)?;
                ids.into_iter().collect()
            }
        };
        Ok(Self {
            store: Arc::new(Store {
                chain_id,
                vertices: PrefixDb::new(Arc::clone(&db), VERTEX_PREFIX),
                statuses: PrefixDb::new(Arc::clone(&db), STATUS_PREFIX),
                metadata: db,
                codecs,
                vm,
                edge: Mutex::new(edge),
            }),
        })
    }

    /// Builds a stop vertex on top of `parent_ids`.
    pub fn build_stop_vtx(&self, parent_ids: Vec<Id>) -> VmResult<VertexRef> {
        let height = self.next_height(&parent_ids)?;
        let store = &self.store;
        let vtx = StatelessVertex::build_stop(store.codecs.vertices(), store.chain_id, height, parent_ids)?;
        store.track(vtx)
    }

    fn next_height(&self, parent_ids: &[Id]) -> VmResult<u64> {
        let mut height = 0;
        for parent_id in parent_ids {
            let parent_height = self.get_vtx(parent_id)?.height();
            let child_height = parent_height.checked_add(1).ok_or_else(|| {
                VmError::Invalid(format!("parent {parent_id} is at the maximum height"))
            })?;
            height = height.max(child_height);
        }
        Ok(height)
    }
}

impl VertexManager for Serializer {
    fn parse_vtx(&self, bytes: &[u8]) -> VmResult<VertexRef> {
        let store = &self.store;
        let vtx = StatelessVertex::parse_for_chain(store.codecs.vertices(), store.chain_id, bytes)?;
        // A vertex is only stored once every transaction in it parses.
        for tx in vtx.txs() {
            store.vm.parse_tx(tx)?;
        }
        store.track(vtx)
    }

    fn get_vtx(&self, id: &Id) -> VmResult<VertexRef> {
        let store = &self.store;
        let Some(bytes) = store.vertices.get(id.as_bytes()).map_err(db_error)? else {
            return Err(VmError::NotFound(*id));
        };
        let vtx = StatelessVertex::parse(store.codecs.vertices(), &bytes)?;
        Ok(Arc::new(StoredVertex {
            vtx,
            store: Arc::clone(store),
        }))
    }

    fn build_vtx(&self, parent_ids: Vec<Id>, txs: Vec<TxRef>) -> VmResult<VertexRef> {
        let height = self.next_height(&parent_ids)?;
        let txs = txs.iter().map(|tx| tx.bytes()).collect();
        let store = &self.store;
        let vtx = StatelessVertex::build(store.codecs.vertices(), store.chain_id, height, parent_ids, txs)?;
        store.track(vtx)
    }

    fn edge(&self) -> Vec<Id> {
        self.store.edge.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use savannah_db::MemDb;

    use super::*;
    use crate::testing::{chain_id, TestDagVm, TestTx};
    use crate::vm::Tx;

    fn serializer(db: &Arc<MemDb>, vm: &Arc<TestDagVm>) -> Serializer {
        Serializer::new(chain_id(), db.clone(), Arc::new(Codecs::new().unwrap()), vm.clone()).unwrap()
    }

    #[test]
    fn test_build_accept_and_reload_edge() {
        let db = Arc::new(MemDb::new());
        let vm = Arc::new(TestDagVm::default());
        let tx = TestTx::new(1, vec![], vec![]);
        vm.add_parseable(tx.clone());
        let manager = serializer(&db, &vm);

        let root = manager.build_vtx(Vec::new(), vec![tx.clone()]).unwrap();
        assert_eq!(root.height(), 0);
        assert_eq!(root.status(), Status::Processing);
        let child = manager.build_stop_vtx(vec![root.id()]).unwrap();
        assert_eq!(child.height(), 1);

        root.accept().unwrap();
        assert_eq!(manager.edge(), vec![root.id()]);
        child.accept().unwrap();
        assert_eq!(manager.edge(), vec![child.id()]);

        let reopened = serializer(&db, &vm);
        assert_eq!(reopened.edge(), vec![child.id()]);
        let stored = reopened.get_vtx(&root.id()).unwrap();
        assert_eq!(stored.status(), Status::Accepted);
        assert_eq!(stored.txs().unwrap()[0].id(), tx.id());
    }

    #[test]
    fn test_child_of_max_height_vertex_rejected() {
        let db = Arc::new(MemDb::new());
        let vm = Arc::new(TestDagVm::default());
        let tx = TestTx::new(1, vec![], vec![]);
        vm.add_parseable(tx.clone());
        let manager = serializer(&db, &vm);

        let codecs = Codecs::new().unwrap();
        let tall = StatelessVertex::build(
            codecs.vertices(),
            chain_id(),
            u64::MAX,
            Vec::new(),
            vec![tx.bytes()],
        )
        .unwrap();
        let parent = manager.parse_vtx(tall.bytes()).unwrap();
        assert_eq!(parent.height(), u64::MAX);

        assert!(matches!(
            manager.build_stop_vtx(vec![parent.id()]),
            Err(VmError::Invalid(_))
        ));
        assert!(matches!(
            manager.build_vtx(vec![parent.id()], vec![tx.clone()]),
            Err(VmError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_vertex_not_found() {
        let db = Arc::new(MemDb::new());
        let vm = Arc::new(TestDagVm::default());
        let manager = serializer(&db, &vm);
        let id = Id::from_hash(b"missing");
        assert!(matches!(manager.get_vtx(&id), Err(VmError::NotFound(missing)) if missing == id));
        assert!(manager.build_vtx(vec![id], Vec::new()).is_err());
    }
}
