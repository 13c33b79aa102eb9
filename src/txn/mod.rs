//! Transaction objects: one writer at a time, unbounded snapshot readers.
//!
//! Insert and update transactions apply their mutations eagerly and become
//! durable and visible at commit; there is no abort path once staging has
//! begun (failure mid-staging leaves the transaction unpublishable and is a
//! programming error, surfaced by the drop check).

use parking_lot::MutexGuard;
use smallvec::SmallVec;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

use crate::db::{GraphDb, SyncMode};
use crate::error::{GraphError, Result};
use crate::graph::fragment::EndpointPolicy;
use crate::model::Value;
use crate::storage::arena::EpochGuard;
use crate::storage::csr::EdgeIter;
use crate::types::{EdgeTypeId, LabelId, PropId, Timestamp, VertexId};
use crate::wal::WalOp;

/// Snapshot reader. All reads observe the state published at construction
/// time; edges inserted by later commits are invisible.
pub struct ReadTransaction<'db> {
    db: &'db GraphDb,
    ts: Timestamp,
    guard: EpochGuard<'db>,
}

impl<'db> ReadTransaction<'db> {
    pub(crate) fn begin(db: &'db GraphDb) -> Self {
        let ts = Timestamp(db.latest_ts.load(Ordering::Acquire));
        let guard = db.fragment.arena().enter();
        Self { db, ts, guard }
    }

    /// The snapshot timestamp this reader observes.
    pub fn snapshot_ts(&self) -> Timestamp {
        self.ts
    }

    /// Resolves an external key to its vid.
    pub fn get_vertex(&self, label: LabelId, key: i64) -> Option<VertexId> {
        self.db.fragment.get_vertex(label, key)
    }

    /// Reads one property cell.
    pub fn get_property(&self, label: LabelId, vid: VertexId, prop: PropId) -> Result<Value> {
        self.db.fragment.get_property(label, vid, prop)
    }

    /// Reads the full property row of a vertex.
    pub fn properties(&self, label: LabelId, vid: VertexId) -> Result<Vec<Value>> {
        self.db.fragment.properties(label, vid)
    }

    /// Number of vertices in `label`.
    pub fn vertex_num(&self, label: LabelId) -> u32 {
        self.db.fragment.vertex_num(label)
    }

    /// Outgoing edges of `src_vid` visible at this snapshot.
    pub fn out_edges(
        &self,
        src_label: LabelId,
        src_vid: VertexId,
        edge: EdgeTypeId,
        dst_label: LabelId,
    ) -> Result<EdgeIter<'_>> {
        self.db
            .fragment
            .out_edges(src_label, src_vid, edge, dst_label, self.ts, &self.guard)
    }

    /// Incoming edges of `dst_vid` visible at this snapshot.
    pub fn in_edges(
        &self,
        dst_label: LabelId,
        dst_vid: VertexId,
        edge: EdgeTypeId,
        src_label: LabelId,
    ) -> Result<EdgeIter<'_>> {
        self.db
            .fragment
            .in_edges(dst_label, dst_vid, edge, src_label, self.ts, &self.guard)
    }
}

/// Writer-exclusive insert transaction.
///
/// Mutations apply eagerly and are tagged with the transaction's commit
/// timestamp; [`commit`](Self::commit) appends the staged WAL batch, syncs
/// it, and release-publishes the timestamp. A transaction that staged work
/// must be committed: dropping it otherwise panics.
pub struct InsertTransaction<'db> {
    db: &'db GraphDb,
    _writer: MutexGuard<'db, ()>,
    ts: Timestamp,
    batch: SmallVec<[WalOp; 8]>,
    committed: bool,
}

impl<'db> InsertTransaction<'db> {
    pub(crate) fn begin(db: &'db GraphDb) -> Self {
        let writer = db.writer.lock();
        let ts = Timestamp(db.latest_ts.load(Ordering::Acquire)).next();
        debug!(ts = %ts, "insert transaction started");
        Self {
            db,
            _writer: writer,
            ts,
            batch: SmallVec::new(),
            committed: false,
        }
    }

    /// The commit timestamp assigned to this transaction.
    pub fn commit_ts(&self) -> Timestamp {
        self.ts
    }

    /// Inserts a vertex; `props` covers the non-key columns in order.
    pub fn add_vertex(&mut self, label: LabelId, key: i64, props: &[Value]) -> Result<VertexId> {
        let vid = self.db.fragment.add_vertex(label, key, props)?;
        self.batch.push(WalOp::AddVertex {
            label,
            key,
            props: props.to_vec(),
        });
        Ok(vid)
    }

    /// Inserts an edge between two external keys.
    #[allow(clippy::too_many_arguments)]
    pub fn add_edge(
        &mut self,
        edge: EdgeTypeId,
        src_label: LabelId,
        src_key: i64,
        dst_label: LabelId,
        dst_key: i64,
        prop: Option<Value>,
        policy: EndpointPolicy,
    ) -> Result<()> {
        self.db.fragment.add_edge(
            edge,
            src_label,
            src_key,
            dst_label,
            dst_key,
            prop.as_ref(),
            self.ts,
            policy,
        )?;
        self.batch.push(WalOp::AddEdge {
            edge,
            src_label,
            src_key,
            dst_label,
            dst_key,
            prop,
        });
        Ok(())
    }

    /// Makes the staged batch durable and publishes the commit timestamp.
    ///
    /// The staged mutations are already applied in memory, so a WAL write or
    /// sync failure here means the in-memory and durable states have
    /// diverged beyond repair: the process logs the failure and aborts.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        if !self.batch.is_empty() {
            if let Err(err) = self.append_durable() {
                error!(
                    ts = %self.ts,
                    ops = self.batch.len(),
                    %err,
                    "WAL write failed with mutations already applied; aborting"
                );
                std::process::abort();
            }
        }
        self.db.latest_ts.store(self.ts.0, Ordering::Release);
        debug!(ts = %self.ts, ops = self.batch.len(), "insert transaction committed");
        self.db.fragment.arena().reclaim();
        Ok(())
    }

    fn append_durable(&self) -> Result<()> {
        self.db.wal.append_batch(self.ts, &self.batch)?;
        if self.db.sync_mode == SyncMode::Immediate {
            self.db.wal.sync()?;
        }
        Ok(())
    }

    fn stage_update(&mut self, label: LabelId, key: i64, prop: PropId, value: Value) -> Result<()> {
        self.db
            .fragment
            .update_vertex_prop(label, key, prop, &value)?;
        self.batch.push(WalOp::UpdateVertexProp {
            label,
            key,
            prop,
            value,
        });
        Ok(())
    }
}

impl Drop for InsertTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.batch.is_empty() {
            warn!(ts = %self.ts, ops = self.batch.len(), "write transaction dropped uncommitted");
            if !std::thread::panicking() {
                panic!("write transaction at ts {} dropped without commit", self.ts);
            }
        }
    }
}

/// Writer-exclusive transaction that additionally permits vertex-property
/// overwrites at existing vids.
///
/// Overwrites are not versioned: a reader may observe the pre- or
/// post-update value until the commit publishes.
pub struct UpdateTransaction<'db> {
    inner: InsertTransaction<'db>,
}

impl<'db> UpdateTransaction<'db> {
    pub(crate) fn begin(db: &'db GraphDb) -> Self {
        Self {
            inner: InsertTransaction::begin(db),
        }
    }

    /// The commit timestamp assigned to this transaction.
    pub fn commit_ts(&self) -> Timestamp {
        self.inner.commit_ts()
    }

    /// Inserts a vertex; `props` covers the non-key columns in order.
    pub fn add_vertex(&mut self, label: LabelId, key: i64, props: &[Value]) -> Result<VertexId> {
        self.inner.add_vertex(label, key, props)
    }

    /// Inserts an edge between two external keys.
    #[allow(clippy::too_many_arguments)]
    pub fn add_edge(
        &mut self,
        edge: EdgeTypeId,
        src_label: LabelId,
        src_key: i64,
        dst_label: LabelId,
        dst_key: i64,
        prop: Option<Value>,
        policy: EndpointPolicy,
    ) -> Result<()> {
        self.inner
            .add_edge(edge, src_label, src_key, dst_label, dst_key, prop, policy)
    }

    /// Overwrites one property cell of the vertex keyed `key`.
    pub fn update_vertex(
        &mut self,
        label: LabelId,
        key: i64,
        prop: PropId,
        value: Value,
    ) -> Result<()> {
        if prop == PropId(0) {
            return Err(GraphError::InvalidArgument(
                "primary key column is immutable".into(),
            ));
        }
        self.inner.stage_update(label, key, prop, value)
    }

    /// Makes the staged batch durable and publishes the commit timestamp.
    pub fn commit(self) -> Result<()> {
        self.inner.commit()
    }
}
