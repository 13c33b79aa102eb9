//! Database facade: open/recover, transaction issuing, checkpointing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::graph::bulk::BulkLoadBatch;
use crate::graph::fragment::{EndpointPolicy, Fragment};
use crate::schema::Schema;
use crate::storage::arena::EpochArena;
use crate::storage::snapshot;
use crate::txn::{InsertTransaction, ReadTransaction, UpdateTransaction};
use crate::types::Timestamp;
use crate::wal::{Wal, WalOp};

const WAL_FILE: &str = "graph.wal";

/// Commit durability mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncMode {
    /// fsync the WAL at every commit.
    Immediate,
    /// Skip the fsync. A crash may lose the latest commits; for tests and
    /// bulk ingest only.
    Off,
}

/// Options controlling how a graph store opens.
#[derive(Clone, Debug)]
pub struct GraphDbOptions {
    /// Directory holding the snapshot files and the WAL.
    pub dir: PathBuf,
    /// Commit durability mode.
    pub sync_mode: SyncMode,
    /// Lock-free reader registrations available before readers fall back to
    /// a mutex slow path.
    pub reader_slots: usize,
}

impl GraphDbOptions {
    /// Defaults: immediate sync, 64 reader slots.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_mode: SyncMode::Immediate,
            reader_slots: 64,
        }
    }

    /// Sets the durability mode.
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }
}

/// An open graph store: one writer at a time, unbounded snapshot readers.
pub struct GraphDb {
    pub(crate) fragment: Arc<Fragment>,
    pub(crate) wal: Wal,
    pub(crate) latest_ts: AtomicU64,
    pub(crate) writer: Mutex<()>,
    pub(crate) sync_mode: SyncMode,
    dir: PathBuf,
}

impl GraphDb {
    /// Opens the store in `options.dir`, loading a snapshot if one is
    /// sealed there and replaying the WAL suffix on top of it.
    pub fn open(schema: Schema, options: GraphDbOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)?;
        let schema = Arc::new(schema);
        let arena = Arc::new(EpochArena::new(options.reader_slots));
        let (fragment, base_ts) = if snapshot::meta_exists(&options.dir) {
            let (fragment, ts) =
                Fragment::load_snapshot(&options.dir, Arc::clone(&schema), arena)?;
            debug!(ts = %ts, "snapshot loaded");
            (fragment, ts)
        } else {
            (Fragment::new(Arc::clone(&schema), arena)?, Timestamp::ZERO)
        };

        let (wal, replay) = Wal::open(options.dir.join(WAL_FILE))?;
        let mut latest = base_ts;
        let mut replayed = 0usize;
        for (ts, op) in replay {
            // Records at or below the snapshot timestamp were captured by
            // the dump; they remain only when a crash hit between the dump
            // and the WAL reset.
            if ts <= base_ts {
                continue;
            }
            apply_replayed(&fragment, ts, op)?;
            latest = latest.max(ts);
            replayed += 1;
        }
        info!(
            graph = schema.name(),
            dir = %options.dir.display(),
            base_ts = %base_ts,
            latest_ts = %latest,
            replayed,
            "graph store opened"
        );
        Ok(Self {
            fragment: Arc::new(fragment),
            wal,
            latest_ts: AtomicU64::new(latest.0),
            writer: Mutex::new(()),
            sync_mode: options.sync_mode,
            dir: options.dir,
        })
    }

    /// Opens the store with the schema document at `schema_path`.
    pub fn open_with_schema_file(
        schema_path: impl AsRef<Path>,
        options: GraphDbOptions,
    ) -> Result<Self> {
        let schema = Schema::from_yaml_file(schema_path)?;
        Self::open(schema, options)
    }

    /// The compiled schema.
    pub fn schema(&self) -> &Arc<Schema> {
        self.fragment.schema()
    }

    /// The composite graph instance, for read-only inspection.
    pub fn fragment(&self) -> &Arc<Fragment> {
        &self.fragment
    }

    /// The latest published commit timestamp.
    pub fn latest_ts(&self) -> Timestamp {
        Timestamp(self.latest_ts.load(Ordering::Acquire))
    }

    /// Begins a snapshot reader.
    pub fn read_txn(&self) -> ReadTransaction<'_> {
        ReadTransaction::begin(self)
    }

    /// Begins the writer-exclusive insert transaction.
    pub fn insert_txn(&self) -> InsertTransaction<'_> {
        InsertTransaction::begin(self)
    }

    /// Begins the writer-exclusive update transaction.
    pub fn update_txn(&self) -> UpdateTransaction<'_> {
        UpdateTransaction::begin(self)
    }

    /// Applies a cold-start batch under a single commit timestamp.
    pub fn bulk_load(&self, batch: BulkLoadBatch) -> Result<Timestamp> {
        let mut txn = self.insert_txn();
        let ts = txn.commit_ts();
        for vb in &batch.vertices {
            for (key, props) in &vb.rows {
                txn.add_vertex(vb.label, *key, props)?;
            }
        }
        for eb in &batch.edges {
            for (src_key, dst_key, prop) in &eb.rows {
                txn.add_edge(
                    eb.edge,
                    eb.src_label,
                    *src_key,
                    eb.dst_label,
                    *dst_key,
                    prop.clone(),
                    EndpointPolicy::Upsert,
                )?;
            }
        }
        txn.commit()?;
        Ok(ts)
    }

    /// Dumps a snapshot of the current state and truncates the WAL.
    ///
    /// Takes the writer role for the duration, so the dumped extents are
    /// mutually consistent; readers proceed concurrently.
    pub fn checkpoint(&self) -> Result<()> {
        let _writer = self.writer.lock();
        let ts = self.latest_ts();
        self.fragment.dump_snapshot(&self.dir, ts)?;
        self.wal.reset()?;
        info!(ts = %ts, dir = %self.dir.display(), "checkpoint complete");
        Ok(())
    }
}

fn apply_replayed(fragment: &Fragment, ts: Timestamp, op: WalOp) -> Result<()> {
    match op {
        WalOp::AddVertex { label, key, props } => {
            fragment.add_vertex(label, key, &props)?;
        }
        WalOp::AddEdge {
            edge,
            src_label,
            src_key,
            dst_label,
            dst_key,
            prop,
        } => {
            // Upsert on replay: endpoints created by an upsert edge insert
            // were never logged on their own.
            fragment.add_edge(
                edge,
                src_label,
                src_key,
                dst_label,
                dst_key,
                prop.as_ref(),
                ts,
                EndpointPolicy::Upsert,
            )?;
        }
        WalOp::UpdateVertexProp {
            label,
            key,
            prop,
            value,
        } => {
            fragment.update_vertex_prop(label, key, prop, &value)?;
        }
    }
    Ok(())
}
