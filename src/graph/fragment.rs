use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::model::{PropType, Value};
use crate::schema::{EdgeStrategy, Schema, TripletSpec};
use crate::storage::arena::{EpochArena, EpochGuard};
use crate::storage::csr::{EdgeIter, MutableCsr};
use crate::storage::indexer::Indexer;
use crate::storage::snapshot;
use crate::storage::table::Table;
use crate::types::{EdgeTypeId, LabelId, PropId, Timestamp, VertexId};

/// How edge insertion treats a missing endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EndpointPolicy {
    /// Reject the edge with `UnknownVertex`.
    Strict,
    /// Create the endpoint with null non-primary properties.
    Upsert,
}

struct VertexStore {
    indexer: Indexer,
    table: Table,
}

struct TripletStore {
    /// Outgoing lists, indexed by source vid. Absent under strategy None.
    outgoing: Option<MutableCsr>,
    /// Incoming lists, indexed by destination vid. Absent under strategy None.
    incoming: Option<MutableCsr>,
    prop: Option<PropType>,
}

/// The composite graph instance: schema, per-label indexers and tables, and
/// per-(triplet, direction) adjacency storage.
///
/// All mutation entry points are writer-only; the transaction layer
/// serializes them. Read entry points are safe under concurrent mutation and
/// filter edge visibility by snapshot timestamp.
pub struct Fragment {
    schema: Arc<Schema>,
    vertices: Vec<VertexStore>,
    triplets: FxHashMap<(u32, u32, u32), TripletStore>,
    arena: Arc<EpochArena>,
}

impl Fragment {
    /// Creates an empty fragment for `schema`.
    pub fn new(schema: Arc<Schema>, arena: Arc<EpochArena>) -> Result<Self> {
        let mut vertices = Vec::with_capacity(schema.vertex_labels().len());
        for label in schema.vertex_labels() {
            vertices.push(VertexStore {
                indexer: Indexer::new(label.max_vertex_num)?,
                table: Table::new(&label.props, label.max_vertex_num)?,
            });
        }
        let mut triplets = FxHashMap::default();
        for (edge_idx, edge) in schema.edge_labels().iter().enumerate() {
            let prop = edge.prop.as_ref().map(|p| p.ty);
            for triplet in &edge.triplets {
                let store = Self::build_triplet(&schema, triplet, prop, &arena)?;
                triplets.insert(
                    (edge_idx as u32, triplet.src.0, triplet.dst.0),
                    store,
                );
            }
        }
        Ok(Self {
            schema,
            vertices,
            triplets,
            arena,
        })
    }

    fn build_triplet(
        schema: &Schema,
        triplet: &TripletSpec,
        prop: Option<PropType>,
        arena: &Arc<EpochArena>,
    ) -> Result<TripletStore> {
        let src_cap = schema.vertex_label(triplet.src).max_vertex_num;
        let dst_cap = schema.vertex_label(triplet.dst).max_vertex_num;
        let outgoing = match triplet.outgoing {
            EdgeStrategy::None => None,
            strategy => Some(MutableCsr::new(strategy, prop, src_cap, Arc::clone(arena))?),
        };
        let incoming = match triplet.incoming {
            EdgeStrategy::None => None,
            strategy => Some(MutableCsr::new(strategy, prop, dst_cap, Arc::clone(arena))?),
        };
        Ok(TripletStore {
            outgoing,
            incoming,
            prop,
        })
    }

    /// The compiled schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The arena protecting adjacency buffers.
    pub fn arena(&self) -> &Arc<EpochArena> {
        &self.arena
    }

    /// Resolves a vertex label name.
    pub fn label_id(&self, name: &str) -> Option<LabelId> {
        self.schema.label_id(name)
    }

    /// Resolves an edge label name.
    pub fn edge_type_id(&self, name: &str) -> Option<EdgeTypeId> {
        self.schema.edge_type_id(name)
    }

    /// Number of vertices assigned in `label`.
    pub fn vertex_num(&self, label: LabelId) -> u32 {
        self.store(label).map_or(0, |s| s.indexer.size())
    }

    /// Resolves an external key to its vid.
    pub fn get_vertex(&self, label: LabelId, key: i64) -> Option<VertexId> {
        self.store(label).ok()?.indexer.lookup(key)
    }

    /// Reads one property cell.
    pub fn get_property(&self, label: LabelId, vid: VertexId, prop: PropId) -> Result<Value> {
        let store = self.store(label)?;
        if vid.0 >= store.indexer.size() {
            return Err(GraphError::InvalidArgument(format!(
                "vid {vid} not assigned in label {label}"
            )));
        }
        store.table.get(prop, vid)
    }

    /// Reads the full property row of a vertex in column order.
    pub fn properties(&self, label: LabelId, vid: VertexId) -> Result<Vec<Value>> {
        let store = self.store(label)?;
        if vid.0 >= store.indexer.size() {
            return Err(GraphError::InvalidArgument(format!(
                "vid {vid} not assigned in label {label}"
            )));
        }
        store.table.row(vid)
    }

    /// Inserts a vertex with `props` covering the non-key columns in order.
    /// Writer-only; fails on a duplicate key with no state change.
    pub fn add_vertex(&self, label: LabelId, key: i64, props: &[Value]) -> Result<VertexId> {
        let store = self.store(label)?;
        let spec = self.schema.vertex_label(label);
        if props.len() != spec.props.len() - 1 {
            return Err(GraphError::InvalidArgument(format!(
                "label {:?} expects {} non-key properties, got {}",
                spec.name,
                spec.props.len() - 1,
                props.len()
            )));
        }
        if store.indexer.lookup(key).is_some() {
            return Err(GraphError::DuplicateKey(key));
        }
        if store.indexer.size() >= spec.max_vertex_num {
            return Err(GraphError::CapacityExceeded("vertex label full"));
        }
        // Stage the whole row at the vid the indexer will assign, then
        // publish the key: a concurrent lookup never observes an unwritten
        // row.
        let staged = VertexId(store.indexer.size());
        store.table.set(PropId(0), staged, &Value::Int64(key))?;
        for (idx, value) in props.iter().enumerate() {
            store.table.set(PropId(idx as u32 + 1), staged, value)?;
        }
        let vid = store.indexer.insert(key)?;
        debug_assert_eq!(vid, staged);
        Ok(vid)
    }

    /// Overwrites one property cell of an existing vertex. Writer-only; the
    /// overwrite is not versioned.
    pub fn update_vertex_prop(
        &self,
        label: LabelId,
        key: i64,
        prop: PropId,
        value: &Value,
    ) -> Result<VertexId> {
        let store = self.store(label)?;
        let vid = store
            .indexer
            .lookup(key)
            .ok_or(GraphError::UnknownVertex(key))?;
        if prop == PropId(0) {
            return Err(GraphError::InvalidArgument(
                "primary key column is immutable".into(),
            ));
        }
        store.table.set(prop, vid, value)?;
        Ok(vid)
    }

    /// Inserts an edge between two external keys, recording the outgoing
    /// list of the source and the incoming list of the destination with one
    /// timestamp. Writer-only.
    #[allow(clippy::too_many_arguments)]
    pub fn add_edge(
        &self,
        edge: EdgeTypeId,
        src_label: LabelId,
        src_key: i64,
        dst_label: LabelId,
        dst_key: i64,
        prop: Option<&Value>,
        ts: Timestamp,
        policy: EndpointPolicy,
    ) -> Result<()> {
        let triplet = self.triplet(edge, src_label, dst_label)?;
        match (triplet.prop, prop) {
            (None, Some(_)) => {
                return Err(GraphError::InvalidArgument(
                    "edge label carries no property".into(),
                ))
            }
            (Some(ty), Some(value)) if !value.matches(ty) => {
                return Err(GraphError::InvalidArgument(format!(
                    "edge property {value:?} does not match type {ty}"
                )))
            }
            _ => {}
        }
        let src = self.resolve_endpoint(src_label, src_key, policy)?;
        let dst = self.resolve_endpoint(dst_label, dst_key, policy)?;
        if let Some(outgoing) = &triplet.outgoing {
            outgoing.insert(src, dst, ts, prop)?;
        }
        if let Some(incoming) = &triplet.incoming {
            incoming.insert(dst, src, ts, prop)?;
        }
        Ok(())
    }

    fn resolve_endpoint(
        &self,
        label: LabelId,
        key: i64,
        policy: EndpointPolicy,
    ) -> Result<VertexId> {
        if let Some(vid) = self.get_vertex(label, key) {
            return Ok(vid);
        }
        match policy {
            EndpointPolicy::Strict => Err(GraphError::UnknownVertex(key)),
            EndpointPolicy::Upsert => {
                let spec = self.schema.vertex_label(label);
                let nulls = vec![Value::Null; spec.props.len() - 1];
                debug!(label = %label, key, "upsert edge endpoint");
                self.add_vertex(label, key, &nulls)
            }
        }
    }

    /// Scans outgoing edges of `src_vid` with timestamps at most `ts`.
    pub fn out_edges<'g>(
        &self,
        src_label: LabelId,
        src_vid: VertexId,
        edge: EdgeTypeId,
        dst_label: LabelId,
        ts: Timestamp,
        guard: &'g EpochGuard<'_>,
    ) -> Result<EdgeIter<'g>> {
        let triplet = self.triplet(edge, src_label, dst_label)?;
        Ok(match &triplet.outgoing {
            Some(csr) => csr.edges_of(src_vid, ts, guard),
            None => EdgeIter::empty(ts),
        })
    }

    /// Scans incoming edges of `dst_vid` with timestamps at most `ts`.
    pub fn in_edges<'g>(
        &self,
        dst_label: LabelId,
        dst_vid: VertexId,
        edge: EdgeTypeId,
        src_label: LabelId,
        ts: Timestamp,
        guard: &'g EpochGuard<'_>,
    ) -> Result<EdgeIter<'g>> {
        let triplet = self.triplet(edge, src_label, dst_label)?;
        Ok(match &triplet.incoming {
            Some(csr) => csr.edges_of(dst_vid, ts, guard),
            None => EdgeIter::empty(ts),
        })
    }

    /// Dumps all extents plus the manifest into `dir`.
    pub fn dump_snapshot(&self, dir: &Path, latest_ts: Timestamp) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut counts = Vec::with_capacity(self.vertices.len());
        for (idx, store) in self.vertices.iter().enumerate() {
            let label = self.schema.vertex_label(LabelId(idx as u32));
            let n = store.indexer.size();
            store.indexer.dump(dir.join(format!("{}.indexer", label.name)))?;
            store.table.dump(dir, &label.name, n)?;
            counts.push(n);
        }
        for (&(edge, src, dst), store) in &self.triplets {
            let name = self.triplet_name(EdgeTypeId(edge), LabelId(src), LabelId(dst));
            if let Some(outgoing) = &store.outgoing {
                outgoing.dump(dir, &format!("{name}.oe"), self.vertex_num(LabelId(src)))?;
            }
            if let Some(incoming) = &store.incoming {
                incoming.dump(dir, &format!("{name}.ie"), self.vertex_num(LabelId(dst)))?;
            }
        }
        snapshot::write_meta(dir, latest_ts, &counts)?;
        debug!(dir = %dir.display(), ts = %latest_ts, "snapshot dumped");
        Ok(())
    }

    /// Loads a fragment from a snapshot directory dumped by
    /// [`dump_snapshot`](Self::dump_snapshot). Returns the fragment and the
    /// timestamp the snapshot was taken at.
    pub fn load_snapshot(
        dir: &Path,
        schema: Arc<Schema>,
        arena: Arc<EpochArena>,
    ) -> Result<(Self, Timestamp)> {
        let meta = snapshot::read_meta(dir)?;
        if meta.vertex_counts.len() != schema.vertex_labels().len() {
            return Err(GraphError::Corruption("snapshot label count mismatch"));
        }
        let mut vertices = Vec::with_capacity(schema.vertex_labels().len());
        for (idx, label) in schema.vertex_labels().iter().enumerate() {
            let indexer = Indexer::load(
                dir.join(format!("{}.indexer", label.name)),
                label.max_vertex_num,
            )?;
            if indexer.size() != meta.vertex_counts[idx] {
                return Err(GraphError::Corruption("snapshot vertex count mismatch"));
            }
            let table = Table::load(dir, &label.name, &label.props, label.max_vertex_num)?;
            vertices.push(VertexStore { indexer, table });
        }
        let fragment = {
            let mut triplets = FxHashMap::default();
            for (edge_idx, edge) in schema.edge_labels().iter().enumerate() {
                let prop = edge.prop.as_ref().map(|p| p.ty);
                for triplet in &edge.triplets {
                    let name = format!(
                        "{}_{}_{}",
                        edge.name,
                        schema.vertex_label(triplet.src).name,
                        schema.vertex_label(triplet.dst).name
                    );
                    let src_cap = schema.vertex_label(triplet.src).max_vertex_num;
                    let dst_cap = schema.vertex_label(triplet.dst).max_vertex_num;
                    let outgoing = match triplet.outgoing {
                        EdgeStrategy::None => None,
                        strategy => Some(MutableCsr::load(
                            dir,
                            &format!("{name}.oe"),
                            strategy,
                            prop,
                            src_cap,
                            Arc::clone(&arena),
                        )?),
                    };
                    let incoming = match triplet.incoming {
                        EdgeStrategy::None => None,
                        strategy => Some(MutableCsr::load(
                            dir,
                            &format!("{name}.ie"),
                            strategy,
                            prop,
                            dst_cap,
                            Arc::clone(&arena),
                        )?),
                    };
                    triplets.insert(
                        (edge_idx as u32, triplet.src.0, triplet.dst.0),
                        TripletStore {
                            outgoing,
                            incoming,
                            prop,
                        },
                    );
                }
            }
            Self {
                schema,
                vertices,
                triplets,
                arena,
            }
        };
        Ok((fragment, meta.latest_ts))
    }

    fn triplet_name(&self, edge: EdgeTypeId, src: LabelId, dst: LabelId) -> String {
        format!(
            "{}_{}_{}",
            self.schema.edge_label(edge).name,
            self.schema.vertex_label(src).name,
            self.schema.vertex_label(dst).name
        )
    }

    fn store(&self, label: LabelId) -> Result<&VertexStore> {
        self.vertices
            .get(label.0 as usize)
            .ok_or_else(|| GraphError::InvalidArgument(format!("unknown label {label}")))
    }

    fn triplet(
        &self,
        edge: EdgeTypeId,
        src_label: LabelId,
        dst_label: LabelId,
    ) -> Result<&TripletStore> {
        self.triplets
            .get(&(edge.0, src_label.0, dst_label.0))
            .ok_or_else(|| {
                GraphError::InvalidArgument(format!(
                    "triplet ({edge}, {src_label}, {dst_label}) not in schema"
                ))
            })
    }
}
