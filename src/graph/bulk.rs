//! Cold-start batch ingest input.
//!
//! Bulk loaders parse raw tabular files into a [`BulkLoadBatch`]; the core
//! applies the whole batch under one commit timestamp via
//! [`GraphDb::bulk_load`](crate::db::GraphDb::bulk_load).

use crate::model::Value;
use crate::types::{EdgeTypeId, LabelId};

/// Vertex rows for one label: `(primary key, non-key property values)`.
#[derive(Clone, Debug, Default)]
pub struct VertexBatch {
    pub label: LabelId,
    pub rows: Vec<(i64, Vec<Value>)>,
}

/// Edge rows for one triplet: `(src key, dst key, edge property)`.
#[derive(Clone, Debug)]
pub struct EdgeBatch {
    pub edge: EdgeTypeId,
    pub src_label: LabelId,
    pub dst_label: LabelId,
    pub rows: Vec<(i64, i64, Option<Value>)>,
}

/// One cold-start ingest unit. Vertices apply before edges; missing edge
/// endpoints are upserted.
#[derive(Clone, Debug, Default)]
pub struct BulkLoadBatch {
    pub vertices: Vec<VertexBatch>,
    pub edges: Vec<EdgeBatch>,
}

impl BulkLoadBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of staged rows.
    pub fn len(&self) -> usize {
        self.vertices.iter().map(|v| v.rows.len()).sum::<usize>()
            + self.edges.iter().map(|e| e.rows.len()).sum::<usize>()
    }

    /// Whether the batch stages nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
