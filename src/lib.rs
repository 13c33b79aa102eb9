pub mod db;
pub mod error;
pub mod graph;
pub mod logging;
pub mod model;
pub mod schema;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use crate::db::{GraphDb, GraphDbOptions, SyncMode};
pub use crate::error::{GraphError, Result};
pub use crate::graph::bulk::{BulkLoadBatch, EdgeBatch, VertexBatch};
pub use crate::graph::fragment::{EndpointPolicy, Fragment};
pub use crate::model::{PropType, Value};
pub use crate::schema::{EdgeStrategy, Relation, Schema};
pub use crate::storage::csr::EdgeRecord;
pub use crate::txn::{InsertTransaction, ReadTransaction, UpdateTransaction};
pub use crate::types::{EdgeTypeId, LabelId, PropId, Timestamp, VertexId};
