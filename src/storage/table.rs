use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{GraphError, Result};
use crate::model::{PropType, Value, STR_SLOT_WIDTH};
use crate::schema::PropSpec;
use crate::storage::extent::Extent;
use crate::types::{PropId, VertexId};

/// Minimum blob heap reservation.
const MIN_BLOB_BYTES: usize = 1 << 20;
/// Average string budget per row used to size the blob reservation.
const BLOB_BYTES_PER_ROW: usize = 64;

/// Append-only byte heap backing one string column.
struct BlobHeap {
    extent: Extent,
    cursor: AtomicU64,
}

impl BlobHeap {
    fn new(max_vertex_num: u32) -> Result<Self> {
        let capacity = (max_vertex_num as usize)
            .saturating_mul(BLOB_BYTES_PER_ROW)
            .max(MIN_BLOB_BYTES);
        Ok(Self {
            extent: Extent::anon(capacity)?,
            cursor: AtomicU64::new(0),
        })
    }

    /// Appends `bytes` and returns their offset. Writer-only.
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        let offset = self.cursor.load(Ordering::Relaxed);
        let end = offset as usize + bytes.len();
        if end > self.extent.len() {
            return Err(GraphError::CapacityExceeded("string blob heap full"));
        }
        self.extent.write_bytes(offset as usize, bytes);
        self.cursor.store(end as u64, Ordering::Release);
        Ok(offset)
    }

    fn read(&self, offset: u64, len: u32) -> Result<&[u8]> {
        let end = offset as usize + len as usize;
        if end > self.extent.len() {
            return Err(GraphError::Corruption("string slot outside blob heap"));
        }
        Ok(self.extent.slice::<u8>(offset as usize, len as usize))
    }
}

struct Column {
    ty: PropType,
    extent: Extent,
    blob: Option<BlobHeap>,
}

/// Per-label columnar vertex property store.
///
/// Each column is one fixed extent of `max_vertex_num * width(ty)` bytes;
/// row `vid` of a column sits at `vid * width`. String columns store
/// `(offset: u64, len: u32)` slots into an append-only blob heap. All
/// mutation is writer-only; readers address only rows below the label's
/// published vertex count.
pub struct Table {
    columns: Vec<Column>,
    max_vertex_num: u32,
}

impl Table {
    /// Creates an empty table with one column per property spec.
    pub fn new(props: &[PropSpec], max_vertex_num: u32) -> Result<Self> {
        let mut columns = Vec::with_capacity(props.len());
        for spec in props {
            let extent = Extent::anon((max_vertex_num as usize).max(1) * spec.ty.width())?;
            let blob = if spec.ty == PropType::Str {
                Some(BlobHeap::new(max_vertex_num)?)
            } else {
                None
            };
            columns.push(Column {
                ty: spec.ty,
                extent,
                blob,
            });
        }
        Ok(Self {
            columns,
            max_vertex_num,
        })
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Type of column `col`.
    pub fn column_type(&self, col: PropId) -> Result<PropType> {
        self.column(col).map(|c| c.ty)
    }

    /// Writes `value` into `(col, vid)`. Writer-only.
    pub fn set(&self, col: PropId, vid: VertexId, value: &Value) -> Result<()> {
        if vid.0 >= self.max_vertex_num {
            return Err(GraphError::CapacityExceeded("table row beyond max_vertex_num"));
        }
        let column = self.column(col)?;
        if !value.matches(column.ty) {
            return Err(GraphError::InvalidArgument(format!(
                "value {value:?} does not match column type {}",
                column.ty
            )));
        }
        let pos = vid.0 as usize * column.ty.width();
        match (column.ty, value) {
            (PropType::Str, Value::Str(s)) => {
                let blob = column.blob.as_ref().expect("string column has blob");
                let offset = blob.append(s.as_bytes())?;
                let mut slot = [0u8; STR_SLOT_WIDTH];
                slot[..8].copy_from_slice(&offset.to_le_bytes());
                slot[8..].copy_from_slice(&(s.len() as u32).to_le_bytes());
                column.extent.write_bytes(pos, &slot);
            }
            (PropType::Str, Value::Null) => {
                column.extent.write_bytes(pos, &[0u8; STR_SLOT_WIDTH]);
            }
            (ty, value) => {
                let mut cell = [0u8; 8];
                value.encode_fixed(ty, &mut cell[..ty.width()])?;
                column.extent.write_bytes(pos, &cell[..ty.width()]);
            }
        }
        Ok(())
    }

    /// Reads the value at `(col, vid)`.
    ///
    /// A never-written numeric cell reads as zero and a never-written string
    /// cell as the empty string; fixed-width columns do not track nulls.
    pub fn get(&self, col: PropId, vid: VertexId) -> Result<Value> {
        if vid.0 >= self.max_vertex_num {
            return Err(GraphError::CapacityExceeded("table row beyond max_vertex_num"));
        }
        let column = self.column(col)?;
        let pos = vid.0 as usize * column.ty.width();
        if column.ty == PropType::Str {
            let mut slot = [0u8; STR_SLOT_WIDTH];
            column.extent.read_bytes(pos, &mut slot);
            let offset = u64::from_le_bytes(slot[..8].try_into().unwrap());
            let len = u32::from_le_bytes(slot[8..].try_into().unwrap());
            let blob = column.blob.as_ref().expect("string column has blob");
            let bytes = blob.read(offset, len)?;
            let text = std::str::from_utf8(bytes)
                .map_err(|_| GraphError::Corruption("string cell is not utf-8"))?;
            return Ok(Value::Str(text.to_string()));
        }
        let mut cell = [0u8; 8];
        column.extent.read_bytes(pos, &mut cell[..column.ty.width()]);
        Value::decode_fixed(column.ty, &cell[..column.ty.width()])
    }

    /// Iterates column `col` over rows `[0, n)` in vid order.
    pub fn iter_column(
        &self,
        col: PropId,
        n: u32,
    ) -> Result<impl Iterator<Item = Result<Value>> + '_> {
        self.column(col)?;
        Ok((0..n).map(move |vid| self.get(col, VertexId(vid))))
    }

    /// Reads the full row at `vid` in column order.
    pub fn row(&self, vid: VertexId) -> Result<Vec<Value>> {
        (0..self.columns.len())
            .map(|c| self.get(PropId(c as u32), vid))
            .collect()
    }

    /// Dumps the first `n` rows of every column; string columns also dump
    /// their blob prefix as `<path>.blob`.
    pub fn dump(&self, dir: &Path, label_name: &str, n: u32) -> Result<()> {
        for (idx, column) in self.columns.iter().enumerate() {
            let path = dir.join(format!("{label_name}.col{idx}"));
            column.extent.dump(&path, n as usize * column.ty.width())?;
            if let Some(blob) = &column.blob {
                let used = blob.cursor.load(Ordering::Acquire) as usize;
                blob.extent.dump(path.with_extension(format!("col{idx}.blob")), used)?;
            }
        }
        Ok(())
    }

    /// Loads a table dumped by [`dump`](Self::dump).
    pub fn load(
        dir: &Path,
        label_name: &str,
        props: &[PropSpec],
        max_vertex_num: u32,
    ) -> Result<Self> {
        let mut columns = Vec::with_capacity(props.len());
        for (idx, spec) in props.iter().enumerate() {
            let path = dir.join(format!("{label_name}.col{idx}"));
            let capacity = (max_vertex_num as usize).max(1) * spec.ty.width();
            let extent = Extent::load(&path, capacity)?;
            let blob = if spec.ty == PropType::Str {
                let blob_path = path.with_extension(format!("col{idx}.blob"));
                let used = std::fs::metadata(&blob_path)?.len();
                let heap_capacity = (max_vertex_num as usize)
                    .saturating_mul(BLOB_BYTES_PER_ROW)
                    .max(MIN_BLOB_BYTES);
                if used as usize > heap_capacity {
                    return Err(GraphError::Corruption("blob snapshot exceeds reservation"));
                }
                let heap = BlobHeap {
                    extent: Extent::load(&blob_path, heap_capacity)?,
                    cursor: AtomicU64::new(used),
                };
                Some(heap)
            } else {
                None
            };
            columns.push(Column {
                ty: spec.ty,
                extent,
                blob,
            });
        }
        Ok(Self {
            columns,
            max_vertex_num,
        })
    }

    fn column(&self, col: PropId) -> Result<&Column> {
        self.columns
            .get(col.0 as usize)
            .ok_or_else(|| GraphError::InvalidArgument(format!("unknown column {col}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn person_props() -> Vec<PropSpec> {
        vec![
            PropSpec {
                name: "id".into(),
                ty: PropType::Int64,
            },
            PropSpec {
                name: "name".into(),
                ty: PropType::Str,
            },
            PropSpec {
                name: "age".into(),
                ty: PropType::Int32,
            },
        ]
    }

    #[test]
    fn set_get_mixed_columns() {
        let table = Table::new(&person_props(), 8).unwrap();
        table.set(PropId(0), VertexId(0), &Value::Int64(42)).unwrap();
        table
            .set(PropId(1), VertexId(0), &Value::Str("ada".into()))
            .unwrap();
        table.set(PropId(2), VertexId(0), &Value::Int32(36)).unwrap();

        assert_eq!(table.get(PropId(0), VertexId(0)).unwrap(), Value::Int64(42));
        assert_eq!(
            table.get(PropId(1), VertexId(0)).unwrap(),
            Value::Str("ada".into())
        );
        assert_eq!(table.get(PropId(2), VertexId(0)).unwrap(), Value::Int32(36));
    }

    #[test]
    fn unwritten_rows_read_zeroed() {
        let table = Table::new(&person_props(), 4).unwrap();
        assert_eq!(table.get(PropId(0), VertexId(3)).unwrap(), Value::Int64(0));
        assert_eq!(
            table.get(PropId(1), VertexId(3)).unwrap(),
            Value::Str(String::new())
        );
    }

    #[test]
    fn row_bound_enforced() {
        let table = Table::new(&person_props(), 2).unwrap();
        assert!(matches!(
            table.set(PropId(0), VertexId(2), &Value::Int64(1)),
            Err(GraphError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn string_overwrite_appends() {
        let table = Table::new(&person_props(), 4).unwrap();
        table
            .set(PropId(1), VertexId(0), &Value::Str("first".into()))
            .unwrap();
        table
            .set(PropId(1), VertexId(0), &Value::Str("second".into()))
            .unwrap();
        assert_eq!(
            table.get(PropId(1), VertexId(0)).unwrap(),
            Value::Str("second".into())
        );
    }

    #[test]
    fn iter_column_in_vid_order() {
        let table = Table::new(&person_props(), 4).unwrap();
        for vid in 0..3u32 {
            table
                .set(PropId(0), VertexId(vid), &Value::Int64(vid as i64 * 10))
                .unwrap();
        }
        let values: Vec<_> = table
            .iter_column(PropId(0), 3)
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(
            values,
            vec![Value::Int64(0), Value::Int64(10), Value::Int64(20)]
        );
    }

    #[test]
    fn dump_load_roundtrip() {
        let dir = tempdir().unwrap();
        let table = Table::new(&person_props(), 8).unwrap();
        table.set(PropId(0), VertexId(0), &Value::Int64(7)).unwrap();
        table
            .set(PropId(1), VertexId(0), &Value::Str("grace".into()))
            .unwrap();
        table.set(PropId(0), VertexId(1), &Value::Int64(9)).unwrap();
        table.dump(dir.path(), "person", 2).unwrap();

        let loaded = Table::load(dir.path(), "person", &person_props(), 8).unwrap();
        assert_eq!(loaded.get(PropId(0), VertexId(0)).unwrap(), Value::Int64(7));
        assert_eq!(
            loaded.get(PropId(1), VertexId(0)).unwrap(),
            Value::Str("grace".into())
        );
        assert_eq!(loaded.get(PropId(0), VertexId(1)).unwrap(), Value::Int64(9));
        // Appends continue after the recovered cursor.
        loaded
            .set(PropId(1), VertexId(1), &Value::Str("hopper".into()))
            .unwrap();
        assert_eq!(
            loaded.get(PropId(1), VertexId(1)).unwrap(),
            Value::Str("hopper".into())
        );
    }
}
