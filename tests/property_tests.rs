use std::collections::HashSet;

use proptest::prelude::*;
use vesper::storage::arena::EpochArena;
use vesper::storage::indexer::Indexer;
use vesper::storage::table::Table;
use vesper::{PropId, PropType, Value, VertexId};

fn arb_cell_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int64),
        any::<f64>().prop_map(|f| Value::Double(if f.is_nan() { 0.0 } else { f })),
        any::<bool>().prop_map(Value::Bool),
        "[a-z0-9 ]{0,24}".prop_map(Value::Str),
    ]
}

proptest! {
    /// Assigned vids form the dense range `[0, n)` and every key round-trips
    /// through lookup, for any set of distinct keys in any order.
    #[test]
    fn indexer_assigns_dense_round_tripping_vids(
        keys in prop::collection::hash_set(any::<i64>().prop_filter("reserved", |&k| k != i64::MIN), 1..200)
    ) {
        let keys: Vec<i64> = keys.into_iter().collect();
        let indexer = Indexer::new(keys.len() as u32).unwrap();
        let mut assigned = Vec::new();
        for &key in &keys {
            assigned.push(indexer.insert(key).unwrap());
        }
        prop_assert_eq!(indexer.size() as usize, keys.len());
        let vids: HashSet<u32> = assigned.iter().map(|v| v.0).collect();
        prop_assert_eq!(&vids, &(0..keys.len() as u32).collect::<HashSet<_>>());
        for (key, vid) in keys.iter().zip(&assigned) {
            prop_assert_eq!(indexer.lookup(*key), Some(*vid));
        }
        // Re-inserting any key is a duplicate and burns no vid.
        for &key in keys.iter().take(8) {
            prop_assert!(indexer.insert(key).is_err());
        }
        prop_assert_eq!(indexer.size() as usize, keys.len());
    }

    /// Dump/load preserves every mapping and the vid counter.
    #[test]
    fn indexer_survives_dump_load(
        keys in prop::collection::hash_set(any::<i64>().prop_filter("reserved", |&k| k != i64::MIN), 1..100)
    ) {
        let keys: Vec<i64> = keys.into_iter().collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label.indexer");
        let indexer = Indexer::new(keys.len() as u32).unwrap();
        for &key in &keys {
            indexer.insert(key).unwrap();
        }
        indexer.dump(&path).unwrap();
        let loaded = Indexer::load(&path, keys.len() as u32).unwrap();
        prop_assert_eq!(loaded.size(), indexer.size());
        for &key in &keys {
            prop_assert_eq!(loaded.lookup(key), indexer.lookup(key));
        }
    }

    /// Whatever is written to a mixed-type row reads back identically, in
    /// memory and across a dump/load cycle.
    #[test]
    fn table_cells_round_trip(rows in prop::collection::vec(
        (any::<i64>(), arb_cell_value()), 1..50
    )) {
        use vesper::schema::PropSpec;

        let n = rows.len() as u32;
        let specs = vec![
            PropSpec { name: "id".into(), ty: PropType::Int64 },
            PropSpec { name: "i".into(), ty: PropType::Int64 },
            PropSpec { name: "f".into(), ty: PropType::Double },
            PropSpec { name: "b".into(), ty: PropType::Bool },
            PropSpec { name: "s".into(), ty: PropType::Str },
        ];
        let table = Table::new(&specs, n).unwrap();
        for (vid, (id, value)) in rows.iter().enumerate() {
            let vid = VertexId(vid as u32);
            table.set(PropId(0), vid, &Value::Int64(*id)).unwrap();
            let col = match value {
                Value::Int64(_) => PropId(1),
                Value::Double(_) => PropId(2),
                Value::Bool(_) => PropId(3),
                Value::Str(_) => PropId(4),
                _ => unreachable!(),
            };
            table.set(col, vid, value).unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        table.dump(dir.path(), "label", n).unwrap();
        let loaded = Table::load(dir.path(), "label", &specs, n).unwrap();
        for (vid, (id, value)) in rows.iter().enumerate() {
            let vid = VertexId(vid as u32);
            prop_assert_eq!(table.get(PropId(0), vid).unwrap(), Value::Int64(*id));
            prop_assert_eq!(loaded.get(PropId(0), vid).unwrap(), Value::Int64(*id));
            let col = match value {
                Value::Int64(_) => PropId(1),
                Value::Double(_) => PropId(2),
                Value::Bool(_) => PropId(3),
                Value::Str(_) => PropId(4),
                _ => unreachable!(),
            };
            prop_assert_eq!(&table.get(col, vid).unwrap(), value);
            prop_assert_eq!(&loaded.get(col, vid).unwrap(), value);
        }
    }

    /// Adjacency scans return exactly the inserted records in insertion
    /// order for any interleaving of sources.
    #[test]
    fn csr_preserves_insertion_order_per_source(
        inserts in prop::collection::vec((0u32..8, 0u32..64), 1..200)
    ) {
        use std::sync::Arc;
        use vesper::schema::EdgeStrategy;
        use vesper::storage::csr::MutableCsr;
        use vesper::Timestamp;

        let arena = Arc::new(EpochArena::new(4));
        let csr = MutableCsr::new(EdgeStrategy::Multiple, None, 8, Arc::clone(&arena)).unwrap();
        let mut expected: Vec<Vec<u32>> = vec![Vec::new(); 8];
        for (ts, &(src, dst)) in inserts.iter().enumerate() {
            csr.insert(VertexId(src), VertexId(dst), Timestamp(ts as u64 + 1), None).unwrap();
            expected[src as usize].push(dst);
        }
        let guard = arena.enter();
        for src in 0..8u32 {
            let scanned: Vec<u32> = csr
                .edges_of(VertexId(src), Timestamp(u64::MAX), &guard)
                .map(|r| r.nbr.0)
                .collect();
            prop_assert_eq!(&scanned, &expected[src as usize]);
        }
    }
}
