use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::Rng;
use tempfile::tempdir;
use vesper::{
    EndpointPolicy, GraphDb, GraphDbOptions, PropId, Result, Schema, SyncMode, Timestamp, Value,
    VertexId,
};

const NUM_READERS: usize = 4;
const EDGES_PER_TXN: usize = 500;
const EDGE_TXNS: usize = 40;
const TOTAL_EDGES: usize = EDGES_PER_TXN * EDGE_TXNS;

const SCHEMA: &str = r#"
name: hub
store_type: mutable_csr
schema:
  vertex_types:
    - type_name: person
      properties:
        - property_id: 0
          property_name: id
          property_type: { primitive_type: DT_SIGNED_INT64 }
      primary_keys: [id]
      x_csr_params: { max_vertex_num: 40000 }
  edge_types:
    - type_name: knows
      properties:
        - property_id: 0
          property_name: weight
          property_type: { primitive_type: DT_DOUBLE }
      vertex_type_pair_relations:
        - source_vertex: person
          destination_vertex: person
          relation: MANY_TO_MANY
"#;

fn open(dir: &std::path::Path) -> Result<GraphDb> {
    GraphDb::open(
        Schema::from_yaml_str(SCHEMA)?,
        GraphDbOptions::new(dir).sync_mode(SyncMode::Off),
    )
}

/// One writer grows a single adjacency list through many buffer generations
/// while readers continuously scan it lock-free. Every scan must observe a
/// clean prefix of the final list: records in insertion order, fully
/// initialized, with no duplicates and no skips.
#[test]
fn scans_observe_clean_prefixes_during_growth() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(open(dir.path())?);
    let person = db.schema().label_id("person").unwrap();
    let knows = db.schema().edge_type_id("knows").unwrap();

    {
        let mut txn = db.insert_txn();
        txn.add_vertex(person, 1, &[])?;
        txn.commit()?;
    }

    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(NUM_READERS + 1));
    let mut handles = Vec::new();
    for _ in 0..NUM_READERS {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<usize> {
            let fragment = Arc::clone(db.fragment());
            barrier.wait();
            let mut scans = 0usize;
            let mut prev_len = 0usize;
            while !done.load(Ordering::Acquire) || scans == 0 {
                let guard = fragment.arena().enter();
                let mut idx = 0usize;
                for record in fragment.out_edges(
                    person,
                    VertexId(0),
                    knows,
                    person,
                    Timestamp(u64::MAX),
                    &guard,
                )? {
                    // Edge `i` targets the (i+1)-th created vertex and
                    // carries weight `i`: any other content is a torn or
                    // skipped record.
                    assert_eq!(record.nbr, VertexId(idx as u32 + 1));
                    assert_eq!(record.prop, Some(Value::Double(idx as f64)));
                    let expected_ts = Timestamp((idx / EDGES_PER_TXN) as u64 + 2);
                    assert_eq!(record.ts, expected_ts);
                    idx += 1;
                }
                assert!(idx <= TOTAL_EDGES);
                assert!(idx >= prev_len, "published length regressed");
                prev_len = idx;
                scans += 1;
            }
            Ok(scans)
        }));
    }

    barrier.wait();
    for t in 0..EDGE_TXNS {
        let mut txn = db.insert_txn();
        for j in 0..EDGES_PER_TXN {
            let i = t * EDGES_PER_TXN + j;
            txn.add_edge(
                knows,
                person,
                1,
                person,
                // Distinct keys so every edge upserts a fresh destination
                // with vid i + 1.
                1000 + i as i64,
                Some(Value::Double(i as f64)),
                EndpointPolicy::Upsert,
            )?;
        }
        txn.commit()?;
    }
    done.store(true, Ordering::Release);

    for handle in handles {
        let scans = handle.join().unwrap()?;
        assert!(scans > 0);
    }

    let reader = db.read_txn();
    assert_eq!(
        reader
            .out_edges(person, VertexId(0), knows, person)?
            .count(),
        TOTAL_EDGES
    );
    Ok(())
}

/// Readers resolve keys and read rows while the writer keeps inserting
/// vertices: every published key must resolve to its dense vid and read its
/// own key back from column 0.
#[test]
fn lookups_are_consistent_during_insertion() -> Result<()> {
    const VERTICES: i64 = 10_000;

    let dir = tempdir()?;
    let db = Arc::new(open(dir.path())?);
    let person = db.schema().label_id("person").unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(NUM_READERS + 1));
    let mut handles = Vec::new();
    for _ in 0..NUM_READERS {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            let mut rng = rand::thread_rng();
            while !done.load(Ordering::Acquire) {
                let reader = db.read_txn();
                let n = reader.vertex_num(person) as i64;
                if n == 0 {
                    continue;
                }
                let key = rng.gen_range(1..=n);
                let vid = reader
                    .get_vertex(person, key)
                    .expect("published key resolves");
                assert_eq!(vid, VertexId(key as u32 - 1), "vids are dense by key order");
                assert_eq!(
                    reader.get_property(person, vid, PropId(0))?,
                    Value::Int64(key),
                    "column 0 round-trips the key"
                );
            }
            Ok(())
        }));
    }

    barrier.wait();
    let mut next = 1i64;
    while next <= VERTICES {
        let mut txn = db.insert_txn();
        for _ in 0..200 {
            if next > VERTICES {
                break;
            }
            txn.add_vertex(person, next, &[])?;
            next += 1;
        }
        txn.commit()?;
    }
    done.store(true, Ordering::Release);

    for handle in handles {
        handle.join().unwrap()?;
    }
    assert_eq!(db.read_txn().vertex_num(person), VERTICES as u32);
    Ok(())
}

/// Snapshot readers opened mid-stream never see edges committed after their
/// snapshot, and observe exactly the committed prefix of transactions.
#[test]
fn snapshot_readers_respect_commit_boundaries() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(open(dir.path())?);
    let person = db.schema().label_id("person").unwrap();
    let knows = db.schema().edge_type_id("knows").unwrap();

    {
        let mut txn = db.insert_txn();
        txn.add_vertex(person, 1, &[])?;
        txn.commit()?;
    }

    let done = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for _ in 0..NUM_READERS {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        handles.push(thread::spawn(move || -> Result<()> {
            while !done.load(Ordering::Acquire) {
                let reader = db.read_txn();
                let ts = reader.snapshot_ts();
                let records: Vec<_> = reader
                    .out_edges(person, VertexId(0), knows, person)?
                    .collect();
                for record in &records {
                    assert!(record.ts <= ts, "edge from the future at snapshot {ts}");
                }
                // One edge per committed transaction after the first.
                assert_eq!(records.len() as u64, ts.0.saturating_sub(1));
            }
            Ok(())
        }));
    }

    for i in 0..300i64 {
        let mut txn = db.insert_txn();
        txn.add_edge(
            knows,
            person,
            1,
            person,
            10 + i,
            Some(Value::Double(i as f64)),
            EndpointPolicy::Upsert,
        )?;
        txn.commit()?;
    }
    done.store(true, Ordering::Release);

    for handle in handles {
        handle.join().unwrap()?;
    }
    Ok(())
}
