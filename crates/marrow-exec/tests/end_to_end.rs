//! End-to-end scenarios: DDL, DML through the executor pipeline, index
//! consistency, and transactional rollback.

use std::sync::Arc;

use tempfile::TempDir;

use marrow_common::constants::BUFFER_POOL_SIZE;
use marrow_common::types::values::{ColType, Value};
use marrow_common::{AbortReason, MarrowError, Rid};
use marrow_storage::{BufferPool, DiskManager, HeapScan};
use marrow_txn::{Context, LockManager, TransactionManager};

use marrow_exec::executor::{
    collect_records, collect_rids, DeleteExecutor, Executor, IndexScan, InsertExecutor,
    NestedLoopJoin, Projection, SeqScan, SetClause, UpdateExecutor,
};
use marrow_exec::{ColDef, CompOp, Condition, SystemManager, TabCol};

struct Harness {
    _dir: TempDir,
    sm: SystemManager,
    tm: TransactionManager,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(DiskManager::new());
    let pool = Arc::new(BufferPool::new(Arc::clone(&disk), BUFFER_POOL_SIZE));
    let mut sm = SystemManager::new(disk, pool, dir.path());
    sm.create_db("testdb").unwrap();
    sm.open_db("testdb").unwrap();
    let tm = TransactionManager::new(Arc::new(LockManager::new()));
    Harness {
        _dir: dir,
        sm,
        tm,
    }
}

/// Creates `T(a INT, b INT)`, optionally indexed on `a`.
fn create_two_int_table(h: &mut Harness, name: &str, index_on_a: bool) {
    h.sm.create_table(name, &[ColDef::int("a"), ColDef::int("b")])
        .unwrap();
    if index_on_a {
        let txn = h.tm.begin();
        let ctx = Context {
            lock_mgr: h.tm.lock_manager(),
            txn: &txn,
        };
        h.sm.create_index(name, &["a".into()], &ctx).unwrap();
        h.tm.commit(&txn).unwrap();
    }
}

fn insert_row(h: &Harness, ctx: &Context<'_>, tab: &str, a: i32, b: i32) -> Rid {
    InsertExecutor::new(&h.sm, tab, vec![Value::Int(a), Value::Int(b)], ctx)
        .unwrap()
        .execute()
        .unwrap()
}

fn decode_two_ints(record: &[u8]) -> (i32, i32) {
    let a = match Value::from_bytes(ColType::Int, &record[0..4]).unwrap() {
        Value::Int(v) => v,
        other => panic!("unexpected value {other:?}"),
    };
    let b = match Value::from_bytes(ColType::Int, &record[4..8]).unwrap() {
        Value::Int(v) => v,
        other => panic!("unexpected value {other:?}"),
    };
    (a, b)
}

fn seq_scan_rows(h: &Harness, ctx: &Context<'_>, tab: &str, conds: Vec<Condition>) -> Vec<(i32, i32)> {
    let mut scan = SeqScan::new(&h.sm, tab, conds, ctx).unwrap();
    collect_records(&mut scan)
        .unwrap()
        .iter()
        .map(|r| decode_two_ints(r))
        .collect()
}

fn index_scan_rows(
    h: &Harness,
    ctx: &Context<'_>,
    tab: &str,
    conds: Vec<Condition>,
) -> Vec<(i32, i32)> {
    let mut scan = IndexScan::new(&h.sm, tab, conds, &["a".into()], ctx).unwrap();
    collect_records(&mut scan)
        .unwrap()
        .iter()
        .map(|r| decode_two_ints(r))
        .collect()
}

/// Checks that every tuple of `tab_name` has exactly one entry in each
/// index, pointing at the tuple's rid, and that the indexes hold
/// nothing else.
fn assert_index_consistent(sm: &SystemManager, tab_name: &str) {
    let tab = sm.db().get_table(tab_name).unwrap();
    let heap = sm.heap(tab_name).unwrap();
    for index in &tab.indexes {
        let handle = sm.index(tab_name, &index.col_names()).unwrap();

        let mut tuple_count = 0;
        let mut scan = HeapScan::new(heap).unwrap();
        while !scan.is_end() {
            let rid = scan.rid();
            let record = heap.get_record(rid).unwrap();
            assert_eq!(
                handle.get_value(&index.build_key(&record)).unwrap(),
                vec![rid],
                "tuple at {rid} missing from index"
            );
            tuple_count += 1;
            scan.next().unwrap();
        }

        let mut entry_count = 0;
        let mut iid = handle.leaf_begin().unwrap();
        let end = handle.leaf_end().unwrap();
        while iid != end {
            entry_count += 1;
            iid = handle.next_iid(iid).unwrap();
        }
        assert_eq!(entry_count, tuple_count, "index holds stale entries");
    }
}

fn eq_cond(tab: &str, col: &str, v: i32) -> Condition {
    Condition::with_value(TabCol::new(tab, col), CompOp::Eq, Value::Int(v))
}

#[test]
fn single_tuple_insert_and_select() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", false);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    insert_row(&h, &ctx, "t", 1, 2);
    h.tm.commit(&txn).unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    assert_eq!(seq_scan_rows(&h, &ctx, "t", vec![]), vec![(1, 2)]);
    h.tm.commit(&txn).unwrap();
}

#[test]
fn indexed_point_lookup() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", true);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    for (a, b) in [(1, 10), (2, 20), (3, 30)] {
        insert_row(&h, &ctx, "t", a, b);
    }
    h.tm.commit(&txn).unwrap();
    assert_index_consistent(&h.sm, "t");

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    let rows = index_scan_rows(&h, &ctx, "t", vec![eq_cond("t", "a", 2)]);
    assert_eq!(rows, vec![(2, 20)]);
    h.tm.commit(&txn).unwrap();
}

#[test]
fn indexed_range_scans() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", true);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    for (a, b) in [(3, 30), (1, 10), (2, 20)] {
        insert_row(&h, &ctx, "t", a, b);
    }
    h.tm.commit(&txn).unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    // a >= 2, in key order.
    let rows = index_scan_rows(
        &h,
        &ctx,
        "t",
        vec![Condition::with_value(
            TabCol::new("t", "a"),
            CompOp::Ge,
            Value::Int(2),
        )],
    );
    assert_eq!(rows, vec![(2, 20), (3, 30)]);

    // a > 1 AND a < 3.
    let rows = index_scan_rows(
        &h,
        &ctx,
        "t",
        vec![
            Condition::with_value(TabCol::new("t", "a"), CompOp::Gt, Value::Int(1)),
            Condition::with_value(TabCol::new("t", "a"), CompOp::Lt, Value::Int(3)),
        ],
    );
    assert_eq!(rows, vec![(2, 20)]);
    h.tm.commit(&txn).unwrap();
}

#[test]
fn update_preserves_index_consistency() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", true);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    insert_row(&h, &ctx, "t", 1, 10);
    h.tm.commit(&txn).unwrap();

    // UPDATE t SET a = 5 WHERE a = 1.
    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    let rids = {
        let mut scan =
            IndexScan::new(&h.sm, "t", vec![eq_cond("t", "a", 1)], &["a".into()], &ctx).unwrap();
        collect_rids(&mut scan).unwrap()
    };
    assert_eq!(rids.len(), 1);
    let updated = UpdateExecutor::new(
        &h.sm,
        "t",
        vec![SetClause {
            lhs: TabCol::new("t", "a"),
            rhs: Value::Int(5),
        }],
        rids,
        &ctx,
    )
    .unwrap()
    .execute()
    .unwrap();
    assert_eq!(updated, 1);
    h.tm.commit(&txn).unwrap();
    assert_index_consistent(&h.sm, "t");

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    assert!(index_scan_rows(&h, &ctx, "t", vec![eq_cond("t", "a", 1)]).is_empty());
    assert_eq!(
        index_scan_rows(&h, &ctx, "t", vec![eq_cond("t", "a", 5)]),
        vec![(5, 10)]
    );
    h.tm.commit(&txn).unwrap();
}

#[test]
fn abort_undoes_insert() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", true);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    insert_row(&h, &ctx, "t", 1, 10);
    h.tm.abort(&txn, &h.sm).unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    assert!(seq_scan_rows(&h, &ctx, "t", vec![]).is_empty());
    h.tm.commit(&txn).unwrap();

    // The index is empty too.
    let index = h.sm.index("t", &["a".into()]).unwrap();
    assert_eq!(index.leaf_begin().unwrap(), index.leaf_end().unwrap());
    assert_index_consistent(&h.sm, "t");
}

#[test]
fn abort_undoes_update_and_delete() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", true);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    let rid1 = insert_row(&h, &ctx, "t", 1, 10);
    insert_row(&h, &ctx, "t", 2, 20);
    h.tm.commit(&txn).unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    // Update row 1, delete row 2, then roll everything back.
    let rids = {
        let mut scan = SeqScan::new(&h.sm, "t", vec![eq_cond("t", "a", 1)], &ctx).unwrap();
        collect_rids(&mut scan).unwrap()
    };
    UpdateExecutor::new(
        &h.sm,
        "t",
        vec![SetClause {
            lhs: TabCol::new("t", "a"),
            rhs: Value::Int(7),
        }],
        rids,
        &ctx,
    )
    .unwrap()
    .execute()
    .unwrap();
    let rids = {
        let mut scan = SeqScan::new(&h.sm, "t", vec![eq_cond("t", "a", 2)], &ctx).unwrap();
        collect_rids(&mut scan).unwrap()
    };
    DeleteExecutor::new(&h.sm, "t", rids, &ctx)
        .unwrap()
        .execute()
        .unwrap();
    h.tm.abort(&txn, &h.sm).unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    let mut rows = seq_scan_rows(&h, &ctx, "t", vec![]);
    rows.sort_unstable();
    assert_eq!(rows, vec![(1, 10), (2, 20)]);
    // The updated tuple is back at its original address.
    let mut scan = SeqScan::new(&h.sm, "t", vec![eq_cond("t", "a", 1)], &ctx).unwrap();
    assert_eq!(collect_rids(&mut scan).unwrap(), vec![rid1]);
    h.tm.commit(&txn).unwrap();
    assert_index_consistent(&h.sm, "t");
}

#[test]
fn deadlock_prevention_aborts_intruder() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", false);

    let t1 = h.tm.begin();
    let ctx1 = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &t1,
    };
    insert_row(&h, &ctx1, "t", 1, 10);
    h.tm.lock_manager()
        .lock_exclusive_on_table(&t1, h.sm.heap("t").unwrap().fd())
        .unwrap();

    // T2's shared scan is refused on the spot.
    let t2 = h.tm.begin();
    let ctx2 = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &t2,
    };
    let err = SeqScan::new(&h.sm, "t", vec![], &ctx2).unwrap_err();
    match err {
        MarrowError::TransactionAborted { reason, .. } => {
            assert_eq!(reason, AbortReason::DeadlockPrevention);
        }
        other => panic!("unexpected error {other}"),
    }
    h.tm.abort(&t2, &h.sm).unwrap();

    // T1 still sees its own pre-commit state.
    assert_eq!(seq_scan_rows(&h, &ctx1, "t", vec![]), vec![(1, 10)]);
    h.tm.commit(&t1).unwrap();
}

#[test]
fn projection_repacks_columns() {
    let mut h = harness();
    h.sm.create_table(
        "t",
        &[ColDef::int("a"), ColDef::string("s", 8), ColDef::int("b")],
    )
    .unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    InsertExecutor::new(
        &h.sm,
        "t",
        vec![Value::Int(1), Value::Str("hi".into()), Value::Int(9)],
        &ctx,
    )
    .unwrap()
    .execute()
    .unwrap();

    let scan = SeqScan::new(&h.sm, "t", vec![], &ctx).unwrap();
    let mut proj = Projection::new(
        Box::new(scan),
        &[TabCol::new("t", "b"), TabCol::new("t", "a")],
    )
    .unwrap();
    assert_eq!(proj.tuple_len(), 8);
    assert_eq!(proj.cols()[0].offset, 0);
    assert_eq!(proj.cols()[1].offset, 4);

    let records = collect_records(&mut proj).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(decode_two_ints(&records[0]), (9, 1));
    h.tm.commit(&txn).unwrap();
}

#[test]
fn nested_loop_join_matches_pairs() {
    let mut h = harness();
    create_two_int_table(&mut h, "l", false);
    h.sm.create_table("r", &[ColDef::int("c"), ColDef::int("d")])
        .unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    for (a, b) in [(1, 100), (2, 200), (3, 300)] {
        insert_row(&h, &ctx, "l", a, b);
    }
    for (c, d) in [(2, 7), (3, 8), (4, 9)] {
        InsertExecutor::new(&h.sm, "r", vec![Value::Int(c), Value::Int(d)], &ctx)
            .unwrap()
            .execute()
            .unwrap();
    }

    let left = SeqScan::new(&h.sm, "l", vec![], &ctx).unwrap();
    let right = SeqScan::new(&h.sm, "r", vec![], &ctx).unwrap();
    let join_cond = Condition::with_col(TabCol::new("l", "a"), CompOp::Eq, TabCol::new("r", "c"));
    let mut join = NestedLoopJoin::new(Box::new(left), Box::new(right), vec![join_cond]);
    assert_eq!(join.tuple_len(), 16);

    let records = collect_records(&mut join).unwrap();
    let mut pairs: Vec<(i32, i32)> = records
        .iter()
        .map(|r| {
            let (a, _b) = decode_two_ints(&r[0..8]);
            let (_c, d) = decode_two_ints(&r[8..16]);
            (a, d)
        })
        .collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![(2, 7), (3, 8)]);
    h.tm.commit(&txn).unwrap();
}

#[test]
fn index_scan_rechecks_residual_conditions() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", true);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    for (a, b) in [(1, 10), (2, 20), (3, 20)] {
        insert_row(&h, &ctx, "t", a, b);
    }

    // Only `a` is indexed; a condition on `b` cannot bound the range
    // and is applied per tuple instead.
    let rows = index_scan_rows(&h, &ctx, "t", vec![eq_cond("t", "b", 20)]);
    assert_eq!(rows, vec![(2, 20), (3, 20)]);

    // A `<>` on the leading column never bounds the scan either.
    let rows = index_scan_rows(
        &h,
        &ctx,
        "t",
        vec![Condition::with_value(
            TabCol::new("t", "a"),
            CompOp::Ne,
            Value::Int(2),
        )],
    );
    assert_eq!(rows, vec![(1, 10), (3, 20)]);
    h.tm.commit(&txn).unwrap();
}

#[test]
fn scan_with_equal_bounds_is_empty() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", true);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    for (a, b) in [(1, 10), (2, 20)] {
        insert_row(&h, &ctx, "t", a, b);
    }
    // a > 2 AND a < 2 can never match.
    let rows = index_scan_rows(
        &h,
        &ctx,
        "t",
        vec![
            Condition::with_value(TabCol::new("t", "a"), CompOp::Gt, Value::Int(2)),
            Condition::with_value(TabCol::new("t", "a"), CompOp::Lt, Value::Int(2)),
        ],
    );
    assert!(rows.is_empty());
    h.tm.commit(&txn).unwrap();
}

#[test]
fn user_errors_do_not_poison_the_transaction() {
    let mut h = harness();
    create_two_int_table(&mut h, "t", false);

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };

    // Wrong arity.
    let err = InsertExecutor::new(&h.sm, "t", vec![Value::Int(1)], &ctx).unwrap_err();
    assert!(matches!(err, MarrowError::InvalidValueCount { .. }));

    // Wrong type.
    let err = InsertExecutor::new(
        &h.sm,
        "t",
        vec![Value::Str("x".into()), Value::Int(2)],
        &ctx,
    )
    .unwrap()
    .execute()
    .unwrap_err();
    assert!(matches!(err, MarrowError::IncompatibleType { .. }));

    // The transaction continues unharmed.
    insert_row(&h, &ctx, "t", 1, 2);
    h.tm.commit(&txn).unwrap();

    let txn = h.tm.begin();
    let ctx = Context {
        lock_mgr: h.tm.lock_manager(),
        txn: &txn,
    };
    assert_eq!(seq_scan_rows(&h, &ctx, "t", vec![]), vec![(1, 2)]);
    h.tm.commit(&txn).unwrap();
}
