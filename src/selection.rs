//! Re-derives the `selected` marks of one student for one course item subtree.

use crate::aggregate::{resolve_group, GroupResolution};
use crate::buckets::build_buckets;
use crate::error::RecomputeError;
use crate::evaluate::evaluate;
use crate::model::{sort_newest_first, CourseItem, ItemKind, ItemTree, ResultRecord, Term};
use crate::settings::SelectionSettings;
use crate::store;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, info_span, warn};

/// Everything one recompute reads, captured up front.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub student_id: String,
    pub tree: ItemTree,
    pub terms: HashMap<String, Vec<Term>>,
    /// Newest first.
    pub results: Vec<ResultRecord>,
}

impl Snapshot {
    pub fn new(
        student_id: &str,
        tree: ItemTree,
        terms: HashMap<String, Vec<Term>>,
        mut results: Vec<ResultRecord>,
    ) -> Self {
        sort_newest_first(&mut results);
        Self {
            student_id: student_id.to_string(),
            tree,
            terms,
            results,
        }
    }

    pub fn load(
        conn: &Connection,
        course_id: &str,
        root_item_id: &str,
        student_id: &str,
        settings: &SelectionSettings,
    ) -> Result<Self, RecomputeError> {
        let tree = store::load_tree(conn, course_id, root_item_id)?;
        let terms = store::terms_by_item(conn, &tree, student_id)?;
        let mut results = store::results_for_student(conn, course_id, student_id)?;
        if !settings.include_non_final {
            results.retain(|r| r.is_final);
        }
        Ok(Self::new(student_id, tree, terms, results))
    }

    pub fn terms_of(&self, item_id: &str) -> &[Term] {
        self.terms.get(item_id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub selected: Vec<String>,
    pub groups: Vec<GroupResolution>,
}

/// Computes which results should carry the `selected` mark, without touching storage.
pub fn derive_selection(snapshot: &Snapshot, settings: &SelectionSettings) -> Selection {
    let mut out = Selection::default();
    let root = snapshot.tree.root();
    match root.kind {
        ItemKind::Test | ItemKind::Activity => {
            if let Some(r) = evaluate(
                &snapshot.results,
                &root.id,
                &snapshot.student_id,
                root.policy,
                None,
            ) {
                out.selected.push(r.id.clone());
            }
        }
        ItemKind::Group => derive_group(root, snapshot, settings, &mut out),
    }
    out
}

fn derive_group(
    group: &CourseItem,
    snapshot: &Snapshot,
    settings: &SelectionSettings,
    out: &mut Selection,
) {
    let buckets = build_buckets(group, snapshot);
    let bucket_count = buckets.len();
    let resolution = resolve_group(group, buckets, snapshot, settings);
    debug!(
        group_id = %group.id,
        policy = group.policy.as_str(),
        term_aligned = group.term_aligned,
        buckets = bucket_count,
        winners = resolution.winners.len(),
        total_points = resolution.total_points,
        passed = resolution.passed,
        "group resolved"
    );
    out.selected
        .extend(resolution.winners.values().map(|w| w.result_id.clone()));
    out.groups.push(resolution);

    // A nested group is just another child to its parent; its own children
    // are resolved the same way one level down.
    for child in snapshot.tree.children(group) {
        match child.kind {
            ItemKind::Group => derive_group(child, snapshot, settings, out),
            ItemKind::Test | ItemKind::Activity => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeOutcome {
    pub root_item_id: String,
    pub student_id: String,
    pub cleared: usize,
    pub selected: Vec<String>,
    pub groups: Vec<GroupResolution>,
}

/// Clears and re-applies the selection marks of `student_id` for the subtree
/// rooted at `root_item_id`.
///
/// Runs entirely inside `tx`; the caller decides when to commit. Any error
/// leaves the caller to roll back, so no partial marks become visible.
pub fn recompute(
    tx: &Transaction<'_>,
    settings: &SelectionSettings,
    course_id: &str,
    root_item_id: &str,
    student_id: &str,
) -> Result<RecomputeOutcome, RecomputeError> {
    let span = info_span!("recompute", course_id, root_item_id, student_id);
    let _enter = span.enter();

    let snapshot = match Snapshot::load(tx, course_id, root_item_id, student_id, settings) {
        Ok(s) => s,
        Err(e) => {
            if let RecomputeError::ConfigurationIntegrity(ref inner) = e {
                warn!(error = %inner, "course configuration cannot be evaluated");
            }
            return Err(e);
        }
    };
    let selection = derive_selection(&snapshot, settings);

    let item_ids = snapshot.tree.subtree_ids();
    let cleared = store::clear_selected(tx, student_id, &item_ids)
        .map_err(RecomputeError::Persistence)?;
    store::set_selected(tx, &selection.selected, true).map_err(RecomputeError::Persistence)?;

    info!(
        items = snapshot.tree.len(),
        results = snapshot.results.len(),
        cleared,
        selected = selection.selected.len(),
        "selection recomputed"
    );

    Ok(RecomputeOutcome {
        root_item_id: root_item_id.to_string(),
        student_id: student_id.to_string(),
        cleared,
        selected: selection.selected,
        groups: selection.groups,
    })
}

/// Recomputes every top-level item of a course for one student.
pub fn recompute_course(
    tx: &Transaction<'_>,
    settings: &SelectionSettings,
    course_id: &str,
    student_id: &str,
) -> Result<Vec<RecomputeOutcome>, RecomputeError> {
    let roots = store::root_item_ids(tx, course_id)?;
    let mut outcomes = Vec::with_capacity(roots.len());
    for root_id in roots {
        outcomes.push(recompute(tx, settings, course_id, &root_id, student_id)?);
    }
    Ok(outcomes)
}

/// One writer at a time per (student, root item); other keys never wait on each other.
#[derive(Debug, Default)]
pub struct SelectionLocks {
    slots: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

fn lock_ignoring_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SelectionLocks {
    /// Holds the locks of several root items at once. Keys are taken in sorted
    /// order so overlapping callers cannot deadlock.
    pub fn with_locks<T>(&self, student_id: &str, root_item_ids: &[String], f: impl FnOnce() -> T) -> T {
        let mut keys: Vec<(String, String)> = root_item_ids
            .iter()
            .map(|root| (student_id.to_string(), root.clone()))
            .collect();
        keys.sort();
        keys.dedup();
        let held: Vec<Arc<Mutex<()>>> = {
            let mut slots = lock_ignoring_poison(&self.slots);
            keys.iter()
                .map(|k| slots.entry(k.clone()).or_default().clone())
                .collect()
        };

        let out = {
            let _guards: Vec<MutexGuard<'_, ()>> =
                held.iter().map(|slot| lock_ignoring_poison(slot.as_ref())).collect();
            f()
        };

        drop(held);
        let mut slots = lock_ignoring_poison(&self.slots);
        for key in &keys {
            // Clones are only taken under the map lock, so a lone map reference
            // means nobody holds or waits for this slot.
            if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                slots.remove(key);
            }
        }
        out
    }

    #[cfg(test)]
    pub fn active_keys(&self) -> usize {
        lock_ignoring_poison(&self.slots).len()
    }
}

/// Runs `f` in an immediate transaction while holding the (student, root)
/// locks of every listed root, committing only when `f` succeeds.
pub fn in_recompute_tx<T>(
    conn: &mut Connection,
    locks: &SelectionLocks,
    student_id: &str,
    root_item_ids: &[String],
    f: impl FnOnce(&Transaction<'_>) -> Result<T, RecomputeError>,
) -> Result<T, RecomputeError> {
    locks.with_locks(student_id, root_item_ids, || {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(RecomputeError::Persistence)?;
        let out = f(&tx)?;
        tx.commit().map_err(RecomputeError::Persistence)?;
        Ok(out)
    })
}

pub fn recompute_serialized(
    conn: &mut Connection,
    locks: &SelectionLocks,
    settings: &SelectionSettings,
    course_id: &str,
    root_item_id: &str,
    student_id: &str,
) -> Result<RecomputeOutcome, RecomputeError> {
    let roots = [root_item_id.to_string()];
    in_recompute_tx(conn, locks, student_id, &roots, |tx| {
        recompute(tx, settings, course_id, root_item_id, student_id)
    })
}

/// Manual override: flips the mark of one result. Selecting a result clears
/// the other results of the same student and item first.
pub fn toggle_selected(tx: &Transaction<'_>, result: &ResultRecord) -> rusqlite::Result<bool> {
    if result.selected {
        store::set_selected(tx, std::slice::from_ref(&result.id), false)?;
        return Ok(false);
    }
    store::clear_selected(
        tx,
        &result.student_id,
        std::slice::from_ref(&result.course_item_id),
    )?;
    store::set_selected(tx, std::slice::from_ref(&result.id), true)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn item(
        conn: &Connection,
        id: &str,
        parent: Option<&str>,
        kind: &str,
        policy: &str,
        aligned: bool,
        sort_order: i64,
    ) {
        conn.execute(
            "INSERT INTO course_items(id, course_id, parent_id, name, kind, policy, term_aligned, sort_order)
             VALUES(?, 'c1', ?, ?, ?, ?, ?, ?)",
            (id, parent, id, kind, policy, aligned as i64, sort_order),
        )
        .expect("insert item");
    }

    fn term(conn: &Connection, id: &str, item_id: &str, from: &str, registered_at: &str) {
        conn.execute(
            "INSERT INTO terms(id, course_item_id, name, active_from) VALUES(?, ?, ?, ?)",
            (id, item_id, id, from),
        )
        .expect("insert term");
        conn.execute(
            "INSERT INTO term_registrations(term_id, student_id, registered_at) VALUES(?, 's1', ?)",
            (id, registered_at),
        )
        .expect("insert registration");
    }

    fn result(conn: &Connection, id: &str, item_id: &str, term_id: &str, points: f64, at: &str) {
        conn.execute(
            "INSERT INTO results(id, course_id, student_id, course_item_id, term_id, points, final, selected, created_at)
             VALUES(?, 'c1', 's1', ?, ?, ?, 1, 0, ?)",
            (id, item_id, term_id, points, at),
        )
        .expect("insert result");
    }

    fn selected_ids(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT id FROM results WHERE selected = 1 ORDER BY id")
            .expect("prepare");
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        ids
    }

    fn run(conn: &mut Connection, root: &str) -> Result<RecomputeOutcome, RecomputeError> {
        let locks = SelectionLocks::default();
        recompute_serialized(conn, &locks, &SelectionSettings::default(), "c1", root, "s1")
    }

    fn homework_fixture(conn: &Connection) {
        item(conn, "hw", None, "group", "last", true, 0);
        item(conn, "a", Some("hw"), "test", "best", false, 0);
        item(conn, "b", Some("hw"), "activity", "best", false, 1);
        term(conn, "T1", "hw", "2025-03-01T08:00:00Z", "2025-02-20T08:00:00Z");
        term(conn, "T2", "a", "2025-04-01T08:00:00Z", "2025-03-20T08:00:00Z");
        result(conn, "a_t1", "a", "T1", 10.0, "2025-03-01T09:00:00Z");
        result(conn, "b_t1", "b", "T1", 5.0, "2025-03-01T09:05:00Z");
        result(conn, "a_t2", "a", "T2", 4.0, "2025-04-01T09:00:00Z");
    }

    #[test]
    fn aligned_last_group_selects_patched_winners() {
        let ws = temp_dir("selectiond-sel-aligned");
        let mut conn = db::open_db(&ws).expect("open db");
        homework_fixture(&conn);

        let outcome = run(&mut conn, "hw").expect("recompute");
        assert_eq!(selected_ids(&conn), vec!["a_t2", "b_t1"]);
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].total_points, 9.0);
    }

    #[test]
    fn recompute_is_idempotent_and_clears_stale_marks() {
        let ws = temp_dir("selectiond-sel-idem");
        let mut conn = db::open_db(&ws).expect("open db");
        homework_fixture(&conn);
        conn.execute("UPDATE results SET selected = 1", []).expect("mark all");

        let first = run(&mut conn, "hw").expect("first");
        let after_first = selected_ids(&conn);
        let second = run(&mut conn, "hw").expect("second");
        assert_eq!(after_first, selected_ids(&conn));
        assert_eq!(first.selected.len(), second.selected.len());
        assert_eq!(first.cleared, 3);
        assert_eq!(second.cleared, 2);
    }

    #[test]
    fn leaf_root_with_no_results_selects_nothing() {
        let ws = temp_dir("selectiond-sel-empty");
        let mut conn = db::open_db(&ws).expect("open db");
        item(&conn, "quiz", None, "test", "best", false, 0);
        let outcome = run(&mut conn, "quiz").expect("recompute");
        assert!(outcome.selected.is_empty());
        assert!(selected_ids(&conn).is_empty());
    }

    #[test]
    fn nested_groups_are_resolved_level_by_level() {
        let ws = temp_dir("selectiond-sel-nested");
        let mut conn = db::open_db(&ws).expect("open db");
        item(&conn, "course", None, "group", "best", false, 0);
        item(&conn, "set", Some("course"), "group", "best", false, 0);
        item(&conn, "q1", Some("set"), "test", "last", false, 0);
        item(&conn, "exam", Some("course"), "test", "best", false, 1);
        term(&conn, "T", "exam", "2025-03-01T08:00:00Z", "2025-02-01T08:00:00Z");
        result(&conn, "set_r", "set", "T", 7.0, "2025-03-02T08:00:00Z");
        result(&conn, "q1_old", "q1", "T", 9.0, "2025-03-02T08:00:00Z");
        result(&conn, "q1_new", "q1", "T", 3.0, "2025-03-03T08:00:00Z");
        result(&conn, "exam_lo", "exam", "T", 40.0, "2025-03-04T08:00:00Z");
        result(&conn, "exam_hi", "exam", "T", 60.0, "2025-03-05T08:00:00Z");

        let outcome = run(&mut conn, "course").expect("recompute");
        assert_eq!(selected_ids(&conn), vec!["exam_hi", "q1_new", "set_r"]);
        assert_eq!(outcome.groups.len(), 2);
    }

    #[test]
    fn unknown_kind_is_an_integrity_error_and_writes_nothing() {
        let ws = temp_dir("selectiond-sel-integrity");
        let mut conn = db::open_db(&ws).expect("open db");
        item(&conn, "g", None, "group", "best", false, 0);
        item(&conn, "odd", Some("g"), "survey", "best", false, 0);
        term(&conn, "T", "g", "2025-03-01T08:00:00Z", "2025-02-01T08:00:00Z");
        result(&conn, "r", "odd", "T", 1.0, "2025-03-02T08:00:00Z");
        conn.execute("UPDATE results SET selected = 1", []).expect("mark");

        let e = run(&mut conn, "g").expect_err("integrity");
        assert!(matches!(e, RecomputeError::ConfigurationIntegrity(_)));
        assert_eq!(e.code(), "configuration_integrity");
        assert_eq!(selected_ids(&conn), vec!["r"]);
    }

    #[test]
    fn missing_root_is_a_tree_load_error() {
        let ws = temp_dir("selectiond-sel-missing");
        let mut conn = db::open_db(&ws).expect("open db");
        let e = run(&mut conn, "ghost").expect_err("missing");
        assert!(matches!(e, RecomputeError::RootNotFound { ref item_id, .. } if item_id == "ghost"));
        assert_eq!(e.code(), "tree_load_failed");
    }

    #[test]
    fn unreadable_items_keep_the_sqlite_error_as_source() {
        let ws = temp_dir("selectiond-sel-source");
        let mut conn = db::open_db(&ws).expect("open db");
        conn.execute_batch("DROP TABLE course_items").expect("drop");
        let e = run(&mut conn, "quiz").expect_err("unreadable");
        assert!(matches!(e, RecomputeError::TreeLoad(_)));
        let source = std::error::Error::source(&e).expect("source kept");
        assert!(source.downcast_ref::<rusqlite::Error>().is_some());
    }

    #[test]
    fn failed_recompute_rolls_back_earlier_writes_in_the_same_transaction() {
        let ws = temp_dir("selectiond-sel-rollback");
        let mut conn = db::open_db(&ws).expect("open db");
        item(&conn, "quiz", None, "test", "best", false, 0);
        term(&conn, "T", "quiz", "2025-03-01T08:00:00Z", "2025-02-01T08:00:00Z");
        result(&conn, "r1", "quiz", "T", 1.0, "2025-03-02T08:00:00Z");
        let locks = SelectionLocks::default();

        let roots = ["quiz".to_string()];
        let e = in_recompute_tx(&mut conn, &locks, "s1", &roots, |tx| {
            recompute(tx, &SelectionSettings::default(), "c1", "quiz", "s1")?;
            recompute(tx, &SelectionSettings::default(), "c1", "ghost", "s1")
        })
        .expect_err("second recompute fails");
        assert!(matches!(e, RecomputeError::RootNotFound { .. }));
        assert!(selected_ids(&conn).is_empty());
    }

    #[test]
    fn non_final_results_can_be_excluded() {
        let ws = temp_dir("selectiond-sel-nonfinal");
        let mut conn = db::open_db(&ws).expect("open db");
        item(&conn, "quiz", None, "test", "best", false, 0);
        term(&conn, "T", "quiz", "2025-03-01T08:00:00Z", "2025-02-01T08:00:00Z");
        result(&conn, "graded", "quiz", "T", 30.0, "2025-03-02T08:00:00Z");
        result(&conn, "pending", "quiz", "T", 80.0, "2025-03-03T08:00:00Z");
        conn.execute("UPDATE results SET final = 0 WHERE id = 'pending'", [])
            .expect("mark pending");

        run(&mut conn, "quiz").expect("default");
        assert_eq!(selected_ids(&conn), vec!["pending"]);

        let settings = SelectionSettings {
            include_non_final: false,
            ..SelectionSettings::default()
        };
        let locks = SelectionLocks::default();
        recompute_serialized(&mut conn, &locks, &settings, "c1", "quiz", "s1").expect("final only");
        assert_eq!(selected_ids(&conn), vec!["graded"]);
    }

    #[test]
    fn recompute_course_covers_every_root() {
        let ws = temp_dir("selectiond-sel-course");
        let mut conn = db::open_db(&ws).expect("open db");
        item(&conn, "q1", None, "test", "best", false, 0);
        item(&conn, "q2", None, "activity", "last", false, 1);
        term(&conn, "T", "q1", "2025-03-01T08:00:00Z", "2025-02-01T08:00:00Z");
        result(&conn, "q1_r", "q1", "T", 2.0, "2025-03-02T08:00:00Z");
        result(&conn, "q2_a", "q2", "T", 9.0, "2025-03-02T08:00:00Z");
        result(&conn, "q2_b", "q2", "T", 1.0, "2025-03-03T08:00:00Z");

        let tx = conn.transaction().expect("tx");
        let outcomes = recompute_course(&tx, &SelectionSettings::default(), "c1", "s1")
            .expect("recompute course");
        tx.commit().expect("commit");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(selected_ids(&conn), vec!["q1_r", "q2_b"]);
    }

    #[test]
    fn toggle_selected_keeps_one_mark_per_item() {
        let ws = temp_dir("selectiond-sel-toggle");
        let mut conn = db::open_db(&ws).expect("open db");
        item(&conn, "quiz", None, "test", "best", false, 0);
        term(&conn, "T", "quiz", "2025-03-01T08:00:00Z", "2025-02-01T08:00:00Z");
        result(&conn, "r1", "quiz", "T", 1.0, "2025-03-02T08:00:00Z");
        result(&conn, "r2", "quiz", "T", 2.0, "2025-03-03T08:00:00Z");
        run(&mut conn, "quiz").expect("recompute");
        assert_eq!(selected_ids(&conn), vec!["r2"]);

        let r1 = store::find_result(&conn, "r1").expect("query").expect("r1");
        let tx = conn.transaction().expect("tx");
        assert!(toggle_selected(&tx, &r1).expect("toggle on"));
        tx.commit().expect("commit");
        assert_eq!(selected_ids(&conn), vec!["r1"]);

        let r1 = store::find_result(&conn, "r1").expect("query").expect("r1");
        let tx = conn.transaction().expect("tx");
        assert!(!toggle_selected(&tx, &r1).expect("toggle off"));
        tx.commit().expect("commit");
        assert!(selected_ids(&conn).is_empty());
    }

    #[test]
    fn contended_lock_slots_are_pruned_once_every_holder_leaves() {
        use std::sync::mpsc;

        let locks = Arc::new(SelectionLocks::default());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || {
                locks.with_locks("s1", &["quiz".to_string(), "hw".to_string()], || {
                    entered_tx.send(()).expect("signal");
                    release_rx.recv().expect("release");
                })
            })
        };
        entered_rx.recv().expect("first holds the lock");
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let locks = Arc::clone(&locks);
                std::thread::spawn(move || locks.with_locks("s1", &["quiz".to_string()], || ()))
            })
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(locks.active_keys(), 2);

        release_tx.send(()).expect("release");
        first.join().expect("first");
        for w in waiters {
            w.join().expect("waiter");
        }
        assert_eq!(locks.active_keys(), 0);
    }

    #[test]
    fn concurrent_recomputes_of_one_key_keep_a_single_mark() {
        let ws = temp_dir("selectiond-sel-concurrent");
        {
            let conn = db::open_db(&ws).expect("open db");
            item(&conn, "quiz", None, "test", "best", false, 0);
            term(&conn, "T", "quiz", "2025-03-01T08:00:00Z", "2025-02-01T08:00:00Z");
            result(&conn, "r1", "quiz", "T", 10.0, "2025-03-02T08:00:00Z");
            result(&conn, "r2", "quiz", "T", 20.0, "2025-03-03T08:00:00Z");
        }

        let locks = Arc::new(SelectionLocks::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let ws = ws.clone();
                std::thread::spawn(move || {
                    let mut conn = db::open_db(&ws).expect("open db");
                    for _ in 0..10 {
                        recompute_serialized(
                            &mut conn,
                            &locks,
                            &SelectionSettings::default(),
                            "c1",
                            "quiz",
                            "s1",
                        )
                        .expect("recompute");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }

        let conn = db::open_db(&ws).expect("open db");
        assert_eq!(selected_ids(&conn), vec!["r2"]);
        assert_eq!(locks.active_keys(), 0);
    }
}
