use chrono::{DateTime, Duration, TimeZone, Utc};
use geovisit::{
    drain_terminal, great_circle_distance, AssociationConfig, BatchDriver, BatchOptions, Cluster,
    ClusterAssociationEngine, ClusterStore, Coord, MemoryStore, PositionStore, TerminalId,
    TerminalLocks, VisitDatabase, VisitStore,
};

/*-------------------------------------------------------------------------------------------------
 *                                         Helpers
 *-----------------------------------------------------------------------------------------------*/
const TERMINAL: TerminalId = 7;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 6, 1, h, m, 0).unwrap()
}

fn pt(lat: f64, lon: f64) -> Coord {
    Coord { lat, lon }
}

fn memory_store(pings: &[(Coord, DateTime<Utc>)]) -> MemoryStore {
    let mut store = MemoryStore::new();
    for &(coord, when) in pings {
        store.add_position(TERMINAL, Some(coord), Some(when));
    }
    store
}

fn database_store(pings: &[(Coord, DateTime<Utc>)]) -> VisitDatabase {
    let db = VisitDatabase::connect_in_memory().unwrap();
    {
        let mut add = db.prepare_to_add_positions().unwrap();
        for &(coord, when) in pings {
            add.add(TERMINAL, coord, when).unwrap();
        }
    }
    db
}

fn new_engine<S: VisitStore>(store: S) -> ClusterAssociationEngine<S> {
    ClusterAssociationEngine::new(store, AssociationConfig::default(), TerminalLocks::new())
}

/// Run everything pending for the test terminal and return its clusters ordered by id.
fn cluster_all<S: VisitStore>(store: S) -> Vec<Cluster> {
    let mut engine = new_engine(store);
    let report = drain_terminal(&mut engine, TERMINAL, 100);
    assert!(report.error.is_none());

    let mut store = engine.into_store();
    store.clusters_for_terminal(TERMINAL).unwrap()
}

/// Cluster with both stores and check they agree.
fn cluster_both(pings: &[(Coord, DateTime<Utc>)]) -> Vec<Cluster> {
    let from_memory = cluster_all(memory_store(pings));
    let from_database = cluster_all(database_store(pings));

    assert_eq!(from_memory.len(), from_database.len());
    for (mem, db) in from_memory.iter().zip(&from_database) {
        assert_eq!(mem.anchor(), db.anchor());
        assert_eq!(mem.visit_count(), db.visit_count());
        assert_eq!(mem.last_visited_at(), db.last_visited_at());
    }

    from_memory
}

/*-------------------------------------------------------------------------------------------------
 *                                        Scenarios
 *-----------------------------------------------------------------------------------------------*/
#[test]
fn test_home_and_work() {
    let home = pt(42.0, 42.0);
    let work = pt(42.1, 42.0);

    let pings = [
        (home, at(7, 0)),
        (home, at(8, 0)),
        (work, at(11, 0)),
        (work, at(12, 0)),
        (work, at(13, 0)),
        (work, at(14, 0)),
        (home, at(19, 0)),
        (home, at(20, 0)),
    ];

    let clusters = cluster_both(&pings);
    assert_eq!(clusters.len(), 2);

    let home_cluster = clusters.iter().find(|c| c.anchor() == home).unwrap();
    assert_eq!(home_cluster.visit_count(), 4);
    assert_eq!(home_cluster.last_visited_at(), at(20, 0));

    let work_cluster = clusters.iter().find(|c| c.anchor() == work).unwrap();
    assert_eq!(work_cluster.visit_count(), 4);
    assert_eq!(work_cluster.last_visited_at(), at(14, 0));
}

#[test]
fn test_single_short_visit() {
    let spot = pt(42.0, 42.0);
    let pings: Vec<_> = (0..5).map(|m| (spot, at(12, m))).collect();

    let clusters = cluster_both(&pings);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].visit_count(), 1);
    assert_eq!(clusters[0].last_visited_at(), at(12, 0));
}

#[test]
fn test_driving() {
    let pings: Vec<_> = (0..5)
        .map(|step| {
            (
                pt(42.0 + 0.001 * step as f64, 42.0),
                at(12, 0) + Duration::minutes(15 * step as i64),
            )
        })
        .collect();

    let clusters = cluster_both(&pings);
    assert_eq!(clusters.len(), 3);

    for (cluster, step) in clusters.iter().zip([0, 2, 4]) {
        assert_eq!(cluster.anchor(), pings[step].0);
        assert_eq!(cluster.visit_count(), 1);
        assert_eq!(cluster.last_visited_at(), pings[step].1);
    }
}

#[test]
fn test_courier_two_visits() {
    let a = pt(42.0, 42.0);
    let b = pt(42.002, 42.0);

    let pings: Vec<_> = (0..13)
        .map(|i| {
            let spot = if i % 2 == 0 { a } else { b };
            (spot, at(12, 0) + Duration::minutes(5 * i))
        })
        .collect();

    let clusters = cluster_both(&pings);
    assert_eq!(clusters.len(), 2);

    assert_eq!(clusters[0].anchor(), a);
    assert_eq!(clusters[0].visit_count(), 2);
    assert_eq!(clusters[0].last_visited_at(), at(12, 40));

    assert_eq!(clusters[1].anchor(), b);
    assert_eq!(clusters[1].visit_count(), 2);
    assert_eq!(clusters[1].last_visited_at(), at(12, 45));
}

/*-------------------------------------------------------------------------------------------------
 *                                       Properties
 *-----------------------------------------------------------------------------------------------*/
fn wandering_pings() -> Vec<(Coord, DateTime<Utc>)> {
    // A few places revisited at irregular intervals, with some jitter within each place.
    let places = [pt(42.0, 42.0), pt(42.01, 42.0), pt(42.0, 42.02), pt(41.99, 41.99)];
    let jitter = [0.0, 0.0005, -0.0004, 0.0008, -0.0009];

    (0..60)
        .map(|i: i64| {
            let place = places[(i as usize * 7 / 5) % places.len()];
            let j = jitter[i as usize % jitter.len()];
            (
                pt(place.lat + j, place.lon - j),
                at(6, 0) + Duration::minutes(i * 17 + (i % 3) * 4),
            )
        })
        .collect()
}

#[test]
fn test_each_position_lands_within_threshold_of_its_anchor() {
    let config = AssociationConfig::default();
    let mut engine = new_engine(memory_store(&wandering_pings()));
    let report = drain_terminal(&mut engine, TERMINAL, 16);
    assert!(report.error.is_none());
    assert_eq!(report.summary.processed, 60);

    let store = engine.into_store();
    assert_eq!(store.associations().len(), 60);

    for assoc in store.associations() {
        assert!(assoc.accepted);

        let position = store.position(assoc.position_id).unwrap();
        assert!(position.processed);

        let cluster = store.cluster(assoc.cluster_id).unwrap();
        let dist = great_circle_distance(cluster.anchor(), position.coord.unwrap());
        assert!(dist <= config.spatial_threshold_meters);
    }

    // No two anchors are close enough to have claimed each other's creating position.
    let clusters = store.clusters();
    for (i, left) in clusters.iter().enumerate() {
        for right in &clusters[i + 1..] {
            assert!(left.distance_to(right.anchor()) > config.spatial_threshold_meters);
        }
    }
}

#[test]
fn test_visit_count_follows_registered_visits() {
    let threshold = AssociationConfig::default().temporal_threshold;

    let mut engine = new_engine(memory_store(&wandering_pings()));
    let report = drain_terminal(&mut engine, TERMINAL, 10);
    assert!(report.error.is_none());

    let store = engine.into_store();
    let clusters = store.clusters();
    assert!(clusters.iter().any(|c| c.visit_count() > 1));

    for cluster in &clusters {
        let mut times: Vec<DateTime<Utc>> = store
            .associations()
            .iter()
            .filter(|a| a.cluster_id == cluster.id())
            .filter_map(|a| store.position(a.position_id).and_then(|p| p.occurred_at))
            .collect();
        times.sort_unstable();

        // Replay the pings: the first one registers a visit, after that a ping registers a new
        // visit only when it is more than the threshold past the last registered one.
        let mut last_visit = times[0];
        let mut visits = 1;
        for &when in &times[1..] {
            if when - last_visit > threshold {
                visits += 1;
                last_visit = when;
            }
        }

        assert_eq!(cluster.visit_count(), visits, "cluster {}", cluster.id());
        assert_eq!(cluster.last_visited_at(), last_visit, "cluster {}", cluster.id());
    }
}

#[test]
fn test_reprocessing_changes_nothing() {
    let mut engine = new_engine(database_store(&wandering_pings()));
    drain_terminal(&mut engine, TERMINAL, 25);

    let mut db = engine.into_store();
    let before = db.clusters_for_terminal(TERMINAL).unwrap();
    assert!(db.pending_positions(TERMINAL, 100).unwrap().is_empty());
    assert!(db.terminals_with_pending_positions().unwrap().is_empty());

    let mut engine = new_engine(db);
    let summary = engine.associate_for_terminal(TERMINAL, 25).unwrap();
    assert_eq!(summary.fetched, 0);
    assert_eq!(summary.processed, 0);

    let mut db = engine.into_store();
    assert_eq!(db.clusters_for_terminal(TERMINAL).unwrap(), before);
    assert_eq!(db.associations_for_terminal(TERMINAL, true).unwrap().len(), 60);
}

#[test]
fn test_anchors_never_move_and_time_never_goes_back() {
    let pings = wandering_pings();
    let mut engine = new_engine(memory_store(&pings));

    let mut seen: Vec<Cluster> = vec![];
    loop {
        let summary = engine.associate_for_terminal(TERMINAL, 4).unwrap();

        for cluster in engine.store().clusters() {
            if let Some(old) = seen.iter().find(|c| c.id() == cluster.id()) {
                assert_eq!(old.anchor(), cluster.anchor());
                assert!(old.visit_count() <= cluster.visit_count());
                assert!(old.last_visited_at() <= cluster.last_visited_at());
            }
        }
        seen = engine.store().clusters();

        if summary.fetched < 4 {
            break;
        }
    }

    assert!(!seen.is_empty());
}

#[test]
fn test_arrival_order_does_not_matter() {
    let pings = wandering_pings();
    let mut reversed = pings.clone();
    reversed.reverse();

    let in_order = cluster_both(&pings);
    let out_of_order = cluster_both(&reversed);

    assert_eq!(in_order.len(), out_of_order.len());
    for (left, right) in in_order.iter().zip(&out_of_order) {
        assert_eq!(left.anchor(), right.anchor());
        assert_eq!(left.visit_count(), right.visit_count());
        assert_eq!(left.last_visited_at(), right.last_visited_at());
    }
}

#[test]
fn test_late_ping_counts_as_a_visit_without_moving_last_visit_back() {
    let spot = pt(42.0, 42.0);
    let mut engine = new_engine(memory_store(&[(spot, at(12, 0))]));
    engine.associate_for_terminal(TERMINAL, 10).unwrap();

    // A ping that was delayed in transit shows up after its later neighbor was processed.
    let mut store = engine.into_store();
    store.add_position(TERMINAL, Some(spot), Some(at(10, 0)));

    let clusters = cluster_all(store);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].visit_count(), 2);
    assert_eq!(clusters[0].last_visited_at(), at(12, 0));
}

#[test]
fn test_bad_rows_never_block_good_ones() {
    let db = VisitDatabase::connect_in_memory().unwrap();
    {
        let mut add = db.prepare_to_add_positions().unwrap();
        add.add_raw(TERMINAL, None, Some(42.0), Some(at(11, 0))).unwrap();
        add.add_raw(TERMINAL, Some(142.0), Some(42.0), Some(at(11, 1))).unwrap();
        add.add_raw(TERMINAL, Some(42.0), Some(42.0), None).unwrap();
        add.add(TERMINAL, pt(42.0, 42.0), at(12, 0)).unwrap();
    }

    // The batch is no bigger than the run of bad rows that arrived first.
    let mut engine = new_engine(db);
    let report = drain_terminal(&mut engine, TERMINAL, 3);
    assert!(report.error.is_none());
    assert_eq!(report.summary.processed, 1);
    assert_eq!(report.summary.skipped, 3);

    let mut db = engine.into_store();
    let pending = db.pending_positions(TERMINAL, 10).unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|p| p.sample().is_err()));

    let clusters = db.clusters_for_terminal(TERMINAL).unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].last_visited_at(), at(12, 0));
}

/*-------------------------------------------------------------------------------------------------
 *                                      Batch driver
 *-----------------------------------------------------------------------------------------------*/
#[test]
fn test_batch_driver_on_database_file() {
    let path = std::env::temp_dir().join(format!("geovisit-test-{}.sqlite", std::process::id()));
    let _ = std::fs::remove_file(&path);

    VisitDatabase::initialize(&path).unwrap();
    {
        let db = VisitDatabase::connect(&path).unwrap();
        let mut add = db.prepare_to_add_positions().unwrap();

        for terminal in 1..=6 {
            // Two half hour stops, so every ping after the first at a stop merges.
            let base = pt(40.0 + terminal as f64, -100.0);
            for i in 0..12 {
                let spot = if i < 6 { base } else { pt(base.lat + 0.05, base.lon) };
                add.add(terminal, spot, at(8, 0) + Duration::minutes(5 * i))
                    .unwrap();
            }
        }
    }

    let options = BatchOptions {
        batch_size: 5,
        workers: 3,
        ..BatchOptions::default()
    };

    let db_path = path.clone();
    let summary = BatchDriver::new(move || VisitDatabase::connect(&db_path), options)
        .run()
        .unwrap();

    assert_eq!(summary.terminals, 6);
    assert_eq!(summary.busy, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.totals.processed, 72);
    assert_eq!(summary.totals.new_clusters, 12);
    assert_eq!(summary.totals.merges, 60);

    let mut db = VisitDatabase::connect(&path).unwrap();
    assert!(db.terminals_with_pending_positions().unwrap().is_empty());
    for terminal in 1..=6 {
        let clusters = db.clusters_for_terminal(terminal).unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.visit_count() == 1));
    }
    drop(db);

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
    let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
}

#[test]
fn test_batch_driver_skips_locked_terminal() {
    let path = std::env::temp_dir().join(format!(
        "geovisit-locked-test-{}.sqlite",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    VisitDatabase::initialize(&path).unwrap();
    {
        let db = VisitDatabase::connect(&path).unwrap();
        let mut add = db.prepare_to_add_positions().unwrap();
        add.add(1, pt(42.0, 42.0), at(12, 0)).unwrap();
        add.add(2, pt(42.0, 42.0), at(12, 0)).unwrap();
    }

    let locks = TerminalLocks::new();
    let guard = locks.try_lock(2).unwrap();

    let db_path = path.clone();
    let summary = BatchDriver::new(
        move || VisitDatabase::connect(&db_path),
        BatchOptions {
            workers: 1,
            ..BatchOptions::default()
        },
    )
    .with_locks(locks.clone())
    .run()
    .unwrap();
    drop(guard);

    assert_eq!(summary.terminals, 2);
    assert_eq!(summary.busy, 1);
    assert_eq!(summary.totals.processed, 1);

    let mut db = VisitDatabase::connect(&path).unwrap();
    assert_eq!(db.terminals_with_pending_positions().unwrap(), vec![2]);
    drop(db);

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
    let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
}
