use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use tshead::*;

fn labels(pairs: &[&str]) -> Labels {
    Labels::from_strings(pairs).unwrap()
}

fn small_head() -> Head {
    Head::with_options(HeadOptions {
        stripe_size: 8,
        ..HeadOptions::default()
    })
    .unwrap()
}

#[test]
fn same_labels_resolve_to_same_reference() {
    let head = small_head();
    let (r1, created1) = head.get_or_create(&labels(&["a", "1", "b", "2"])).unwrap();
    // Order of construction does not matter: label sets are sorted.
    let (r2, created2) = head.get_or_create(&labels(&["b", "2", "a", "1"])).unwrap();
    let (r3, created3) = head.get_or_create(&labels(&["a", "1", "b", "3"])).unwrap();

    assert!(created1);
    assert!(!created2);
    assert!(created3);
    assert_eq!(r1, r2);
    assert_ne!(r1, r3);
    assert_eq!(head.stats().num_series, 2);
    head.index().check_consistency().unwrap();
}

#[test]
fn empty_label_set_is_rejected() {
    let head = small_head();
    assert!(matches!(
        head.get_or_create(&Labels::empty()),
        Err(HeadError::EmptyLabelSet)
    ));
    let mut app = head.appender();
    assert!(matches!(
        app.add(&Labels::empty(), 0, 1.0),
        Err(HeadError::EmptyLabelSet)
    ));
}

#[test]
fn concurrent_get_or_create_creates_once() {
    const THREADS: usize = 16;
    let head = Arc::new(small_head());
    let barrier = Arc::new(Barrier::new(THREADS));
    let ls = labels(&["job", "race"]);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let head = Arc::clone(&head);
            let barrier = Arc::clone(&barrier);
            let ls = ls.clone();
            thread::spawn(move || {
                barrier.wait();
                head.get_or_create(&ls).unwrap()
            })
        })
        .collect();

    let results: Vec<(SeriesRef, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let refs: HashSet<SeriesRef> = results.iter().map(|(r, _)| *r).collect();
    assert_eq!(refs.len(), 1);
    assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
    assert_eq!(head.stats().num_series, 1);
}

#[test]
fn many_threads_many_series_stay_consistent() {
    let head = Arc::new(small_head());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let head = Arc::clone(&head);
            thread::spawn(move || {
                let mut refs = Vec::new();
                // Every thread asks for the same 500 series plus 100 of its own.
                for i in 0..500 {
                    let v = i.to_string();
                    refs.push(head.get_or_create(&labels(&["shared", v.as_str()])).unwrap().0);
                }
                for i in 0..100 {
                    let v = format!("{}-{}", t, i);
                    head.get_or_create(&labels(&["own", v.as_str()])).unwrap();
                }
                refs
            })
        })
        .collect();

    let all: Vec<Vec<SeriesRef>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for refs in &all[1..] {
        assert_eq!(refs, &all[0]);
    }
    assert_eq!(head.stats().num_series, 500 + 8 * 100);
    head.index().check_consistency().unwrap();
}

#[test]
fn monotonicity_scenario() {
    let head = small_head();
    let ls = labels(&["a", "1"]);

    let mut app = head.appender();
    let r = app.add(&ls, 0, 1.0).unwrap();
    app.add_fast(r, 1, 2.0).unwrap();
    let summary = app.commit().unwrap();
    assert_eq!(summary.appended, 2);

    let mut app = head.appender();
    let err = app.add(&ls, 1, 3.0).unwrap_err();
    assert!(matches!(
        err,
        HeadError::DuplicateSample { timestamp: 1, .. } | HeadError::OutOfOrderSample { timestamp: 1, .. }
    ));
    assert_eq!(app.add(&ls, 2, 3.0).unwrap(), r);
    assert!(app.commit().unwrap().is_complete());

    let snap = head.series(r).unwrap().unwrap();
    let ts: Vec<Timestamp> = snap.samples().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![0, 1, 2]);
    assert_eq!(snap.last, Some(Sample::new(2, 3.0)));
}

#[test]
fn older_and_identical_samples_are_out_of_order() {
    let head = small_head();
    let ls = labels(&["a", "1"]);
    let mut app = head.appender();
    let r = app.add(&ls, 10, 1.0).unwrap();
    app.commit().unwrap();

    let mut app = head.appender();
    assert!(matches!(
        app.add_fast(r, 9, 1.0),
        Err(HeadError::OutOfOrderSample { timestamp: 9, last: 10, .. })
    ));
    assert!(matches!(
        app.add_fast(r, 10, 1.0),
        Err(HeadError::OutOfOrderSample { timestamp: 10, .. })
    ));
    assert!(matches!(
        app.add_fast(r, 10, 2.0),
        Err(HeadError::DuplicateSample { timestamp: 10, .. })
    ));
    assert!(app.is_empty());
}

#[test]
fn unknown_reference_is_reported() {
    let head = small_head();
    let mut app = head.appender();
    assert!(matches!(
        app.add_fast(SeriesRef(12345), 0, 1.0),
        Err(HeadError::UnknownReference(SeriesRef(12345)))
    ));
    assert!(head.series(SeriesRef(12345)).unwrap().is_none());
}

#[test]
fn snapshots_by_labels_and_reference_agree() {
    let head = small_head();
    let ls = labels(&["job", "api", "instance", "a"]);
    let mut app = head.appender();
    let r = app.add(&ls, 100, 1.5).unwrap();
    app.commit().unwrap();

    let by_ref = head.series(r).unwrap().unwrap();
    let by_labels = head.series_by_labels(&ls).unwrap().unwrap();
    assert_eq!(by_ref.series_ref, by_labels.series_ref);
    assert_eq!(by_ref.labels, ls);
    assert_eq!(by_labels.num_samples(), 1);
    assert!(head
        .series_by_labels(&labels(&["job", "other"]))
        .unwrap()
        .is_none());
}

#[test]
fn chunks_rotate_at_sample_bound() {
    let head = Head::with_options(HeadOptions {
        stripe_size: 4,
        samples_per_chunk: 12,
        ..HeadOptions::default()
    })
    .unwrap();
    let mut app = head.appender();
    let r = app.add(&labels(&["a", "1"]), 0, 0.0).unwrap();
    for t in 1..36 {
        app.add_fast(r, t, t as f64).unwrap();
    }
    let summary = app.commit().unwrap();
    assert_eq!(summary.appended, 36);
    assert_eq!(summary.chunks_created, 3);

    let snap = head.series(r).unwrap().unwrap();
    assert_eq!(snap.chunks.len(), 2);
    assert!(snap.chunks.iter().all(|c| c.len() == 12));
    assert_eq!(snap.num_samples(), 36);
}

#[test]
fn samples_below_min_valid_time_are_out_of_bounds() {
    let head = Head::with_options(HeadOptions {
        stripe_size: 4,
        min_valid_time: 1_000,
        ..HeadOptions::default()
    })
    .unwrap();
    let mut app = head.appender();
    assert!(matches!(
        app.add(&labels(&["a", "1"]), 999, 0.0),
        Err(HeadError::OutOfBounds { timestamp: 999, min_valid_time: 1_000 })
    ));
    // The check runs before the series is created.
    assert_eq!(head.stats().num_series, 0);
    app.add(&labels(&["a", "1"]), 1_000, 0.0).unwrap();
}

#[test]
fn invalid_options_are_rejected() {
    let err = Head::with_options(HeadOptions {
        stripe_size: 12,
        ..HeadOptions::default()
    })
    .unwrap_err();
    assert!(matches!(err, HeadError::Config(_)));
}
