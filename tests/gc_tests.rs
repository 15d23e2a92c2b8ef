use std::sync::{Arc, Mutex};
use std::time::Duration;

use tshead::*;

fn labels(pairs: &[&str]) -> Labels {
    Labels::from_strings(pairs).unwrap()
}

#[derive(Debug, Default)]
struct CollectEvents(Mutex<Vec<HeadEvent>>);

impl HeadEventListener for CollectEvents {
    fn on_event(&self, event: HeadEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn head_with_clock(clock: Arc<ManualClock>) -> Head {
    Head::with_options(HeadOptions {
        stripe_size: 8,
        retention: Duration::from_secs(60),
        clock,
        ..HeadOptions::default()
    })
    .unwrap()
}

#[test]
fn gc_keeps_references_of_live_series() {
    let clock = Arc::new(ManualClock::new(0));
    let head = head_with_clock(clock.clone());

    let mut app = head.appender();
    let live = app.add(&labels(&["a", "live"]), 0, 1.0).unwrap();
    let idle = app.add(&labels(&["a", "idle"]), 0, 1.0).unwrap();
    app.commit().unwrap();

    clock.advance(Duration::from_secs(50));
    let mut app = head.appender();
    app.add_fast(live, 1, 2.0).unwrap();
    app.commit().unwrap();

    clock.advance(Duration::from_secs(20));
    let stats = head.gc().unwrap();
    assert_eq!(stats.removed_series, 1);
    assert_eq!(stats.live_series, 1);

    // The reference taken before gc still resolves to the same series.
    let snap = head.series(live).unwrap().unwrap();
    assert_eq!(snap.labels, labels(&["a", "live"]));
    assert_eq!(snap.num_samples(), 2);
    let mut app = head.appender();
    app.add_fast(live, 2, 3.0).unwrap();
    assert_eq!(app.commit().unwrap().appended, 1);

    assert!(head.series(idle).unwrap().is_none());
    let mut app = head.appender();
    assert!(matches!(
        app.add_fast(idle, 5, 1.0),
        Err(HeadError::UnknownReference(r)) if r == idle
    ));
    head.index().check_consistency().unwrap();
}

#[test]
fn collected_references_are_never_reissued() {
    let clock = Arc::new(ManualClock::new(0));
    let head = head_with_clock(clock.clone());
    let (old, _) = head.get_or_create(&labels(&["a", "1"])).unwrap();

    clock.advance(Duration::from_secs(120));
    assert_eq!(head.gc().unwrap().removed_series, 1);

    let (new, created) = head.get_or_create(&labels(&["a", "1"])).unwrap();
    assert!(created);
    assert_ne!(old, new);
    assert!(head.series(old).unwrap().is_none());
}

#[test]
fn pending_series_survive_gc() {
    let clock = Arc::new(ManualClock::new(0));
    let head = head_with_clock(clock.clone());
    let (r, _) = head.get_or_create(&labels(&["a", "1"])).unwrap();

    let mut app = head.appender();
    app.add_fast(r, 100, 1.0).unwrap();
    clock.advance(Duration::from_secs(120));
    assert_eq!(head.gc().unwrap().removed_series, 0);

    assert_eq!(app.commit().unwrap().appended, 1);
    // The commit refreshed the last-write time.
    assert_eq!(head.gc().unwrap().removed_series, 0);
    clock.advance(Duration::from_secs(61));
    assert_eq!(head.gc().unwrap().removed_series, 1);
}

#[test]
fn gc_events_and_background_housekeeping() {
    let clock = Arc::new(ManualClock::new(0));
    let events = Arc::new(CollectEvents::default());
    let head = Head::with_options(HeadOptions {
        stripe_size: 8,
        retention: Duration::from_secs(60),
        // Long enough that only explicit requests run gc during the test.
        gc_interval: Some(Duration::from_secs(3600)),
        clock: clock.clone(),
        event_listener: events.clone(),
        ..HeadOptions::default()
    })
    .unwrap();

    head.get_or_create(&labels(&["a", "1"])).unwrap();
    head.get_or_create(&labels(&["a", "2"])).unwrap();
    clock.advance(Duration::from_secs(61));

    let stats = head.request_gc().unwrap();
    assert_eq!(stats.removed_series, 2);
    assert_eq!(stats.live_series, 0);
    assert_eq!(stats.cutoff, 1_000);
    head.close().unwrap();

    let seen = events.0.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&HeadEvent::HousekeepingStarted));
    assert!(seen.contains(&HeadEvent::GcCompleted {
        removed_series: 2,
        live_series: 0,
        cutoff: 1_000,
    }));
    assert_eq!(seen.last(), Some(&HeadEvent::HousekeepingStopping));
}

#[test]
fn request_gc_without_housekeeping_runs_inline() {
    let clock = Arc::new(ManualClock::new(0));
    let head = head_with_clock(clock.clone());
    head.get_or_create(&labels(&["a", "1"])).unwrap();
    clock.advance(Duration::from_secs(61));
    assert_eq!(head.request_gc().unwrap().removed_series, 1);
}

#[test]
fn timed_gc_checkpoints_when_configured() {
    let events = Arc::new(CollectEvents::default());
    let head = Head::with_options(HeadOptions {
        stripe_size: 8,
        gc_interval: Some(Duration::from_millis(10)),
        checkpoint_on_gc: true,
        event_listener: events.clone(),
        ..HeadOptions::default()
    })
    .unwrap();
    let mut app = head.appender();
    app.add(&labels(&["a", "1"]), 1, 1.0).unwrap();
    app.commit().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let checkpointed = |seen: &[HeadEvent]| {
        seen.contains(&HeadEvent::CheckpointCompleted {
            series: 1,
            samples: 1,
        })
    };
    while !checkpointed(events.0.lock().unwrap().as_slice()) {
        assert!(std::time::Instant::now() < deadline, "no checkpoint after timed gc");
        std::thread::sleep(Duration::from_millis(5));
    }
    head.close().unwrap();
}
