use shardd::supervisor::liveness::{Escalation, WorkerWatch, check_escalation};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(30);
const ESCALATION_INTERVAL: Duration = Duration::from_secs(60);

fn watch_with_keepalive_at(t: Instant) -> WorkerWatch {
    let mut watch = WorkerWatch::new();
    watch.pid = 1234;
    watch.record_keepalive(t);
    watch
}

#[test]
fn test_quiet_worker_within_timeout_is_left_alone() {
    let base = Instant::now();
    let mut watch = watch_with_keepalive_at(base);
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(29), TIMEOUT, ESCALATION_INTERVAL),
        None
    );
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(30), TIMEOUT, ESCALATION_INTERVAL),
        None
    );
}

// Last keep-alive at t=0 with a 30s timeout: t=31 forces a core, nothing
// more happens inside the 60-second window, and t=61 kills.
#[test]
fn test_hung_worker_escalation_sequence() {
    let base = Instant::now();
    let mut watch = watch_with_keepalive_at(base);

    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(31), TIMEOUT, ESCALATION_INTERVAL),
        Some(Escalation::ForceCore)
    );
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(45), TIMEOUT, ESCALATION_INTERVAL),
        None
    );
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(60), TIMEOUT, ESCALATION_INTERVAL),
        None
    );
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(61), TIMEOUT, ESCALATION_INTERVAL),
        Some(Escalation::Kill)
    );
}

#[test]
fn test_kill_is_issued_exactly_once() {
    let base = Instant::now();
    let mut watch = watch_with_keepalive_at(base);
    let much_later = base + Duration::from_secs(120);
    assert_eq!(
        check_escalation(&mut watch, much_later, TIMEOUT, ESCALATION_INTERVAL),
        Some(Escalation::Kill)
    );
    for extra in 1..10 {
        assert_eq!(
            check_escalation(
                &mut watch,
                much_later + Duration::from_secs(extra),
                TIMEOUT,
                ESCALATION_INTERVAL
            ),
            None
        );
    }
}

#[test]
fn test_force_core_respects_escalation_interval() {
    let base = Instant::now();
    let mut watch = watch_with_keepalive_at(base);
    // A long timeout keeps the silence inside the force-core band.
    let timeout = Duration::from_secs(100);

    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(101), timeout, ESCALATION_INTERVAL),
        Some(Escalation::ForceCore)
    );
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(140), timeout, ESCALATION_INTERVAL),
        None
    );
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(161), timeout, ESCALATION_INTERVAL),
        Some(Escalation::ForceCore)
    );
}

#[test]
fn test_zero_timeout_disables_the_check() {
    let base = Instant::now();
    let mut watch = watch_with_keepalive_at(base);
    assert_eq!(
        check_escalation(
            &mut watch,
            base + Duration::from_secs(3600),
            Duration::ZERO,
            ESCALATION_INTERVAL
        ),
        None
    );
}

#[test]
fn test_worker_without_pid_is_not_escalated() {
    let base = Instant::now();
    let mut watch = WorkerWatch::new();
    watch.record_keepalive(base);
    assert_eq!(
        check_escalation(&mut watch, base + Duration::from_secs(120), TIMEOUT, ESCALATION_INTERVAL),
        None
    );
}

#[test]
fn test_regressive_keepalive_is_ignored() {
    let base = Instant::now();
    let later = base + Duration::from_secs(10);
    let mut watch = WorkerWatch::new();
    watch.pid = 1;
    watch.record_keepalive(later);
    watch.record_keepalive(base); // clock went backwards
    assert_eq!(watch.last_keepalive, Some(later));
}
