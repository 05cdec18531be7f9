// tests/property/escalation_test.rs

//! Properties of keep-alive escalation: at most one kill per hung worker,
//! and force-core attempts spaced by at least the escalation interval.

use proptest::prelude::*;
use shardd::supervisor::liveness::{Escalation, WorkerWatch, check_escalation};
use std::time::{Duration, Instant};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_escalation_counts_and_spacing(
        timeout_secs in 10u64..120,
        check_offsets in prop::collection::vec(1u64..400, 1..64),
    ) {
        let timeout = Duration::from_secs(timeout_secs);
        let escalation_interval = Duration::from_secs(60);
        let base = Instant::now();

        let mut watch = WorkerWatch::new();
        watch.pid = 99;
        watch.record_keepalive(base);

        let mut offsets = check_offsets.clone();
        offsets.sort_unstable();

        let mut kills = 0usize;
        let mut force_core_times: Vec<u64> = Vec::new();

        for offset in offsets {
            let now = base + Duration::from_secs(offset);
            match check_escalation(&mut watch, now, timeout, escalation_interval) {
                Some(Escalation::Kill) => {
                    kills += 1;
                    // A kill only fires past double the timeout.
                    prop_assert!(offset > 2 * timeout_secs);
                }
                Some(Escalation::ForceCore) => {
                    // Force-core only fires inside the (timeout, 2*timeout] band.
                    prop_assert!(offset > timeout_secs);
                    prop_assert!(offset <= 2 * timeout_secs);
                    force_core_times.push(offset);
                }
                None => {}
            }
        }

        prop_assert!(kills <= 1, "issued {kills} kills");
        for window in force_core_times.windows(2) {
            prop_assert!(
                window[1] - window[0] >= 60,
                "force-core attempts {}s apart",
                window[1] - window[0]
            );
        }
    }

    // Once a kill has been issued, no further escalation of any kind fires.
    #[test]
    fn test_nothing_follows_the_kill(
        extra_offsets in prop::collection::vec(1u64..1000, 1..32),
    ) {
        let timeout = Duration::from_secs(30);
        let escalation_interval = Duration::from_secs(60);
        let base = Instant::now();

        let mut watch = WorkerWatch::new();
        watch.pid = 99;
        watch.record_keepalive(base);

        let kill_time = base + Duration::from_secs(61);
        prop_assert_eq!(
            check_escalation(&mut watch, kill_time, timeout, escalation_interval),
            Some(Escalation::Kill)
        );

        for offset in extra_offsets {
            let now = kill_time + Duration::from_secs(offset);
            prop_assert_eq!(
                check_escalation(&mut watch, now, timeout, escalation_interval),
                None
            );
        }
    }
}
