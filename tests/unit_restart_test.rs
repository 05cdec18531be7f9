use shardd::supervisor::restart::{RestartQueue, RestartRequest, is_restart_class};
use std::time::{Duration, Instant};

#[test]
fn test_always_restart_classes_match() {
    assert!(is_restart_class("./log-server LogServer", false));
    assert!(is_restart_class("./metrics MetricsServer --port 1", false));
    assert!(is_restart_class("CommoditiesServer", false));
    assert!(is_restart_class("CommodityServer", false));
    assert!(is_restart_class("./transfer TransferServer", false));
}

#[test]
fn test_central_restart_is_flag_gated() {
    let cmd = "./shardd --central central.toml CentralServer";
    assert!(is_restart_class(cmd, true));
    assert!(!is_restart_class(cmd, false));
}

#[test]
fn test_game_workers_are_not_restart_classes() {
    assert!(!is_restart_class("./game-server GameServer", true));
}

fn request(cmd: &str, queued: Instant, delay_secs: u64) -> RestartRequest {
    RestartRequest {
        command_line: cmd.to_string(),
        time_queued: queued,
        delay: Duration::from_secs(delay_secs),
    }
}

#[test]
fn test_promote_one_per_call() {
    let base = Instant::now();
    let mut queue = RestartQueue::new();
    queue.push(request("a", base, 0));
    queue.push(request("b", base, 0));

    let first = queue.promote_one(base).unwrap();
    assert_eq!(first.command_line, "a");
    assert_eq!(queue.len(), 1);

    let second = queue.promote_one(base).unwrap();
    assert_eq!(second.command_line, "b");
    assert!(queue.promote_one(base).is_none());
}

#[test]
fn test_delay_gates_promotion() {
    let base = Instant::now();
    let mut queue = RestartQueue::new();
    queue.push(request("slow", base, 30));
    queue.push(request("fast", base, 0));

    // The delayed request is skipped over; the eligible one promotes.
    let promoted = queue.promote_one(base + Duration::from_secs(1)).unwrap();
    assert_eq!(promoted.command_line, "fast");
    assert!(queue.promote_one(base + Duration::from_secs(1)).is_none());

    let promoted = queue.promote_one(base + Duration::from_secs(31)).unwrap();
    assert_eq!(promoted.command_line, "slow");
}
