use shardd::config::Config;
use std::io::Write;
use std::time::Duration;

fn load(toml: &str) -> anyhow::Result<Config> {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{toml}").unwrap();
    Config::from_file(file.path().to_str().unwrap())
}

#[test]
fn test_empty_file_uses_defaults() {
    let config = load("").unwrap();
    assert_eq!(config.cluster_name, "cluster");
    assert_eq!(config.tick_rate_hz, 4.0);
    assert_eq!(config.tick_interval(), Duration::from_millis(250));
    assert_eq!(config.liveness.worker_timeout, Duration::from_secs(30));
    assert!(config.verify_cluster_name);
}

#[test]
fn test_full_config_parses() {
    let config = load(
        r#"
cluster_name = "beta"
nodes = ["host-a", "host-b", "host-c"]
node_label = "node1"
maximum_load = 5.0
tick_rate_hz = 8.0

[liveness]
worker_timeout = "45s"
escalation_interval = "2m"

[restart]
restart_central = false

[time_check]
interval = "30s"
tolerance = "5s"

[metrics]
enabled = true
port = 9200
"#,
    )
    .unwrap();
    assert_eq!(config.cluster_name, "beta");
    assert_eq!(config.resolve_local_node(), ("node1".to_string(), 1));
    assert_eq!(config.liveness.worker_timeout, Duration::from_secs(45));
    assert_eq!(
        config.liveness.escalation_interval,
        Duration::from_secs(120)
    );
    assert!(!config.restart.restart_central);
    assert!(config.metrics.enabled);
}

#[test]
fn test_duplicate_service_ports_rejected() {
    let err = load("peer_service_port = 7000\ntask_service_port = 7000\n").unwrap_err();
    assert!(err.to_string().contains("distinct"));
}

#[test]
fn test_zero_tick_rate_rejected() {
    assert!(load("tick_rate_hz = 0.0").is_err());
}

#[test]
fn test_out_of_range_node_label_rejected() {
    let err = load("nodes = [\"a\", \"b\"]\nnode_label = \"node7\"\n").unwrap_err();
    assert!(err.to_string().contains("node7"));
}

#[test]
fn test_load_cost_matches_by_substring() {
    let config = load("[load_costs]\nGameServer = 1.5\nPlanetServer = 3.0\n").unwrap();
    assert_eq!(config.load_cost("SwgGameServer"), 1.5);
    assert_eq!(config.load_cost("PlanetServer"), 3.0);
    assert_eq!(config.load_cost("SomethingElse"), 0.0);
}

#[test]
fn test_restart_delay_matches_command_line() {
    let config = load("").unwrap();
    assert_eq!(
        config.restart_delay("./shardd --central central.toml CentralServer"),
        Duration::from_secs(30)
    );
    assert_eq!(
        config.restart_delay("./log-server LogServer --x"),
        Duration::from_secs(5)
    );
    assert_eq!(config.restart_delay("./unrelated"), Duration::ZERO);
}

#[test]
fn test_empty_node_list_resolves_to_master() {
    let config = load("").unwrap();
    assert_eq!(config.resolve_local_node(), ("node0".to_string(), 0));
}
