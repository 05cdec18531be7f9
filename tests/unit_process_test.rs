use shardd::core::process::tokenize_command_line;

#[test]
fn test_tokenize_simple_command() {
    assert_eq!(
        tokenize_command_line("./game-server --port 9000"),
        vec!["./game-server", "--port", "9000"]
    );
}

#[test]
fn test_tokenize_collapses_repeated_spaces() {
    assert_eq!(
        tokenize_command_line("  ./bin   --a  b "),
        vec!["./bin", "--a", "b"]
    );
}

#[test]
fn test_tokenize_honors_quotes() {
    assert_eq!(
        tokenize_command_line(r#"./bin --name "Mos Eisley" --x"#),
        vec!["./bin", "--name", "Mos Eisley", "--x"]
    );
}

#[test]
fn test_tokenize_empty_line() {
    assert!(tokenize_command_line("   ").is_empty());
}

#[cfg(unix)]
mod os_host {
    use shardd::core::process::{OsProcessHost, ProcessHost};
    use std::time::Duration;

    #[test]
    fn test_spawn_liveness_and_terminate() {
        let host = OsProcessHost::new();
        let pid = host.spawn("sleep 30").unwrap();
        assert!(pid > 0);
        assert!(host.is_alive(pid));

        host.terminate(pid);
        // Termination reaps the child; the table must agree it is gone.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!host.is_alive(pid));
    }

    #[test]
    fn test_exited_child_is_reaped() {
        let host = OsProcessHost::new();
        let pid = host.spawn("true").unwrap();
        // Give the trivial child a moment to exit.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!host.is_alive(pid));
    }

    #[test]
    fn test_spawn_failure_reports_error() {
        let host = OsProcessHost::new();
        assert!(host.spawn("/definitely/not/a/binary").is_err());
        assert!(host.spawn("").is_err());
    }

    #[test]
    fn test_read_command_line_of_spawned_child() {
        let host = OsProcessHost::new();
        let pid = host.spawn("sleep 31").unwrap();
        let cmd = host.read_command_line(pid).unwrap_or_default();
        assert!(cmd.contains("sleep"), "unexpected command line: {cmd}");
        host.terminate(pid);
    }
}
