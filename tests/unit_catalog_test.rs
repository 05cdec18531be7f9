use shardd::core::catalog::{Catalog, TargetHost};
use std::io::Write;

const SAMPLE: &str = r#"
# cluster process catalog
GameServer     any    ./game-server  -- --profile low
PlanetServer   any    ./planet-server
LogServer      local  ./log-server
ChatServer     node2  ./chat-server
"#;

#[test]
fn test_parse_basic_entries() {
    let catalog = Catalog::parse(SAMPLE);
    assert_eq!(catalog.len(), 4);

    let game = catalog.get("GameServer").unwrap();
    assert_eq!(game.target_host, TargetHost::Any);
    assert_eq!(game.executable, "./game-server");
    assert_eq!(game.options, "-- --profile low");

    let log = catalog.get("LogServer").unwrap();
    assert_eq!(log.target_host, TargetHost::Local);

    let chat = catalog.get("ChatServer").unwrap();
    assert_eq!(chat.target_host, TargetHost::Node("node2".to_string()));
}

#[test]
fn test_comments_and_blank_lines_are_ignored() {
    let catalog = Catalog::parse("# only a comment\n\n   \n");
    assert!(catalog.is_empty());
}

#[test]
fn test_malformed_entries_are_skipped() {
    let catalog = Catalog::parse("JustAName\nNameAndHost any\nOk any ./bin\n");
    assert_eq!(catalog.len(), 1);
    assert!(catalog.get("Ok").is_some());
}

#[test]
fn test_duplicate_entry_later_wins() {
    let catalog = Catalog::parse("A any ./first\nA any ./second\n");
    assert_eq!(catalog.get("A").unwrap().executable, "./second");
}

#[test]
fn test_command_line_composition() {
    let catalog = Catalog::parse("GameServer any ./game-server --default opt\n");
    let template = catalog.get("GameServer").unwrap();
    assert_eq!(
        template.command_line("--extra 1"),
        "./game-server --default opt --extra 1"
    );
    assert_eq!(template.command_line(""), "./game-server --default opt");
}

#[test]
fn test_numeric_host_resolves_to_address() {
    let catalog = Catalog::parse("Db 127.0.0.1 ./db-server\n");
    assert_eq!(
        catalog.get("Db").unwrap().target_host,
        TargetHost::Address("127.0.0.1".to_string())
    );
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "GameServer any ./game-server").unwrap();
    let catalog = Catalog::load(file.path());
    assert_eq!(catalog.len(), 1);
}

#[test]
fn test_missing_file_yields_empty_catalog() {
    let catalog = Catalog::load("/definitely/not/a/real/catalog.rc");
    assert!(catalog.is_empty());
}
