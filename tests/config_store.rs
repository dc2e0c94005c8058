//! End-to-end tests for the SSH config store: round-trip fidelity, edit
//! semantics and validator behavior against literal file content.

use devgate::Error;
use devgate::sshconfig::{HostEntry, SshConfigDoc, SshConfigStore, validator};

fn store_with(content: &str) -> (tempfile::TempDir, SshConfigStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config");
    std::fs::write(&path, content).unwrap();
    let store = SshConfigStore::open(path).unwrap();
    (dir, store)
}

#[tokio::test]
async fn rename_second_alias_of_multi_alias_line() {
    let (_dir, store) = store_with("Host web1 web\n  HostName 1.2.3.4\n");
    store.rename_host("web", "www").await.unwrap();
    assert_eq!(
        std::fs::read_to_string(store.path()).unwrap(),
        "Host web1 www\n  HostName 1.2.3.4\n"
    );
}

#[tokio::test]
async fn reorder_moves_comments_with_their_blocks() {
    let (_dir, store) =
        store_with("# A\nHost a\n  HostName a.com\n\n# B\nHost b\n  HostName b.com\n");
    store
        .reorder_hosts(&["b".to_string(), "a".to_string()])
        .await
        .unwrap();

    let text = std::fs::read_to_string(store.path()).unwrap();
    assert_eq!(
        text,
        "# B\nHost b\n  HostName b.com\n\n# A\nHost a\n  HostName a.com\n"
    );
    // Each comment appears exactly once.
    assert_eq!(text.matches("# A").count(), 1);
    assert_eq!(text.matches("# B").count(), 1);
}

#[test]
fn validator_reports_incomplete_match_criterion() {
    let err = validator::validate("Match User").unwrap_err();
    let msg = err.to_ui_string();
    assert!(
        msg.contains("line 1: Match criterion 'User' requires a value"),
        "unexpected message: {msg}"
    );
}

#[test]
fn accepted_files_round_trip_byte_identically() {
    let fixtures = [
        "",
        "Host a\n  HostName x\n",
        "# lead\n\n# owned\nHost a\n\tHostName x\n\tPort 2222\n\nInclude ~/.ssh/work\n",
        "Host *\n  ServerAliveInterval 60\n\nHost a b c\n  HostName x\n",
        "Host a\n  HostName x", // no trailing newline
    ];
    for fixture in fixtures {
        if validator::validate(fixture).is_ok() {
            assert_eq!(
                SshConfigDoc::parse(fixture).serialize(),
                fixture,
                "round-trip broke for {fixture:?}"
            );
        }
    }
}

#[tokio::test]
async fn mutation_then_serialize_reparses_equivalently() {
    let (_dir, store) = store_with("Host a\n  HostName a.com\n");
    store.set_param("a", "Port", "2200").await.unwrap();
    store
        .add_host(&HostEntry {
            host_name: Some("b.example".into()),
            user: Some("deploy".into()),
            ..HostEntry::named("b")
        })
        .await
        .unwrap();

    let reparsed = SshConfigDoc::parse(&store.raw_content().await);
    let a = reparsed.get_host("a").unwrap();
    assert_eq!(a.port, 2200);
    let b = reparsed.get_host("b").unwrap();
    assert_eq!(b.host_name.as_deref(), Some("b.example"));
    assert_eq!(b.user.as_deref(), Some("deploy"));
}

#[test]
fn port_boundaries_validate_exactly() {
    for (port, expect_ok) in [(0u32, false), (1, true), (22, true), (65535, true), (65536, false)] {
        let text = format!("Host a\n  Port {port}\n");
        assert_eq!(
            validator::validate(&text).is_ok(),
            expect_ok,
            "port {port} validated wrong"
        );
    }
}

#[test]
fn hostname_length_253_is_the_boundary() {
    let ok = format!("Host a\n  HostName {}\n", "h".repeat(253));
    assert!(validator::validate(&ok).is_ok());
    let too_long = format!("Host a\n  HostName {}\n", "h".repeat(254));
    assert!(validator::validate(&too_long).is_err());
}

#[test]
fn whitespace_only_values_are_rejected_where_required() {
    assert!(validator::validate("Host a\n  HostName   \n").is_err());
    assert!(validator::validate("Host a\n  User \"\"\n").is_err());
}

#[tokio::test]
async fn lookup_prefers_exact_over_wildcard_and_skips_star() {
    let (_dir, store) = store_with(
        "Host *\n  Compression yes\n\nHost web-*\n  User wildcard\n\nHost web-1\n  User exact\n",
    );
    assert_eq!(
        store.get_host("web-1").await.unwrap().user.as_deref(),
        Some("exact")
    );
    assert_eq!(
        store.get_host("web-9").await.unwrap().user.as_deref(),
        Some("wildcard")
    );
    assert!(matches!(
        store.get_host("db").await,
        Err(Error::HostNotFound(_))
    ));
}

#[tokio::test]
async fn remove_host_of_second_alias_block_keeps_neighbors_intact() {
    let (_dir, store) = store_with(
        "# keep me\nHost keeper\n  HostName k.com\n\n# goner comment\nHost gone alt\n  HostName g.com\n",
    );
    store.remove_host("alt").await.unwrap();
    let text = std::fs::read_to_string(store.path()).unwrap();
    assert_eq!(text, "# keep me\nHost keeper\n  HostName k.com\n");
}

#[tokio::test]
async fn save_raw_content_refuses_invalid_and_keeps_file() {
    let original = "Host a\n  HostName a.com\n";
    let (_dir, store) = store_with(original);

    let err = store
        .save_raw_content("Host a\n  Port 99999\n")
        .await
        .unwrap_err();
    assert!(err.to_ui_string().contains("Port must be a number between 1 and 65535"));
    assert_eq!(std::fs::read_to_string(store.path()).unwrap(), original);

    store
        .save_raw_content("Host renamed\n  HostName r.com\n")
        .await
        .unwrap();
    assert!(store.get_host("renamed").await.is_ok());
}

#[tokio::test]
async fn set_param_empty_value_removes_directive() {
    let (_dir, store) = store_with("Host a\n  HostName a.com\n  IdentityFile ~/.ssh/id\n");
    store.set_param("a", "IdentityFile", "").await.unwrap();
    assert!(store.get_host("a").await.unwrap().identity_file.is_none());
    assert_eq!(
        std::fs::read_to_string(store.path()).unwrap(),
        "Host a\n  HostName a.com\n"
    );
}
