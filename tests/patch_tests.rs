//! Integration tests for the patch engine.
//!
//! Covers rewriting in place, uncommenting, the not-found policies,
//! duplicate handling and idempotency on realistic libvirt/nova files.

use crucible::patch::{
    ConfigDocument, ConfigPatcher, Delimiter, NotFoundPolicy, PatchDirective,
};
use crucible::Error;
use pretty_assertions::assert_eq;

const LIBVIRTD_CONF: &str = r#"# Master libvirt daemon configuration file
#
#################################################################
#
# Network connectivity controls
#

# Flag listening for secure TLS connections on the public TCP/IP port.
#listen_tls = 0

# Listen for unencrypted TCP connections on the public TCP/IP port.
#listen_tcp = 1

# Override the port for accepting secure TLS connections
#tls_port = "16514"

# Override the port for accepting insecure TCP connections
#tcp_port = "16509"

# Change the authentication scheme for TCP sockets.
#auth_tcp = "sasl"
"#;

fn doc(lines: &[&str]) -> ConfigDocument {
    ConfigDocument::from_lines("test.conf", lines.iter().copied())
}

fn patch(document: &ConfigDocument, directives: &[PatchDirective]) -> ConfigDocument {
    ConfigPatcher::new()
        .apply(document, directives)
        .expect("patch should succeed")
        .0
}

// ============================================================================
// Basic rewrite behaviour
// ============================================================================

#[test]
fn test_rewrite_keeps_spacing_of_found_delimiter() {
    let input = doc(&["foo = 1\n", "bar = 2\n"]);
    let out = patch(&input, &[PatchDirective::new("foo", "9").literal("=")]);
    assert_eq!(out.lines(), ["foo = 9\n", "bar = 2\n"]);
}

#[test]
fn test_commented_entry_is_uncommented() {
    let input = doc(&["# foo = 1\n"]);
    let out = patch(&input, &[PatchDirective::new("foo", "9").literal("=")]);
    assert_eq!(out.lines(), ["foo = 9\n"]);
}

#[test]
fn test_append_when_missing() {
    let input = doc(&["bar = 2\n"]);
    let out = patch(
        &input,
        &[PatchDirective::new("foo", "9")
            .literal("=")
            .not_found(NotFoundPolicy::Append)],
    );
    assert_eq!(out.lines(), ["bar = 2\n", "foo=9\n"]);
}

#[test]
fn test_fail_when_missing_leaves_input_alone() {
    let input = doc(&["bar = 2\n"]);
    let err = ConfigPatcher::new()
        .apply(
            &input,
            &[PatchDirective::new("foo", "9")
                .literal("=")
                .not_found(NotFoundPolicy::Fail)],
        )
        .unwrap_err();

    match err {
        Error::PatchNotFound { tokens, .. } => assert_eq!(tokens, vec!["foo".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(input.lines(), ["bar = 2\n"]);
}

#[test]
fn test_fail_lists_every_missing_token() {
    let input = doc(&["a = 1\n"]);
    let err = ConfigPatcher::new()
        .apply(
            &input,
            &[
                PatchDirective::new("x", "1").not_found(NotFoundPolicy::Fail),
                PatchDirective::new("a", "2").not_found(NotFoundPolicy::Fail),
                PatchDirective::new("y", "1").not_found(NotFoundPolicy::Fail),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, Error::PatchNotFound { ref tokens, .. } if tokens == &["x", "y"]));
    assert_eq!(err.exit_code(), 4);
}

// ============================================================================
// Realistic files
// ============================================================================

#[test]
fn test_libvirtd_live_migration_settings() {
    let input = ConfigDocument::from_text("libvirtd.conf", LIBVIRTD_CONF);
    let directives = [
        PatchDirective::new("listen_tls", "0"),
        PatchDirective::new("listen_tcp", "1"),
        PatchDirective::new("auth_tcp", "\"none\""),
        PatchDirective::new("max_clients", "5000").not_found(NotFoundPolicy::Append),
    ];

    let (out, report) = ConfigPatcher::new().apply(&input, &directives).unwrap();
    let text = out.to_text();

    assert!(text.contains("\nlisten_tls = 0\n"));
    assert!(text.contains("\nlisten_tcp = 1\n"));
    assert!(text.contains("\nauth_tcp = \"none\"\n"));
    assert!(text.ends_with("max_clients=5000\n"));
    // Untouched commented entries and prose stay as they were
    assert!(text.contains("#tls_port = \"16514\"\n"));
    assert!(text.contains("# Change the authentication scheme for TCP sockets.\n"));

    assert_eq!(report.rewritten.len(), 3);
    assert_eq!(report.appended, vec!["max_clients=5000\n".to_string()]);
    assert!(report.changed);
    assert_eq!(out.len(), input.len() + 1);
}

#[test]
fn test_space_delimited_file() {
    let input = ConfigDocument::from_text(
        "sshd_config",
        "#PermitRootLogin prohibit-password\nPasswordAuthentication no\n",
    );
    let out = patch(
        &input,
        &[
            PatchDirective::new("PermitRootLogin", "yes").literal(" "),
            PatchDirective::new("PasswordAuthentication", "yes").literal(" "),
        ],
    );
    assert_eq!(
        out.lines(),
        ["PermitRootLogin yes\n", "PasswordAuthentication yes\n"]
    );
}

#[test]
fn test_nova_conf_sections_are_passed_through() {
    let input = ConfigDocument::from_text(
        "nova.conf",
        "[DEFAULT]\n#vncserver_listen = 127.0.0.1\n\n[libvirt]\nlive_migration_uri = qemu+ssh://%s/system\n",
    );
    let out = patch(
        &input,
        &[
            PatchDirective::new("vncserver_listen", "0.0.0.0"),
            PatchDirective::new("live_migration_uri", "qemu+tcp://%s/system"),
        ],
    );
    assert_eq!(
        out.to_text(),
        "[DEFAULT]\nvncserver_listen = 0.0.0.0\n\n[libvirt]\nlive_migration_uri = qemu+tcp://%s/system\n"
    );
}

#[test]
fn test_strip_delimiter() {
    let input = doc(&["key   =   old\n"]);
    let out = patch(
        &input,
        &[PatchDirective::new("key", "new").delimiter(Delimiter::Strip)],
    );
    assert_eq!(out.lines(), ["key=new\n"]);
}

#[test]
fn test_indented_entry_loses_indent() {
    let input = doc(&["    listen_addr = 127.0.0.1\n"]);
    let out = patch(&input, &[PatchDirective::new("listen_addr", "0.0.0.0")]);
    assert_eq!(out.lines(), ["listen_addr = 0.0.0.0\n"]);
}

#[test]
fn test_prefix_of_token_does_not_match() {
    let input = doc(&["listen_tcp_port = 16509\n", "listen_tcp = 0\n"]);
    let out = patch(&input, &[PatchDirective::new("listen_tcp", "1")]);
    assert_eq!(out.lines(), ["listen_tcp_port = 16509\n", "listen_tcp = 1\n"]);
}

// ============================================================================
// Duplicates
// ============================================================================

#[test]
fn test_commented_duplicates_after_match_are_dropped() {
    let input = doc(&["foo = 1\n", "# foo = 2\n", "bar = 3\n", "#foo=4\n"]);
    let (out, report) = ConfigPatcher::new()
        .apply(&input, &[PatchDirective::new("foo", "9")])
        .unwrap();

    assert_eq!(out.lines(), ["foo = 9\n", "bar = 3\n"]);
    assert_eq!(report.dropped.len(), 2);
    assert_eq!(report.dropped[0].0, 2);
    assert_eq!(report.dropped[1].0, 4);
}

#[test]
fn test_active_duplicates_are_kept() {
    let input = doc(&["# foo = 1\n", "foo = 2\n"]);
    let (out, report) = ConfigPatcher::new()
        .apply(&input, &[PatchDirective::new("foo", "9")])
        .unwrap();

    assert_eq!(out.lines(), ["foo = 9\n", "foo = 2\n"]);
    assert_eq!(report.duplicates, vec![(2, "foo = 2\n".to_string())]);
}

#[test]
fn test_duplicate_directive_tokens_rejected() {
    let input = doc(&["foo = 1\n"]);
    let err = ConfigPatcher::new()
        .apply(
            &input,
            &[PatchDirective::new("foo", "1"), PatchDirective::new("foo", "2")],
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

// ============================================================================
// Idempotency
// ============================================================================

#[test]
fn test_other_directives_do_not_change_how_a_line_matches() {
    let input = doc(&["foo => 1\n", "bar => 2\n", "#baz: 3\n"]);
    let alone = patch(&input, &[PatchDirective::new("foo", "9")]);
    let together = patch(
        &input,
        &[
            PatchDirective::new("foo", "9"),
            PatchDirective::new("bar", "8").literal("=>"),
            PatchDirective::new("baz", "7").literal("=>"),
        ],
    );

    assert_eq!(alone.lines()[0], together.lines()[0]);
    assert_eq!(together.lines()[1], "bar => 8\n");
    assert_eq!(together.lines()[2], "baz=>7\n");

    // Order of the set does not matter either
    let reversed = patch(
        &input,
        &[
            PatchDirective::new("baz", "7").literal("=>"),
            PatchDirective::new("bar", "8").literal("=>"),
            PatchDirective::new("foo", "9"),
        ],
    );
    assert_eq!(reversed.to_text(), together.to_text());
}

#[test]
fn test_second_application_changes_nothing() {
    let input = ConfigDocument::from_text("libvirtd.conf", LIBVIRTD_CONF);
    let directives = [
        PatchDirective::new("listen_tls", "0"),
        PatchDirective::new("listen_tcp", "1"),
        PatchDirective::new("auth_tcp", "\"none\"").not_found(NotFoundPolicy::Fail),
        PatchDirective::new("keepalive_interval", "-1").not_found(NotFoundPolicy::Append),
    ];

    let patcher = ConfigPatcher::new();
    let (once, first) = patcher.apply(&input, &directives).unwrap();
    let (twice, second) = patcher.apply(&once, &directives).unwrap();

    assert!(first.changed);
    assert!(!second.changed);
    assert!(second.appended.is_empty());
    assert_eq!(once.to_text(), twice.to_text());
    assert!(once.unified_diff(&twice).is_empty());
}

#[test]
fn test_unified_diff_shows_rewrite() {
    let input = doc(&["foo = 1\n", "bar = 2\n"]);
    let out = patch(&input, &[PatchDirective::new("foo", "9")]);
    let diff = input.unified_diff(&out);
    assert!(diff.contains("-foo = 1"));
    assert!(diff.contains("+foo = 9"));
}
