use super::*;

fn plain_output() {
    colored::control::set_override(false);
}

// ========================================================================
// Log line formatting
// ========================================================================

#[test]
fn plain_line_is_printed_verbatim() {
    plain_output();
    assert_eq!(format_log_line(&LogLine::plain("hello world")), "hello world");
}

#[test]
fn timestamped_line_gets_a_prefix() {
    plain_output();
    let line = LogLine {
        message: "map changed".into(),
        priority: Some(6),
        timestamp: Some(1_700_000_000_000_000),
    };
    let out = format_log_line(&line);
    assert!(out.ends_with(" | map changed"), "got {out:?}");
    assert_eq!(out.len(), "2023-11-14 22:13:20 | map changed".len());
}

#[test]
fn priority_colors() {
    assert_eq!(priority_color(Some(0)), Some(Color::Red));
    assert_eq!(priority_color(Some(3)), Some(Color::Red));
    assert_eq!(priority_color(Some(4)), Some(Color::Yellow));
    assert_eq!(priority_color(Some(6)), None);
    assert_eq!(priority_color(None), None);
}

// ========================================================================
// Stream state messages
// ========================================================================

#[test]
fn stream_state_messages_name_the_cause() {
    let connected = stream_state_message(&StreamState::Connected { service: "ttt".into() });
    assert!(connected.contains("ttt"));

    let down = stream_state_message(&StreamState::ServiceUnavailable { reason: "tail exited".into() });
    assert!(down.contains("tail exited"));

    assert!(stream_state_message(&StreamState::OverflowDisconnect).contains("resubscribe"));
    assert!(stream_state_message(&StreamState::Unauthorized).contains("authorized"));
}

// ========================================================================
// Tables
// ========================================================================

#[test]
fn service_rows_are_sorted_and_fill_blanks() {
    let services = vec![
        ServiceSummary {
            name: "ttt".into(),
            display_name: "Trouble in Terrorist Town".into(),
            description: String::new(),
        },
        ServiceSummary {
            name: "pug".into(),
            display_name: "PUG".into(),
            description: "5v5 pick-up games".into(),
        },
    ];
    let rows = service_rows(&services);
    assert_eq!(rows[0].name, "pug");
    assert_eq!(rows[1].name, "ttt");
    assert_eq!(rows[1].description, "-");
}

#[test]
fn hub_row_shows_dash_without_pid() {
    let row = hub_row(&HubStatusInfo {
        service: "pug".into(),
        state: "idle".into(),
        subscribers: 0,
        pid: None,
    });
    assert_eq!(row.pid, "-");

    let row = hub_row(&HubStatusInfo {
        service: "pug".into(),
        state: "streaming".into(),
        subscribers: 2,
        pid: Some(4242),
    });
    assert_eq!(row.pid, "4242");
    assert_eq!(row.subscribers, 2);
}

#[test]
fn format_millis_handles_out_of_range() {
    assert_eq!(format_millis(i64::MAX), "-");
    assert_eq!(format_millis(0).len(), "1970-01-01 00:00:00".len());
}

// ========================================================================
// Argument parsing
// ========================================================================

#[test]
fn token_is_required_for_authorized_commands() {
    let cli = Cli::try_parse_from(["warden", "services"]).unwrap();
    if cli.token.is_none() {
        assert!(matches!(cli.require_token(), Err(CliError::MissingToken)));
    }
}

#[test]
fn user_create_collects_repeated_roles() {
    let cli = Cli::try_parse_from([
        "warden", "user", "create", "--name", "alice", "--role", "administrator", "--role", "helper",
    ])
    .unwrap();
    match cli.command {
        Commands::User { command: UserCommands::Create { name, roles, .. } } => {
            assert_eq!(name.as_deref(), Some("alice"));
            assert_eq!(roles, vec!["administrator".to_string(), "helper".to_string()]);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_token_flag_after_subcommand() {
    let cli = Cli::try_parse_from(["warden", "logs", "ttt", "--token", "abc"]).unwrap();
    assert_eq!(cli.require_token().unwrap(), "abc");
    assert!(matches!(cli.command, Commands::Logs { ref service } if service == "ttt"));
}
