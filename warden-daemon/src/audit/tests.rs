use super::*;

struct FailingSink;

impl AuditSink for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn write(&self, _entry: &AuditEntry) -> std::io::Result<()> {
        Err(std::io::Error::other("disk full"))
    }
}

#[test]
fn memory_sink_collects_entries() {
    let memory = Arc::new(MemoryAuditSink::new());
    let log = AuditLog::new().with_sink(memory.clone());

    log.record(AuditEntry::new(Some(UserId(1)), ACTION_RESTART, "pugA", AuditOutcome::Success));

    let entries = memory.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].actor, Some(UserId(1)));
    assert_eq!(entries[0].action, "restart");
    assert_eq!(entries[0].target, "pugA");
}

#[test]
fn failing_sink_does_not_block_others() {
    let memory = Arc::new(MemoryAuditSink::new());
    let log = AuditLog::new()
        .with_sink(Arc::new(FailingSink))
        .with_sink(memory.clone());

    log.record(AuditEntry::new(
        None,
        ACTION_RESTART,
        "pugA",
        AuditOutcome::Denied { reason: "invalid session".into() },
    ));

    assert_eq!(memory.len(), 1);
}

#[test]
fn jsonl_sink_appends_one_line_per_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("audit").join("audit.jsonl");

    {
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.write(&AuditEntry::new(Some(UserId(3)), ACTION_ROLE_ASSIGN, "user:4/helper", AuditOutcome::Success))
            .unwrap();
    }
    // Reopening appends rather than truncating
    {
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.write(&AuditEntry::new(
            Some(UserId(3)),
            ACTION_RESTART,
            "pugA",
            AuditOutcome::Failure { reason: "exit code 5".into() },
        ))
        .unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);

    let second: AuditEntry = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second.action, "restart");
    assert_eq!(second.outcome, AuditOutcome::Failure { reason: "exit code 5".into() });

    let raw: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(raw["outcome"]["status"], "success");
    assert_eq!(raw["actor"], 3);
}

#[test]
fn from_config_opens_jsonl_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("audit.jsonl");
    let log = AuditLog::from_config(&AuditConfig {
        path: Some(path.clone()),
        tracing: false,
    })
    .unwrap();

    log.record(AuditEntry::new(None, ACTION_RESTART, "pugB", AuditOutcome::Success));
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
}

#[test]
fn outcome_reason() {
    assert_eq!(AuditOutcome::Success.reason(), None);
    assert_eq!(AuditOutcome::Denied { reason: "no".into() }.reason(), Some("no"));
    assert_eq!(AuditOutcome::Failure { reason: "x".into() }.as_str(), "failure");
}
