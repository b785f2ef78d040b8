//! Output multiplexer tests against real shell processes

mod common;

use common::{read, SCENARIO_TIMEOUT};
use suite_runner::runtime::output::{attach, HandleState, MuxOptions};
use suite_runner::runtime::process::{spawn_shell, CommandSpec, ControlMessage, ProcessEvent};
use suite_runner::runtime::sink::LogSink;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn options() -> MuxOptions {
    MuxOptions {
        record_exit_code: true,
        echo: false,
    }
}

/// Drain whatever events are queued, giving late senders a moment
async fn drain(rx: &mut mpsc::UnboundedReceiver<(String, ProcessEvent)>) -> Vec<ProcessEvent> {
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let mut events = Vec::new();
    while let Ok((_, event)) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn closed_count(events: &[ProcessEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ProcessEvent::Closed(_)))
        .count()
}

#[tokio::test]
async fn test_logs_split_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path().join("printer"));

    let command = r"printf 'one\n'; sleep 0.2; printf '\033[31mtwo\033[0m\n' >&2; sleep 0.2; printf '   \n'; sleep 0.2; printf '  three  \n'";
    let child = spawn_shell(&CommandSpec::new("printer", command)).unwrap();
    let handle = attach("printer", child, sink.clone(), options(), None);

    let close = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(close.code, Some(0));
    assert_eq!(close.error, None);
    assert_eq!(close.last_log.as_deref(), Some("three"));
    assert_eq!(close.tail, vec!["one", "two", "three"]);

    assert_eq!(read(sink.out_path()), "one\nthree\n");
    assert_eq!(read(sink.err_path()), "two\n");
    assert_eq!(read(sink.combined_path()), "one\ntwo\nthree\n");
    assert_eq!(read(sink.exit_code_path()), "0");
}

#[tokio::test]
async fn test_character_across_read_boundary_survives() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path().join("wide"));

    // 4095 bytes of padding put the two bytes of 'é' on either side of a read
    let command = r#"pad=$(printf '%4095s' '' | tr ' ' a); printf '%sé\n' "$pad""#;
    let child = spawn_shell(&CommandSpec::new("wide", command)).unwrap();
    let handle = attach("wide", child, sink.clone(), options(), None);

    let close = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(close.code, Some(0));

    let out = read(sink.out_path());
    assert!(out.contains('é'));
    assert!(!out.contains('\u{FFFD}'));
    assert_eq!(out.matches('a').count(), 4095);
    assert_eq!(read(sink.combined_path()), out);
}

#[tokio::test]
async fn test_process_closed_before_attach_keeps_code() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path().join("early"));

    let child = spawn_shell(&CommandSpec::new("early", "echo early; exit 7")).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let handle = attach("early", child, sink.clone(), options(), None);

    let close = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(close.code, Some(7));
    assert_eq!(close.last_log.as_deref(), Some("early"));
    assert_eq!(read(sink.out_path()), "early\n");
    assert_eq!(read(sink.exit_code_path()), "7");
}

#[tokio::test]
async fn test_whitespace_only_output_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path().join("blank"));

    let child = spawn_shell(&CommandSpec::new("blank", r"printf '  \n\t\n'; exit 3")).unwrap();
    let handle = attach("blank", child, sink.clone(), options(), None);

    let close = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(close.code, Some(3));
    assert_eq!(close.last_log, None);
    assert_eq!(read(sink.combined_path()), "");
    assert_eq!(read(sink.exit_code_path()), "3");
}

#[tokio::test]
async fn test_close_notification_fires_once() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let child = spawn_shell(&CommandSpec::new("short", "echo hi")).unwrap();
    let handle = attach("short", child, LogSink::new(dir.path().join("short")), options(), Some(tx));

    let first = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    let second = handle.clone().wait().await;
    assert_eq!(first, second);
    assert!(handle.is_closed());
    assert!(matches!(handle.state(), HandleState::Closed(_)));

    // Terminating a closed handle is a no-op
    assert!(!handle.terminate());
    assert!(!handle.terminate());

    let events = drain(&mut rx).await;
    assert_eq!(closed_count(&events), 1);
    assert!(matches!(events.first(), Some(ProcessEvent::Started { .. })));
}

#[tokio::test]
async fn test_terminate_kills_once() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = LogSink::new(dir.path().join("sleeper"));

    let child = spawn_shell(&CommandSpec::new("sleeper", "sleep 30")).unwrap();
    let handle = attach("sleeper", child, sink.clone(), options(), Some(tx));

    assert!(handle.terminate());
    assert!(!handle.terminate());
    assert!(handle.is_terminating());

    let close = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(close.code, None);
    assert_eq!(read(sink.exit_code_path()), "null");

    let events = drain(&mut rx).await;
    assert_eq!(closed_count(&events), 1);
}

#[tokio::test]
async fn test_io_error_kills_process_and_still_closes() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let child = spawn_shell(&CommandSpec::new("doomed", "echo start; sleep 30")).unwrap();
    let handle = attach("doomed", child, LogSink::new(blocker.join("doomed")), options(), Some(tx));

    let close = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    let error = close.error.unwrap();
    assert!(error.starts_with("Log capture failed for 'doomed'"), "{}", error);
    assert_eq!(close.code, None);

    let events = drain(&mut rx).await;
    assert!(events.iter().any(|e| matches!(e, ProcessEvent::Error { .. })));
    assert_eq!(closed_count(&events), 1);
}

#[tokio::test]
async fn test_control_message_reaches_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = CommandSpec::new("listener", r#"read line; echo "got $line""#);
    spec.control = true;

    let child = spawn_shell(&spec).unwrap();
    let handle = attach("listener", child, LogSink::new(dir.path().join("listener")), options(), None);
    assert!(handle.has_control());
    assert!(handle.send_control(ControlMessage::exit()).await.unwrap());

    let close = timeout(SCENARIO_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(close.code, Some(0));
    assert_eq!(close.last_log.as_deref(), Some(r#"got {"exit":true}"#));

    // Nothing to write to once closed
    assert!(!handle.send_control(ControlMessage::exit()).await.unwrap());
}
