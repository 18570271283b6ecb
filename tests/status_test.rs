mod common;

use common::{harness, row, with_cwd, write_telemetry, write_transcript};
use pi_statusd::snapshot::SummaryColor;
use pi_statusd::{ActivityState, SnapshotSource};
use serde_json::json;

#[tokio::test]
async fn test_mixed_telemetry_and_transcript_is_yellow() {
    let h = harness(vec![
        with_cwd(row(100, 1, "pi", "pi", "ttys001"), "/w/a"),
        with_cwd(row(200, 1, "pi", "pi", "ttys002"), "/w/b"),
        with_cwd(row(300, 1, "pi", "pi", "ttys003"), "/w/c"),
    ]);
    write_telemetry(&h.config, 100, "working");
    write_telemetry(&h.config, 200, "working");
    write_transcript(&h.config, "/w/c", &[json!({"type": "title", "title": "pi - c"})]);

    let snapshot = h.monitor.refresh().await.unwrap().snapshot.clone();
    assert!(snapshot.ok);
    assert_eq!(snapshot.source, SnapshotSource::Telemetry);
    assert_eq!(snapshot.summary.color, SummaryColor::Yellow);
    assert_eq!(snapshot.summary.total, 3);
    assert_eq!(snapshot.summary.running, 2);
    assert_eq!(snapshot.summary.waiting_input, 1);
    // 等待输入的代理排在最前
    assert_eq!(snapshot.agents[0].pid, 300);
    assert_eq!(snapshot.agents[0].activity, ActivityState::WaitingInput);
}

#[tokio::test]
async fn test_summary_counts_match_rows() {
    let h = harness(vec![
        row(10, 1, "pi", "pi", "ttys001"),
        row(11, 1, "pi", "pi", "ttys002"),
        row(12, 1, "bash", "bash", "ttys003"),
    ]);
    write_telemetry(&h.config, 11, "waiting_input");

    let snapshot = h.monitor.refresh().await.unwrap().snapshot.clone();
    let summary = &snapshot.summary;
    assert_eq!(summary.total, snapshot.agents.len());
    assert_eq!(summary.total, summary.running + summary.waiting_input + summary.unknown);
    assert_eq!(snapshot.agents.iter().map(|a| a.pid).collect::<Vec<_>>(), vec![11, 10]);
}

#[tokio::test]
async fn test_all_running_is_red_and_all_waiting_is_green() {
    let h = harness(vec![row(10, 1, "pi", "pi", "ttys001"), row(11, 1, "pi", "pi", "ttys002")]);
    write_telemetry(&h.config, 10, "running");
    write_telemetry(&h.config, 11, "running");
    let snapshot = h.monitor.refresh().await.unwrap().snapshot.clone();
    assert_eq!(snapshot.summary.color, SummaryColor::Red);

    write_telemetry(&h.config, 10, "waiting_input");
    write_telemetry(&h.config, 11, "waiting_input");
    let snapshot = h.monitor.refresh().await.unwrap().snapshot.clone();
    assert_eq!(snapshot.summary.color, SummaryColor::Green);
}

#[tokio::test]
async fn test_no_agents_is_gray() {
    let h = harness(vec![row(5, 1, "zsh", "-zsh", "ttys001")]);
    let snapshot = h.monitor.refresh().await.unwrap().snapshot.clone();
    assert!(snapshot.agents.is_empty());
    assert_eq!(snapshot.summary.color, SummaryColor::Gray);
    assert_eq!(snapshot.source, SnapshotSource::ProcessFallback);
}

#[tokio::test]
async fn test_telemetry_for_vanished_process_is_ignored() {
    let h = harness(vec![row(100, 1, "pi", "pi", "ttys001")]);
    write_telemetry(&h.config, 999, "running");

    let snapshot = h.monitor.refresh().await.unwrap().snapshot.clone();
    assert_eq!(snapshot.agents.len(), 1);
    assert!(snapshot.agent(999).is_none());
    assert_eq!(snapshot.source, SnapshotSource::ProcessFallback);
}

#[tokio::test]
async fn test_fingerprint_ignores_timestamp() {
    let h = harness(vec![row(100, 1, "pi", "pi", "ttys001")]);
    let first = h.monitor.refresh().await.unwrap().snapshot.fingerprint.clone();
    let second = h.monitor.refresh().await.unwrap().snapshot.fingerprint.clone();
    assert_eq!(first, second);

    h.source.replace(vec![row(100, 1, "pi", "pi", "ttys001"), row(101, 1, "pi", "pi", "ttys002")]);
    let third = h.monitor.refresh().await.unwrap().snapshot.fingerprint.clone();
    assert_ne!(first, third);
}

#[tokio::test]
async fn test_status_payload_keys() {
    let h = harness(vec![row(100, 1, "pi", "pi", "ttys001")]);
    let snapshot = h.monitor.refresh().await.unwrap().snapshot.clone();
    let value = serde_json::to_value(&snapshot).unwrap();

    for key in ["ok", "timestamp", "version", "source", "summary", "fingerprint", "agents"] {
        assert!(value.get(key).is_some(), "missing {}", key);
    }
    assert_eq!(value["source"], "process-fallback");
    let agent = &value["agents"][0];
    for key in ["pid", "activity", "cwd", "mux", "mux_session", "client_pid", "attached_window", "terminal_app"] {
        assert!(agent.get(key).is_some(), "missing agent key {}", key);
    }
    assert!(agent["mux"].is_null());
}
