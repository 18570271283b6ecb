mod common;

use common::{harness, row};
use pi_statusd::{JumpResult, ProtocolError, TerminalApp};

fn zellij_rows() -> Vec<pi_statusd::ProcessRow> {
    vec![
        row(1, 0, "launchd", "/sbin/launchd", "??"),
        row(10, 1, "ghostty", "/Applications/Ghostty.app/Contents/MacOS/ghostty", "??"),
        row(11, 10, "zsh", "-zsh", "ttys001"),
        row(12, 11, "zellij", "zellij attach agent-web", "ttys001"),
        row(20, 1, "zellij", "zellij --server /tmp/zellij-501/0.40/agent-web", "??"),
        row(21, 20, "zsh", "/bin/zsh", "ttys009"),
        row(22, 21, "pi", "pi", "ttys009"),
    ]
}

#[tokio::test]
async fn test_attached_client_stops_at_first_step() {
    let h = harness(zellij_rows());
    let reply = h.monitor.jump(22).await.unwrap();

    assert!(reply.ok);
    assert_eq!(reply.result, JumpResult::FocusedExisting);
    assert_eq!(reply.client_pid, Some(12));
    assert_eq!(reply.focused_app, Some(TerminalApp::Ghostty));
    assert!(!reply.opened_attach && !reply.opened_shell);
    assert_eq!(h.backend.calls(), vec!["focus_app Ghostty 10".to_string()]);
}

#[tokio::test]
async fn test_unattached_agent_opens_shell_in_cwd() {
    let h = harness(vec![row(40, 1, "pi", "pi", "??")]);
    let reply = h.monitor.jump(40).await.unwrap();

    assert_eq!(reply.result, JumpResult::OpenedShell);
    assert_eq!(reply.cwd.as_deref(), Some("/work/p40"));
    assert!(h.backend.calls().iter().any(|c| c == "open shell"));
}

#[tokio::test]
async fn test_jump_unknown_pid() {
    let h = harness(zellij_rows());
    assert_eq!(h.monitor.jump(4242).await.unwrap_err(), ProtocolError::PidNotFound(4242));
    assert!(h.backend.calls().is_empty());
}
