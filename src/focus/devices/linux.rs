use super::ProcessLock;

/// Hold an idle/sleep inhibitor through systemd-logind for as long as the child runs
pub fn sleep_inhibitor() -> ProcessLock {
    ProcessLock::new(
        "sleep_lock",
        "systemd-inhibit",
        [
            "--what=idle:sleep",
            "--who=focus-guard",
            "--why=Focus session in progress",
            "--mode=block",
            "sleep",
            "infinity",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    )
}
