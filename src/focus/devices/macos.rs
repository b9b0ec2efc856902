use super::ProcessLock;

/// Keep the display and system awake with caffeinate.
///
/// `-w` ties the assertion to this process, so it also ends if we exit without releasing.
pub fn sleep_inhibitor() -> ProcessLock {
    ProcessLock::new(
        "sleep_lock",
        "caffeinate",
        vec![
            "-d".to_string(),
            "-i".to_string(),
            "-w".to_string(),
            std::process::id().to_string(),
        ],
    )
}
