use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing counter for unique namespace prefixes.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if the environment can create network namespaces
/// (`ip` available and passwordless `sudo`, or already root).
pub fn check_privileges() -> bool {
    let has_ip = Command::new("ip")
        .arg("netns")
        .output()
        .is_ok_and(|o| o.status.success());

    // SAFETY: geteuid has no preconditions and cannot fail.
    let is_root = unsafe { libc::geteuid() } == 0;

    has_ip
        && (is_root
            || Command::new("sudo")
                .args(["-n", "ip", "netns", "list"])
                .output()
                .is_ok_and(|o| o.status.success()))
}

/// Short namespace prefix for substrate tests.
///
/// Leaves room for the `-<host>-eth<N>` suffix interface names get.
pub fn unique_prefix(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed) % 0x100;
    let pid = std::process::id() % 0x100;
    format!("{prefix}{pid:02x}{seq:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_fit_interface_limit() {
        let p = unique_prefix("t");
        assert_eq!(p.len(), 5);
        assert!(format!("{p}-A-eth9").len() <= 15);
    }
}
