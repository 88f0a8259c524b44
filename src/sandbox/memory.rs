//! Resident memory sampling for a process group.
//!
//! Sampling is racy: a process can spike and exit between two samples. The
//! limiter pairs it with an address-space rlimit backstop on Unix.

/// Live members of a process group and their summed resident set sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupUsage {
    pub members: usize,
    pub resident_bytes: u64,
}

/// Scan `/proc` for every process in `pgid`.
///
/// Returns `None` where `/proc` is unavailable.
#[cfg(target_os = "linux")]
pub fn group_usage(pgid: u32) -> Option<GroupUsage> {
    let page_size = page_size();
    let entries = std::fs::read_dir("/proc").ok()?;

    let mut usage = GroupUsage::default();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes vanish between listing and reading; skip them.
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some((group, rss_pages)) = parse_stat(&stat) {
            if group == pgid {
                usage.members += 1;
                usage.resident_bytes = usage
                    .resident_bytes
                    .saturating_add(rss_pages.saturating_mul(page_size));
            }
        }
    }
    Some(usage)
}

#[cfg(not(target_os = "linux"))]
pub fn group_usage(_pgid: u32) -> Option<GroupUsage> {
    None
}

/// Sum of resident set sizes, in bytes, of every live process in `pgid`.
pub fn group_resident_bytes(pgid: u32) -> Option<u64> {
    group_usage(pgid).map(|usage| usage.resident_bytes)
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(4096)
}

/// Extract `(pgrp, rss_pages)` from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(u32, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is state (field 3); pgrp is field 5, rss is field 24.
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_line() {
        let line = "4242 (a.out) R 1 4242 4242 0 -1 4194304 100 0 0 0 5 1 0 0 20 0 1 0 \
                    123456 10485760 2560 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3";
        assert_eq!(parse_stat(line), Some((4242, 2560)));
    }

    #[test]
    fn parses_stat_with_odd_command_name() {
        let line = "7 (we (ird) name) S 1 99 99 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 \
                    1 1 77 0";
        assert_eq!(parse_stat(line), Some((99, 77)));
    }

    #[test]
    fn rejects_truncated_stat() {
        assert_eq!(parse_stat("1 (x) S 0"), None);
        assert_eq!(parse_stat("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn samples_own_group() {
        let pgid = nix::unistd::getpgrp().as_raw().unsigned_abs();
        let bytes = group_resident_bytes(pgid).unwrap();
        assert!(bytes > 0);
        assert!(group_usage(pgid).unwrap().members >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reaped_child_leaves_no_group() {
        // The child stays in our group, so its pid never names a group.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(group_usage(pid).unwrap().members, 0);
    }
}
