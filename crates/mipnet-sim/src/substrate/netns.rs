//! Linux network-namespace substrate.
//!
//! One namespace per host, one veth pair per link with `tc netem` shaping
//! on both ends. Processes run via `ip netns exec`. Everything goes
//! through `sudo -n` unless the harness already runs as root.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};

use tracing::{debug, info, warn};

use super::{ExecRequest, HostContext, Pid, Substrate, SubstrateError};
use crate::topology::{HostId, LinkParams, LinkState};

/// Linux netdev names are limited to 15 bytes.
const IFNAMSIZ: usize = 15;

/// MTU used when sizing the netem queue.
const MTU_BYTES: u64 = 1500;

#[derive(Debug, Clone)]
pub struct NetnsConfig {
    /// Namespace names are `<prefix>-<host>`.
    pub prefix: String,
    /// Prefix commands with `sudo -n` when not running as root.
    pub sudo: bool,
    /// Optional terminal emulator wrapped around every spawned command.
    pub terminal: Option<String>,
    /// Where to write per-process stdout/stderr when no terminal is used.
    pub log_dir: Option<PathBuf>,
}

impl Default for NetnsConfig {
    fn default() -> Self {
        Self {
            prefix: "mip".into(),
            sudo: true,
            terminal: None,
            log_dir: None,
        }
    }
}

/// Runs privileged commands, with or without `sudo`.
#[derive(Debug, Clone, Copy)]
struct Runner {
    sudo: bool,
}

impl Runner {
    fn new(want_sudo: bool) -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let is_root = unsafe { libc::geteuid() } == 0;
        Self {
            sudo: want_sudo && !is_root,
        }
    }

    fn command(&self, program: &str) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", program]);
            cmd
        } else {
            Command::new(program)
        }
    }

    /// Run `program args`, returning raw output.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        debug!(sudo = self.sudo, program, args = ?args, "running");
        self.command(program).args(args).output()
    }

    /// Run `program args`, failing with stderr if it exits non-zero.
    fn run_checked(&self, op: &str, program: &str, args: &[&str]) -> Result<Output, SubstrateError> {
        let output = self
            .run(program, args)
            .map_err(|e| SubstrateError::io(op, e))?;
        if !output.status.success() {
            return Err(SubstrateError::rejected(
                op,
                format!(
                    "{program} {}: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(output)
    }
}

/// A network namespace, deleted on drop.
#[derive(Debug)]
struct Namespace {
    name: String,
    runner: Runner,
}

impl Namespace {
    fn new(name: &str, runner: Runner) -> Result<Self, SubstrateError> {
        // Stale namespace from an earlier run
        let _ = runner.run("ip", &["netns", "del", name]);

        runner.run_checked(&format!("create netns '{name}'"), "ip", &["netns", "add", name])?;
        debug!(ns = name, "created network namespace");

        // Loopback is best-effort
        let _ = runner.run("ip", &["netns", "exec", name, "ip", "link", "set", "lo", "up"]);

        Ok(Self {
            name: name.to_string(),
            runner,
        })
    }

    fn exec_checked(&self, op: &str, cmd: &str, args: &[&str]) -> Result<Output, SubstrateError> {
        let mut full = vec!["netns", "exec", self.name.as_str(), cmd];
        full.extend_from_slice(args);
        self.runner.run_checked(op, "ip", &full)
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        debug!(ns = self.name, "deleting network namespace");
        let _ = self.runner.run("ip", &["netns", "del", &self.name]);
    }
}

/// The two ends of a veth link, each with the host that owns it.
#[derive(Debug, Clone)]
struct VethPair {
    ends: [(HostId, String); 2],
}

pub struct NetnsSubstrate {
    config: NetnsConfig,
    runner: Runner,
    namespaces: HashMap<HostId, Namespace>,
    iface_counts: HashMap<HostId, usize>,
    links: HashMap<(HostId, HostId), VethPair>,
    children: HashMap<Pid, Child>,
    /// Children already waited on. Their pids may have been handed to
    /// unrelated processes since, so they are never signalled again.
    reaped: HashSet<Pid>,
}

impl NetnsSubstrate {
    pub fn new(config: NetnsConfig) -> Self {
        let runner = Runner::new(config.sudo);
        Self {
            config,
            runner,
            namespaces: HashMap::new(),
            iface_counts: HashMap::new(),
            links: HashMap::new(),
            children: HashMap::new(),
            reaped: HashSet::new(),
        }
    }

    fn namespace(&self, id: &HostId) -> Result<&Namespace, SubstrateError> {
        self.namespaces
            .get(id)
            .ok_or_else(|| SubstrateError::UnknownHost(id.clone()))
    }

    /// Next free `<ns>-eth<N>` name for `host`.
    fn next_iface(&mut self, host: &HostId) -> Result<String, SubstrateError> {
        let ns = self.namespace(host)?.name.clone();
        let n = self.iface_counts.entry(host.clone()).or_insert(0);
        let name = format!("{ns}-eth{n}");
        *n += 1;
        if name.len() > IFNAMSIZ {
            return Err(SubstrateError::rejected(
                format!("name interface for {host}"),
                format!("'{name}' exceeds {IFNAMSIZ} characters; use a shorter prefix"),
            ));
        }
        Ok(name)
    }

    fn exec_argv(&self, request: &ExecRequest) -> Vec<String> {
        match &self.config.terminal {
            Some(term) => {
                let mut argv = vec![term.clone(), "-title".into(), request.title.clone()];
                if let Some(placement) = &request.placement {
                    argv.push("-geometry".into());
                    argv.push(placement.geometry.clone());
                }
                argv.push("-e".into());
                argv.extend(request.argv.iter().cloned());
                argv
            }
            None => request.argv.clone(),
        }
    }

    fn output_for(&self, title: &str) -> io::Result<(Stdio, Stdio)> {
        if self.config.terminal.is_some() {
            return Ok((Stdio::null(), Stdio::null()));
        }
        match &self.config.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let file = File::create(dir.join(format!("{}.log", log_file_stem(title))))?;
                Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }

    /// Reap `pid` if it is our child and has exited.
    fn reap_if_exited(&mut self, pid: Pid) -> bool {
        let Some(child) = self.children.get_mut(&pid) else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "child exited");
                self.children.remove(&pid);
                self.reaped.insert(pid);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid, error = %e, "failed to poll child");
                false
            }
        }
    }

    /// SIGKILL `pids`, ignoring ones that are already gone.
    fn kill_pids(&self, pids: &[Pid]) -> Result<(), SubstrateError> {
        if pids.is_empty() {
            return Ok(());
        }
        if !self.runner.sudo {
            for &pid in pids {
                // SAFETY: plain kill(2) on a pid; ESRCH just means it is gone.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
                if rc != 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        return Err(SubstrateError::io(format!("kill {pid}"), err));
                    }
                }
            }
            return Ok(());
        }

        let pid_args: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
        let mut args = vec!["-KILL"];
        args.extend(pid_args.iter().map(String::as_str));
        let output = self
            .runner
            .run("kill", &args)
            .map_err(|e| SubstrateError::io("kill", e))?;
        // kill exits non-zero if any pid was already gone; a killed but
        // unreaped child shows up as a zombie
        if !output.status.success() && pids.iter().any(|&p| proc_running(p)) {
            return Err(SubstrateError::rejected(
                format!("kill {}", pid_args.join(" ")),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

impl Substrate for NetnsSubstrate {
    fn name(&self) -> &str {
        "netns"
    }

    fn create_host(&mut self, id: &HostId) -> Result<HostContext, SubstrateError> {
        let name = format!("{}-{}", self.config.prefix, id);
        let ns = Namespace::new(&name, self.runner)?;
        self.namespaces.insert(id.clone(), ns);
        Ok(HostContext(name))
    }

    fn create_link(
        &mut self,
        a: &HostId,
        b: &HostId,
        params: &LinkParams,
    ) -> Result<(), SubstrateError> {
        let a_iface = self.next_iface(a)?;
        let b_iface = self.next_iface(b)?;
        let op = format!("create link {a}-{b}");

        // Stale veth (idempotent)
        let _ = self.runner.run("ip", &["link", "del", &a_iface]);

        self.runner.run_checked(
            &op,
            "ip",
            &["link", "add", &a_iface, "type", "veth", "peer", "name", &b_iface],
        )?;
        debug!(a = %a_iface, b = %b_iface, "created veth pair");

        let netem = [netem_args(&a_iface, params), netem_args(&b_iface, params)];
        let ends = [(a, &a_iface), (b, &b_iface)];
        for ((host, iface), netem) in ends.into_iter().zip(&netem) {
            let ns = self.namespace(host)?;
            self.runner
                .run_checked(&op, "ip", &["link", "set", iface, "netns", &ns.name])?;
            ns.exec_checked(&op, "ip", &["link", "set", iface, "up"])?;

            let netem: Vec<&str> = netem.iter().map(String::as_str).collect();
            if let Err(err) = ns.exec_checked(&op, "tc", &netem) {
                // No sch_netem in this kernel; the link still works unshaped
                warn!(iface = %iface, error = %err, "netem shaping not applied");
            }
        }

        info!(
            a = %a,
            b = %b,
            bandwidth_mbit = params.bandwidth_mbit,
            delay_ms = params.delay.as_millis() as u64,
            loss = params.loss,
            "veth link configured"
        );
        self.links.insert(
            pair(a, b),
            VethPair {
                ends: [(a.clone(), a_iface), (b.clone(), b_iface)],
            },
        );
        Ok(())
    }

    fn set_link_state(
        &mut self,
        a: &HostId,
        b: &HostId,
        state: LinkState,
    ) -> Result<(), SubstrateError> {
        let op = format!("set link {a}-{b} {state}");
        let veth = self
            .links
            .get(&pair(a, b))
            .cloned()
            .ok_or_else(|| SubstrateError::rejected(&op, "no such veth pair"))?;

        let state = state.to_string();
        for (host, iface) in &veth.ends {
            let ns = self.namespace(host)?;
            ns.exec_checked(&op, "ip", &["link", "set", iface, &state])?;
        }
        Ok(())
    }

    fn exec(&mut self, host: &HostId, request: &ExecRequest) -> Result<Pid, SubstrateError> {
        let ns_name = self.namespace(host)?.name.clone();
        let op = format!("exec '{}' on {host}", request.title);
        let argv = self.exec_argv(request);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SubstrateError::rejected(&op, "empty command line"))?;
        let (stdout, stderr) = self
            .output_for(&request.title)
            .map_err(|e| SubstrateError::io(&op, e))?;

        let mut cmd = self.runner.command("ip");
        cmd.args(["netns", "exec", ns_name.as_str(), program.as_str()])
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        debug!(cmd = ?cmd, "spawning in namespace");
        let child = cmd.spawn().map_err(|e| SubstrateError::io(&op, e))?;
        let pid = child.id();
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn signal_kill(&mut self, pid: Pid) -> Result<(), SubstrateError> {
        if self.reaped.contains(&pid) || self.reap_if_exited(pid) {
            debug!(pid, "process already exited, not signalling");
            return Ok(());
        }

        // Descendants first: with sudo the direct child is sudo itself, and
        // SIGKILL is not relayed to the daemon it started.
        let mut victims = descendants(pid);
        victims.reverse();
        victims.push(pid);
        self.kill_pids(&victims)?;

        if let Some(mut child) = self.children.remove(&pid) {
            if let Err(e) = child.wait() {
                warn!(pid, error = %e, "failed to reap child");
            }
            self.reaped.insert(pid);
        }
        Ok(())
    }

    fn is_alive(&mut self, pid: Pid) -> bool {
        if self.reaped.contains(&pid) {
            return false;
        }
        if self.children.contains_key(&pid) {
            return !self.reap_if_exited(pid);
        }
        proc_running(pid)
    }
}

/// `tc qdisc replace dev <iface> root netem ...` arguments for `params`.
fn netem_args(iface: &str, params: &LinkParams) -> Vec<String> {
    let rate_kbit = (params.bandwidth_mbit * 1000.0).round().max(1.0) as u64;

    // Finite queue of ~2x the bandwidth-delay product, minimum 20 packets
    let rtt_us = params.delay.as_micros() as u64 * 2;
    let bdp_bytes = rate_kbit * 1000 / 8 * rtt_us / 1_000_000;
    let limit = std::cmp::max(bdp_bytes / MTU_BYTES * 2, 20);

    let mut args: Vec<String> = ["qdisc", "replace", "dev", iface, "root", "netem"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend([
        "limit".into(),
        limit.to_string(),
        "delay".into(),
        format!("{}us", params.delay.as_micros()),
    ]);
    if params.loss > 0.0 {
        args.push("loss".into());
        args.push(format!("{:.3}%", params.loss * 100.0));
    }
    args.push("rate".into());
    args.push(format!("{rate_kbit}kbit"));
    args
}

fn pair(a: &HostId, b: &HostId) -> (HostId, HostId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn log_file_stem(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Whether `pid` exists and is not a zombie.
fn proc_running(pid: Pid) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .as_deref()
        .and_then(process_state)
        .is_some_and(|state| !matches!(state, 'Z' | 'X'))
}

/// All transitive children of `root`, parents before children.
fn descendants(root: Pid) -> Vec<Pid> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<Pid>().ok()) else {
            continue;
        };
        if let Some(ppid) = fs::read_to_string(entry.path().join("stat"))
            .ok()
            .as_deref()
            .and_then(parent_pid)
        {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                out.push(kid);
                stack.push(kid);
            }
        }
    }
    out
}

/// Parent pid from a `/proc/<pid>/stat` line. The command name may contain
/// spaces and parentheses, so parse after the last `)`.
fn parent_pid(stat: &str) -> Option<Pid> {
    stat_fields(stat)?.nth(1)?.parse().ok()
}

/// State letter (`R`, `S`, `Z`, ...) from a `/proc/<pid>/stat` line.
fn process_state(stat: &str) -> Option<char> {
    stat_fields(stat)?.next()?.chars().next()
}

fn stat_fields(stat: &str) -> Option<std::str::SplitWhitespace<'_>> {
    Some(stat[stat.rfind(')')? + 1..].split_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::Placement;
    use crate::test_util::{check_privileges, unique_prefix};
    use std::time::Duration;

    #[test]
    fn parent_pid_handles_odd_command_names() {
        let stat = "4242 (mip daemon (x)) S 17 4242 4242 0 -1 4194560";
        assert_eq!(parent_pid(stat), Some(17));
        assert_eq!(parent_pid("garbage"), None);
    }

    #[test]
    fn process_state_reads_past_the_command_name() {
        assert_eq!(process_state("99 (odd) name) Z 1 99 99"), Some('Z'));
        assert_eq!(process_state("7 (sleep) S 1 7 7"), Some('S'));
        assert_eq!(process_state("7 (sleep)"), None);
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..250 {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn unreaped_child_is_not_running() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        assert!(wait_until(|| {
            fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .as_deref()
                .and_then(process_state)
                == Some('Z')
        }));
        assert!(!proc_running(pid));
        child.wait().unwrap();
    }

    #[test]
    fn exited_child_is_reaped_once_and_never_signalled() {
        let mut substrate = NetnsSubstrate::new(NetnsConfig {
            sudo: false,
            ..Default::default()
        });
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        substrate.children.insert(pid, child);

        assert!(wait_until(|| !substrate.is_alive(pid)));
        assert!(!substrate.children.contains_key(&pid));
        assert!(substrate.reaped.contains(&pid));

        substrate.signal_kill(pid).unwrap();
        substrate.signal_kill(pid).unwrap();
        assert!(!substrate.is_alive(pid));
    }

    #[test]
    fn netem_args_cover_delay_loss_and_rate() {
        let params = LinkParams {
            bandwidth_mbit: 10.0,
            delay: Duration::from_millis(10),
            loss: 0.02,
        };
        let args = netem_args("mip-A-eth0", &params).join(" ");
        assert_eq!(
            args,
            "qdisc replace dev mip-A-eth0 root netem limit 32 delay 10000us loss 2.000% rate 10000kbit"
        );

        let lossless = netem_args("x", &LinkParams::default()).join(" ");
        assert!(!lossless.contains("loss"));
    }

    #[test]
    fn terminal_wrapping_carries_title_and_geometry() {
        let substrate = NetnsSubstrate::new(NetnsConfig {
            terminal: Some("xterm".into()),
            ..Default::default()
        });
        let argv = substrate.exec_argv(&ExecRequest {
            argv: vec!["./ping_server".into(), "usockB".into()],
            title: "Server [B]".into(),
            placement: Some(Placement {
                geometry: "80x20+550+300".into(),
            }),
        });
        assert_eq!(
            argv,
            [
                "xterm",
                "-title",
                "Server [B]",
                "-geometry",
                "80x20+550+300",
                "-e",
                "./ping_server",
                "usockB"
            ]
        );
    }

    #[test]
    fn namespace_link_toggle_and_kill() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let prefix = unique_prefix("t");
        let mut substrate = NetnsSubstrate::new(NetnsConfig {
            prefix,
            ..Default::default()
        });
        let (a, b) = (HostId::from("A"), HostId::from("B"));
        substrate.create_host(&a).expect("create A");
        substrate.create_host(&b).expect("create B");
        substrate
            .create_link(&a, &b, &LinkParams::default())
            .expect("create link");

        substrate
            .set_link_state(&b, &a, LinkState::Down)
            .expect("link down");
        substrate
            .set_link_state(&a, &b, LinkState::Up)
            .expect("link up");

        let pid = substrate
            .exec(
                &a,
                &ExecRequest {
                    argv: vec!["sleep".into(), "30".into()],
                    title: "sleeper".into(),
                    placement: None,
                },
            )
            .expect("exec");
        assert!(substrate.is_alive(pid));
        substrate.signal_kill(pid).expect("kill");
        assert!(!substrate.is_alive(pid));
        substrate.signal_kill(pid).expect("second kill is a no-op");
    }
}
