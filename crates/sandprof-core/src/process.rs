//! Child process supervision
//!
//! Spawns one child in its own process group with the resource ceilings bound
//! to pre-exec, drains stdout/stderr on reader threads, and waits for exit or
//! the wall-clock deadline. On every path the whole process group is killed
//! while the leader is still an unreaped zombie, so the group id cannot be
//! recycled.
//!
//! A descendant can leave the group with `setsid`. To catch those the host
//! process marks itself a child subreaper, so orphans are reparented to it
//! instead of init, and after the group kill a sweep of `/proc` kills
//! everything whose parent chain leads back to the leader plus every adopted
//! orphan. Consequence: any child of the host process that was not spawned
//! through [`run`] and whose parent has died is treated as an escapee too.

use crate::error::ExecutionError;
use crate::ResourceLimits;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long reader threads get to hit EOF after the group has been killed.
/// A descendant that survived the sweep could hold the pipes open forever.
const READER_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8 * 1024;

/// Upper bound on the post-run sweep for escaped descendants
const SWEEP_LIMIT: Duration = Duration::from_secs(2);
const SWEEP_POLL: Duration = Duration::from_millis(5);

/// Group leaders spawned by [`run`] that have not been reaped yet. Orphans
/// adopted by this process that are not in here belong to some finished run.
static SPAWNED: Mutex<BTreeSet<i32>> = parking_lot::const_mutex(BTreeSet::new());
static SUBREAPER: Once = Once::new();

/// Supervision parameters for one child
#[derive(Debug, Clone, Copy)]
pub struct Supervision {
    pub limits: ResourceLimits,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_output_bytes: usize,
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    TimedOut,
}

/// Everything observed about a finished child
#[derive(Debug)]
pub struct Finished {
    pub termination: Termination,
    pub stdout: Captured,
    pub stderr: Captured,
    pub elapsed: Duration,
}

/// Bytes read from one output stream, capped at `max_output_bytes`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Spawn `command` under `supervision` and wait for it.
///
/// `stdin` is fed from a separate thread when given; otherwise the child
/// reads `/dev/null`. Spawn failures map to [`ExecutionError::Spawn`], any
/// later OS failure to [`ExecutionError::Unexpected`].
pub fn run(
    command: &mut Command,
    supervision: &Supervision,
    stdin: Option<Vec<u8>>,
) -> Result<Finished, ExecutionError> {
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    supervision.limits.bind(command);
    become_subreaper();

    let started = Instant::now();
    let (mut child, pid) = {
        // Registered under the lock so a concurrent sweep never sees the new
        // leader as an unclaimed orphan.
        let mut spawned = SPAWNED.lock();
        let child = command
            .spawn()
            .map_err(|e| ExecutionError::Spawn(format!("failed to launch {:?}: {e}", command.get_program())))?;
        let raw = i32::try_from(child.id())
            .map_err(|_| ExecutionError::Unexpected(format!("pid {} out of range", child.id())))?;
        spawned.insert(raw);
        (child, Pid::from_raw(raw))
    };
    tracing::debug!(pid = pid.as_raw(), "child spawned");

    let stdout = Reader::spawn(child.stdout.take(), supervision.max_output_bytes);
    let stderr = Reader::spawn(child.stderr.take(), supervision.max_output_bytes);
    let feeder = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => Some(thread::spawn(move || {
            // A child that exits without reading closes the pipe; that is fine.
            let _ = pipe.write_all(&bytes);
        })),
        _ => None,
    };

    let deadline = started + supervision.timeout;
    let waited = wait_until(pid, deadline, supervision.poll_interval);

    kill_group(pid);
    sweep_descendants(pid);
    let status = {
        let mut spawned = SPAWNED.lock();
        let status = child.wait();
        spawned.remove(&pid.as_raw());
        status
    }
    .map_err(|e| ExecutionError::Unexpected(format!("failed to reap child: {e}")))?;
    let elapsed = started.elapsed();

    if let Some(feeder) = feeder {
        let _ = feeder.join();
    }
    let stdout = stdout.finish(READER_GRACE);
    let stderr = stderr.finish(READER_GRACE);

    let termination = match waited? {
        Waited::Exited => Termination::Exited(status),
        Waited::DeadlinePassed => Termination::TimedOut,
    };

    tracing::debug!(
        pid = pid.as_raw(),
        ?termination,
        elapsed_ms = elapsed.as_millis(),
        stdout_bytes = stdout.bytes.len(),
        stderr_bytes = stderr.bytes.len(),
        "child finished"
    );

    Ok(Finished {
        termination,
        stdout,
        stderr,
        elapsed,
    })
}

/// Human-readable exit status, e.g. `exit code 1` or `signal SIGXCPU`
#[must_use]
pub fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    match status.signal() {
        Some(raw) => Signal::try_from(raw)
            .map_or_else(|_| format!("signal {raw}"), |sig| format!("signal {sig}")),
        None => status.to_string(),
    }
}

enum Waited {
    Exited,
    DeadlinePassed,
}

/// Poll for exit without reaping (`WNOWAIT`), so the caller can still kill
/// the group through the zombie leader.
fn wait_until(pid: Pid, deadline: Instant, poll: Duration) -> Result<Waited, ExecutionError> {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    loop {
        match waitid(Id::Pid(pid), flags) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => return Ok(Waited::Exited),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(ExecutionError::Unexpected(format!(
                    "failed to wait for child: {e}"
                )));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(pid = pid.as_raw(), "wall-clock deadline passed, killing process group");
            return Ok(Waited::DeadlinePassed);
        }
        thread::sleep(poll.min(deadline - now));
    }
}

fn kill_group(pid: Pid) {
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pid.as_raw(), error = %e, "failed to kill process group"),
    }
}

fn become_subreaper() {
    SUBREAPER.call_once(|| {
        if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
            tracing::warn!(error = %e, "cannot become a child subreaper, setsid descendants may outlive their run");
        }
    });
}

/// One row of `/proc/<pid>/stat`
#[derive(Debug, Clone, Copy)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    pgrp: i32,
}

fn proc_table() -> Vec<ProcEntry> {
    let Ok(dir) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    dir.filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(read_stat)
        .collect()
}

fn read_stat(pid: i32) -> Option<ProcEntry> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(pid, &stat)
}

/// `comm` may contain spaces and parentheses, so fields are taken after the
/// last `)`: state, ppid, pgrp.
fn parse_stat(pid: i32, stat: &str) -> Option<ProcEntry> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(1);
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcEntry { pid, ppid, pgrp })
}

fn descends_from(mut pid: i32, root: i32, parents: &HashMap<i32, i32>) -> bool {
    // Bounded walk; the table is a snapshot and may hold a stale cycle.
    for _ in 0..64 {
        match parents.get(&pid) {
            Some(&parent) if parent == root => return true,
            Some(&parent) if parent > 1 => pid = parent,
            _ => return false,
        }
    }
    false
}

/// Kill whatever is left of the run led by `leader`: stray group members,
/// processes whose parent chain reaches the leader, and orphans reparented
/// to this process. Adopted orphans are reaped here. Runs until a pass finds
/// nothing or [`SWEEP_LIMIT`] passes.
fn sweep_descendants(leader: Pid) {
    let Ok(me) = i32::try_from(std::process::id()) else {
        return;
    };
    let root = leader.as_raw();
    let started = Instant::now();
    loop {
        let table = proc_table();
        let parents: HashMap<i32, i32> = table.iter().map(|p| (p.pid, p.ppid)).collect();
        let mut strays = Vec::new();
        let mut adopted = Vec::new();
        {
            let spawned = SPAWNED.lock();
            for entry in &table {
                if entry.pid == root || spawned.contains(&entry.pid) {
                    continue;
                }
                if entry.ppid == me {
                    adopted.push(entry.pid);
                } else if entry.pgrp == root || descends_from(entry.pid, root, &parents) {
                    strays.push(entry.pid);
                }
            }
        }
        if strays.is_empty() && adopted.is_empty() {
            return;
        }

        for &pid in strays.iter().chain(&adopted) {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pid, error = %e, "failed to kill escaped descendant"),
            }
        }
        for &pid in &adopted {
            // Not dead yet means it shows up again next pass.
            let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
        }

        if started.elapsed() >= SWEEP_LIMIT {
            tracing::warn!(
                leader = root,
                remaining = strays.len() + adopted.len(),
                "descendants still present after sweep"
            );
            return;
        }
        tracing::debug!(leader = root, strays = strays.len(), adopted = adopted.len(), "killed escaped descendants");
        thread::sleep(SWEEP_POLL);
    }
}

/// Drains one pipe into a shared, capped buffer
struct Reader {
    buffer: Arc<Mutex<Captured>>,
    handle: Option<JoinHandle<()>>,
}

impl Reader {
    fn spawn<R: Read + Send + 'static>(source: Option<R>, limit: usize) -> Self {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let handle = source.map(|mut source| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    let n = match source.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    };
                    let mut captured = buffer.lock();
                    let room = limit.saturating_sub(captured.bytes.len());
                    if n > room {
                        captured.truncated = true;
                    }
                    captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
                }
            })
        });
        Self { buffer, handle }
    }

    /// Wait up to `grace` for EOF, then take whatever was read.
    fn finish(self, grace: Duration) -> Captured {
        if let Some(handle) = self.handle {
            let until = Instant::now() + grace;
            while !handle.is_finished() && Instant::now() < until {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("output pipe still open after process group was killed");
            }
        }
        std::mem::take(&mut *self.buffer.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervision(timeout: Duration) -> Supervision {
        Supervision {
            limits: ResourceLimits::new(timeout.as_secs() + 2, 512 * 1024 * 1024),
            timeout,
            poll_interval: Duration::from_millis(5),
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("echo out; echo err >&2; exit 3");
        let finished = run(&mut command, &supervision(Duration::from_secs(5)), None).unwrap();

        let Termination::Exited(status) = finished.termination else {
            panic!("expected exit, got {:?}", finished.termination);
        };
        assert_eq!(status.code(), Some(3));
        assert_eq!(describe_status(status), "exit code 3");
        assert_eq!(finished.stdout.text(), "out\n");
        assert_eq!(finished.stderr.text(), "err\n");
    }

    #[test]
    fn deadline_kills_the_child() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("sleep 30");
        let started = Instant::now();
        let finished = run(&mut command, &supervision(Duration::from_millis(300)), None).unwrap();

        assert_eq!(finished.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn output_is_capped_but_drained() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("head -c 100000 /dev/zero; echo done >&2");
        let finished = run(&mut command, &supervision(Duration::from_secs(5)), None).unwrap();

        assert_eq!(finished.stdout.bytes.len(), 1024);
        assert!(finished.stdout.truncated);
        assert_eq!(finished.stderr.text(), "done\n");
    }

    #[test]
    fn stdin_is_fed_to_the_child() {
        let mut command = Command::new("/bin/cat");
        let finished = run(
            &mut command,
            &supervision(Duration::from_secs(5)),
            Some(b"piped input".to_vec()),
        )
        .unwrap();
        assert_eq!(finished.stdout.text(), "piped input");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut command = Command::new("/nonexistent/interpreter");
        let err = run(&mut command, &supervision(Duration::from_secs(1)), None).unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn(_)));
    }

    /// Gone, or a zombie nobody reaped yet
    fn is_dead(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| stat.rsplit_once(')').map(|(_, rest)| rest.trim_start().starts_with(['Z', 'X'])))
            .unwrap_or(true)
    }

    fn wait_dead(pid: i32) -> bool {
        let until = Instant::now() + Duration::from_secs(2);
        while Instant::now() < until {
            if is_dead(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        is_dead(pid)
    }

    fn printed_pid(finished: &Finished) -> i32 {
        finished.stdout.text().trim().parse().unwrap()
    }

    #[test]
    fn new_session_descendant_dies_with_exited_child() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("setsid sleep 60 </dev/null >/dev/null 2>&1 & echo $!");
        let finished = run(&mut command, &supervision(Duration::from_secs(5)), None).unwrap();

        assert!(matches!(finished.termination, Termination::Exited(_)));
        let pid = printed_pid(&finished);
        assert!(wait_dead(pid), "setsid descendant {pid} outlived the run");
    }

    #[test]
    fn new_session_descendant_dies_on_deadline() {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg("setsid sleep 60 </dev/null >/dev/null 2>&1 & echo $!; sleep 30");
        let started = Instant::now();
        let finished = run(&mut command, &supervision(Duration::from_millis(500)), None).unwrap();

        assert_eq!(finished.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        let pid = printed_pid(&finished);
        assert!(wait_dead(pid), "setsid descendant {pid} outlived the run");
    }

    #[test]
    fn new_session_descendant_holding_the_pipe_does_not_stall_readers() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("setsid sleep 60 & echo started");
        let started = Instant::now();
        let finished = run(&mut command, &supervision(Duration::from_secs(5)), None).unwrap();

        assert_eq!(finished.stdout.text(), "started\n");
        assert!(started.elapsed() < READER_GRACE + SWEEP_LIMIT);
    }

    #[test]
    fn cpu_ceiling_ends_with_sigxcpu() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("while :; do :; done");
        let limits = Supervision {
            limits: ResourceLimits::new(1, 512 * 1024 * 1024),
            ..supervision(Duration::from_secs(10))
        };
        let finished = run(&mut command, &limits, None).unwrap();

        let Termination::Exited(status) = finished.termination else {
            panic!("expected exit, got {:?}", finished.termination);
        };
        assert_eq!(describe_status(status), "signal SIGXCPU");
        assert!(finished.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn stat_fields_follow_the_last_paren() {
        let entry = parse_stat(42, "42 (a) b (c)) S 7 42 42 0 -1").unwrap();
        assert_eq!((entry.pid, entry.ppid, entry.pgrp), (42, 7, 42));
        assert!(parse_stat(1, "garbage").is_none());
    }

    #[test]
    fn ancestry_walk_stops_at_init() {
        let parents = HashMap::from([(10, 5), (5, 1), (20, 10)]);
        assert!(descends_from(20, 5, &parents));
        assert!(descends_from(10, 5, &parents));
        assert!(!descends_from(5, 10, &parents));
        assert!(!descends_from(99, 5, &parents));
    }

    #[test]
    fn signal_status_is_named() {
        let status = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(describe_status(status), "signal SIGKILL");
    }
}
