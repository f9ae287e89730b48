//! Agent processes: one competitor program per agent, spoken to line by line over stdio.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufRead, BufReader, Read, Write},
    path::PathBuf,
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::Sender,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::engine::EngineEvent;
use crate::error::MatchError;
use crate::resolver::ResolvedCommand;

/// Index of an agent inside its match.
pub type AgentId = usize;

/// Lifecycle of one agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    /// The process is alive and scheduled.
    Running,
    /// The process is suspended (`SIGSTOP`).
    Stopped,
    /// The process was killed or exited. Final.
    Terminated,
}

/// An agent as declared when building a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentSpec {
    /// Display name.
    pub name: String,
    /// Path to the agent source or executable.
    pub source: PathBuf,
}

impl AgentSpec {
    /// Declares an agent, named after the file stem of its source.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        Self { name, source }
    }

    /// Overrides the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Where an agent's stderr goes.
#[derive(Debug, Clone, Default)]
pub enum StderrSink {
    /// Drained and dropped.
    #[default]
    Discard,
    /// Forwarded to `tracing` at warn level.
    Log,
    /// Appended to a log file.
    File(PathBuf),
}

/// Reassembles lines out of raw stdout chunks.
///
/// A chunk that does not end with a newline is held until a later chunk completes the line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends a chunk and returns every line it completed, without the line terminator.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = vec![];
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Returns the unterminated tail, if any. Used once the stream is closed.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Per-round move timer. The clock does not run while the agent is suspended.
#[derive(Debug, Default, Clone)]
pub(crate) struct MoveTimer {
    remaining: Option<Duration>,
    started: Option<Instant>,
}

impl MoveTimer {
    pub(crate) fn arm(&mut self, budget: Duration) {
        self.remaining = Some(budget);
        self.started = Some(Instant::now());
    }

    pub(crate) fn disarm(&mut self) {
        self.remaining = None;
        self.started = None;
    }

    pub(crate) fn pause(&mut self) {
        if let (Some(remaining), Some(started)) = (self.remaining, self.started.take()) {
            self.remaining = Some(remaining.saturating_sub(started.elapsed()));
        }
    }

    pub(crate) fn resume(&mut self) {
        if self.remaining.is_some() && self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// `None` when disarmed or paused.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        Some(self.started? + self.remaining?)
    }
}

/// One competitor process inside a match.
///
/// Stdout is read on a dedicated thread and forwarded line by line to the owning engine;
/// the engine keeps the per-round bookkeeping (`move_lines`, `move_complete`) on this struct.
#[derive(Debug)]
pub struct AgentProcess {
    id: AgentId,
    name: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    status: AgentStatus,
    pub(crate) move_lines: Vec<String>,
    pub(crate) move_complete: bool,
    /// Lines received after the move completed, replayed next round.
    pub(crate) held_lines: VecDeque<String>,
    pub(crate) timer: MoveTimer,
}

impl AgentProcess {
    /// Starts the process and wires its stdio to `events`.
    pub(crate) fn spawn(
        id: AgentId,
        name: String,
        command: &ResolvedCommand,
        stderr: StderrSink,
        events: Sender<EngineEvent>,
    ) -> Result<Self, MatchError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        // own process group, so signals reach whatever the agent starts
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| MatchError::AgentSetup {
            name: name.clone(),
            reason: format!("could not start '{}': {e}", command.program),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let pid = child.id();
        debug!(agent = id, %name, pid, "spawned agent");

        if let Some(stdout) = stdout {
            spawn_stdout_reader(id, stdout, events);
        }
        if let Some(err) = child_stderr {
            spawn_stderr_drain(id, name.clone(), err, stderr);
        }

        Ok(Self {
            id,
            name,
            child: Some(child),
            stdin,
            pid: Some(pid),
            status: AgentStatus::Running,
            move_lines: vec![],
            move_complete: false,
            held_lines: VecDeque::new(),
            timer: MoveTimer::default(),
        })
    }

    /// An agent without a process, for protocol tests.
    #[cfg(test)]
    pub(crate) fn detached(id: AgentId, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            child: None,
            stdin: None,
            pid: None,
            status: AgentStatus::Running,
            move_lines: vec![],
            move_complete: false,
            held_lines: VecDeque::new(),
            timer: MoveTimer::default(),
        }
    }

    /// Agent index inside the match.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// OS process id, while the process exists.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once the agent was killed or its process exited.
    pub fn is_terminated(&self) -> bool {
        self.status == AgentStatus::Terminated
    }

    /// Lines received so far for the current move.
    pub fn move_lines(&self) -> &[String] {
        &self.move_lines
    }

    /// Writes one line to the agent's stdin.
    pub fn send(&mut self, message: &str) -> Result<(), MatchError> {
        if self.is_terminated() {
            return Err(MatchError::AgentTerminated { agent: self.id });
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(MatchError::AgentTerminated { agent: self.id });
        };
        let io_err = |source| MatchError::AgentIo {
            agent: self.id,
            source,
        };
        stdin.write_all(message.as_bytes()).map_err(io_err)?;
        if !message.ends_with('\n') {
            stdin.write_all(b"\n").map_err(io_err)?;
        }
        stdin.flush().map_err(io_err)
    }

    /// Suspends the process. No-op unless running.
    pub fn pause(&mut self) -> Result<(), MatchError> {
        if self.status != AgentStatus::Running {
            return Ok(());
        }
        self.signal_stop(true)?;
        self.timer.pause();
        self.status = AgentStatus::Stopped;
        Ok(())
    }

    /// Continues a suspended process. No-op unless stopped.
    pub fn resume(&mut self) -> Result<(), MatchError> {
        if self.status != AgentStatus::Stopped {
            return Ok(());
        }
        self.signal_stop(false)?;
        self.timer.resume();
        self.status = AgentStatus::Running;
        Ok(())
    }

    /// Kills the process and reaps it. Irrevocable; later output from this agent is ignored.
    pub fn terminate(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.status = AgentStatus::Terminated;
        self.timer.disarm();
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            // a stopped process still dies on SIGKILL
            if let Err(e) = kill_group(&mut child) {
                trace!(agent = self.id, "kill: {e}");
            }
            if let Err(e) = child.wait() {
                warn!(agent = self.id, "could not reap agent process: {e}");
            }
        }
        self.pid = None;
        debug!(agent = self.id, name = %self.name, "agent terminated");
    }

    /// Marks the agent as terminated after its stdout closed.
    pub(crate) fn on_stream_closed(&mut self) {
        if !self.is_terminated() {
            debug!(agent = self.id, name = %self.name, "agent closed its output");
            self.terminate();
        }
    }

    /// Clears the move bookkeeping for a new round.
    pub(crate) fn reset_move(&mut self) {
        self.move_lines.clear();
        self.move_complete = false;
        self.timer.disarm();
    }

    #[cfg(unix)]
    fn signal_stop(&self, stop: bool) -> Result<(), MatchError> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = if stop { Signal::SIGSTOP } else { Signal::SIGCONT };
        killpg(Pid::from_raw(pid as i32), signal).map_err(|e| MatchError::AgentIo {
            agent: self.id,
            source: io::Error::from(e),
        })
    }

    #[cfg(not(unix))]
    fn signal_stop(&self, stop: bool) -> Result<(), MatchError> {
        warn!(agent = self.id, stop, "process suspension is not supported on this platform");
        Ok(())
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = kill_group(&mut child);
            let _ = child.wait();
        }
    }
}

/// Kills the agent's whole process group, then the child itself in case the group is gone.
#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    match (group, child.kill()) {
        (Ok(()), _) | (_, Ok(())) => Ok(()),
        (Err(e), Err(_)) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn spawn_stdout_reader(id: AgentId, mut stdout: impl Read + Send + 'static, events: Sender<EngineEvent>) {
    std::thread::spawn(move || {
        let mut buffer = LineBuffer::default();
        let mut chunk = [0u8; 4096];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push_chunk(&chunk[..n]) {
                        if events.send(EngineEvent::Line { agent: id, line }).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(agent = id, "stdout read failed: {e}");
                    break;
                }
            }
        }
        if let Some(line) = buffer.flush() {
            let _ = events.send(EngineEvent::Line { agent: id, line });
        }
        let _ = events.send(EngineEvent::Closed { agent: id });
    });
}

fn spawn_stderr_drain(id: AgentId, name: String, stderr: impl Read + Send + 'static, sink: StderrSink) {
    std::thread::spawn(move || {
        let mut file = match &sink {
            StderrSink::File(path) => match File::options().create(true).append(true).open(path) {
                Ok(f) => Some(f),
                Err(e) => {
                    error!(agent = id, "could not open agent log file {}: {e}", path.display());
                    None
                }
            },
            _ => None,
        };
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            match (&sink, file.as_mut()) {
                (StderrSink::Log, _) => warn!(agent = id, %name, "stderr: {line}"),
                (StderrSink::File(_), Some(f)) => {
                    let _ = writeln!(f, "{line}");
                }
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_holds_partial_line() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push_chunk(b"R,").is_empty());
        assert_eq!(buffer.pending_len(), 2);
        assert_eq!(buffer.push_chunk(b"P\nD_FIN"), vec!["R,P".to_owned()]);
        assert_eq!(buffer.push_chunk(b"ISH\n"), vec!["D_FINISH".to_owned()]);
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn line_buffer_splits_many_lines_and_crlf() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push_chunk(b"a\r\nb\n\nc");
        assert_eq!(lines, vec!["a", "b", ""]);
        assert_eq!(buffer.flush().as_deref(), Some("c"));
    }

    #[test]
    fn timer_freezes_while_paused() {
        let mut timer = MoveTimer::default();
        assert!(timer.deadline().is_none());
        timer.arm(Duration::from_millis(200));
        let first = timer.deadline().unwrap();
        timer.pause();
        assert!(timer.deadline().is_none());
        std::thread::sleep(Duration::from_millis(30));
        timer.resume();
        let second = timer.deadline().unwrap();
        assert!(second > first);
        timer.disarm();
        assert!(timer.deadline().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn terminate_reaches_processes_started_by_the_agent() {
        let (tx, rx) = std::sync::mpsc::channel();
        let command = ResolvedCommand::new(
            "sh",
            vec!["-c".into(), "sleep 30 & echo started; wait".into()],
        );
        let mut agent =
            AgentProcess::spawn(0, "spawner".into(), &command, StderrSink::Discard, tx).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            first,
            EngineEvent::Line {
                agent: 0,
                line: "started".into()
            }
        );
        agent.terminate();
        assert!(agent.is_terminated());

        // stdout only closes once the background sleep is gone too
        let closed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(closed, EngineEvent::Closed { agent: 0 });
    }

    #[test]
    fn spec_name_defaults_to_file_stem() {
        let spec = AgentSpec::new("agents/rock.sh");
        assert_eq!(spec.name, "rock");
        assert_eq!(spec.with_name("r1").name, "r1");
    }
}
