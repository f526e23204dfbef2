//! Child-process supervision with bounded-wait output polling.
//!
//! stdout/stderr are drained by one reader thread each and forwarded over a
//! channel, so the supervising loop can wait on output with a timeout and stay
//! responsive to cancellation and wall-clock limits.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::{
    io::Read,
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::error::{Result, StemError};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub enum ChildOutput {
    Data(OutputStream, Vec<u8>),
    Closed(OutputStream),
}

#[derive(Debug)]
pub struct MonitoredChild {
    child: Child,
    program: String,
    output: Receiver<ChildOutput>,
    open_streams: usize,
    _readers: Vec<JoinHandle<()>>,
}

impl MonitoredChild {
    pub fn spawn(mut command: Command) -> Result<Self> {
        let program = command.get_program().to_string_lossy().into_owned();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| StemError::ProcessSpawnFailed {
            program: program.clone(),
            source,
        })?;

        let (tx, rx) = unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, OutputStream::Stdout, tx.clone())?);
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, OutputStream::Stderr, tx)?);
        }

        Ok(Self {
            child,
            program,
            output: rx,
            open_streams: readers.len(),
            _readers: readers,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait up to `timeout` for the next piece of output.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<ChildOutput> {
        if self.open_streams == 0 {
            thread::sleep(timeout);
            return None;
        }
        match self.output.recv_timeout(timeout) {
            Ok(msg) => {
                if let ChildOutput::Closed(_) = msg {
                    self.open_streams = self.open_streams.saturating_sub(1);
                }
                Some(msg)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.open_streams = 0;
                None
            }
        }
    }

    /// Collect whatever output is still in flight after the process exited,
    /// stopping when both streams closed or `limit` elapsed.
    pub fn drain(&mut self, limit: Duration) -> Vec<ChildOutput> {
        let deadline = Instant::now() + limit;
        let mut out = Vec::new();
        while self.open_streams > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.recv_timeout(deadline - now) {
                Some(msg) => out.push(msg),
                None => break,
            }
        }
        out
    }

    /// Stop collecting output. The reader threads keep draining the pipes.
    pub fn discard_output(&mut self) {
        self.output = crossbeam_channel::never();
        self.open_streams = 0;
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Forcibly terminate and reap. Errors are ignored: the process may already be gone.
    pub fn kill(&mut self) {
        if self.is_running() {
            log::debug!("killing process {} ({})", self.child.id(), self.program);
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for MonitoredChild {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader<R>(mut pipe: R, stream: OutputStream, tx: Sender<ChildOutput>) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("proc-{stream:?}").to_lowercase())
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            let mut listening = true;
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Keep draining after the receiver is gone so the child never blocks on a full pipe.
                        if listening && tx.send(ChildOutput::Data(stream, buf[..n].to_vec())).is_err() {
                            listening = false;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::trace!("{stream:?} reader stopped: {e}");
                        break;
                    }
                }
            }
            let _ = tx.send(ChildOutput::Closed(stream));
        })?;
    Ok(handle)
}

/// Run `command` to completion, killing it if it outlives `timeout`.
/// Returns `None` when the limit was hit.
pub fn run_with_timeout(command: Command, timeout: Duration) -> Result<Option<ExitStatus>> {
    let mut child = MonitoredChild::spawn(command)?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            child.kill();
            return Ok(None);
        }
        // Output is not interesting here; just keep the pipes flowing.
        let _ = child.recv_timeout(Duration::from_millis(50));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut c = Command::new("/bin/sh");
        c.arg("-c").arg(script);
        c
    }

    #[test]
    fn collects_both_streams_until_closed() {
        let mut child = MonitoredChild::spawn(sh("echo out; echo err 1>&2")).unwrap();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for msg in child.drain(Duration::from_secs(5)) {
            match msg {
                ChildOutput::Data(OutputStream::Stdout, d) => stdout.extend(d),
                ChildOutput::Data(OutputStream::Stderr, d) => stderr.extend(d),
                ChildOutput::Closed(_) => {}
            }
        }
        assert_eq!(String::from_utf8_lossy(&stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&stderr), "err\n");
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = MonitoredChild::spawn(Command::new("/definitely/not/here")).err().unwrap();
        assert!(matches!(err, StemError::ProcessSpawnFailed { .. }));
    }

    #[test]
    fn timeout_kills_long_runner() {
        let started = Instant::now();
        let status = run_with_timeout(sh("exec sleep 30"), Duration::from_millis(200)).unwrap();
        assert!(status.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
