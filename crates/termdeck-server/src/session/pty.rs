//! PTY process management using portable-pty.
//!
//! Spawns a shell attached to a pseudo-terminal and delivers its output as a
//! typed event stream: ordered `Data` chunks followed by exactly one `Exit`.
//! A single blocking pump task per process reads the master side and then
//! reaps the child, so chunk order is preserved end to end.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use termdeck_core::{DeckError, DeckResult};
use tracing::{debug, info};

/// Everything needed to start a PTY-backed shell.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Events produced by a running PTY process.
#[derive(Debug)]
pub enum PtyEvent {
    /// An output chunk, in production order. Chunk boundaries carry no
    /// meaning; reads may split or merge writes.
    Data(Vec<u8>),
    /// The process exited. Delivered exactly once, after the last chunk.
    Exit { code: Option<i32> },
}

/// A managed PTY instance.
pub struct PtyHandle {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Master side, kept for resize (Mutex because MasterPty is not Sync).
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Arc<Mutex<Box<dyn ChildKiller + Send + Sync>>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn a shell on a fresh PTY. Returns the handle plus the event
    /// receiver carrying output chunks and the final exit notification.
    ///
    /// Spawn failures (missing binary, permissions) surface synchronously as
    /// [`DeckError::Spawn`]; no process is left behind.
    pub fn spawn(spec: &SpawnSpec) -> DeckResult<(Self, tokio::sync::mpsc::Receiver<PtyEvent>)> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| DeckError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        for arg in &spec.args {
            cmd.arg(arg);
        }
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DeckError::Spawn(format!("failed to spawn {}: {e}", spec.shell)))?;

        // Drop the slave side so the reader sees EOF when the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        info!(shell = %spec.shell, pid, cols = spec.cols, rows = spec.rows, "PTY spawned");

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DeckError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DeckError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let (tx, rx) = tokio::sync::mpsc::channel::<PtyEvent>(64);

        // Blocking pump: read until EOF, then reap the child. Runs on the
        // blocking pool for the lifetime of the process.
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                            // Consumer gone; stop reading and fall through
                            // to reap the child.
                            break;
                        }
                    }
                }
            }
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    debug!(error = %e, "PTY child wait failed");
                    None
                }
            };
            let _ = tx.blocking_send(PtyEvent::Exit { code });
        });

        Ok((
            Self {
                writer: Arc::new(Mutex::new(writer)),
                master: Arc::new(Mutex::new(pair.master)),
                killer: Arc::new(Mutex::new(killer)),
                pid,
            },
            rx,
        ))
    }

    /// Feed bytes to the PTY input side. Writing to a dead process returns
    /// an error the caller is expected to tolerate.
    pub fn write(&self, data: &[u8]) -> DeckResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| DeckError::Other("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Update the PTY window size; affects subsequent output wrapping.
    pub fn resize(&self, cols: u16, rows: u16) -> DeckResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| DeckError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| DeckError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Request termination. The exit event arrives through the event
    /// receiver eventually; this call does not wait for it.
    pub fn kill(&self) -> DeckResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| DeckError::Other("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| DeckError::Other(format!("kill failed: {e}")))?;
        Ok(())
    }

    /// OS process id of the shell, when the platform exposes it.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Zero-signal liveness probe.
///
/// `EPERM` means the process exists but belongs to another user; that counts
/// as alive (conservative). Any other failure counts as dead so cleanup can
/// proceed safely.
pub fn is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(shell: &str, args: &[&str]) -> SpawnSpec {
        SpawnSpec {
            shell: shell.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    async fn collect_until_exit(
        mut rx: tokio::sync::mpsc::Receiver<PtyEvent>,
    ) -> (Vec<u8>, Option<i32>) {
        let mut output = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for PTY event")
                .expect("PTY event channel closed without exit");
            match event {
                PtyEvent::Data(chunk) => output.extend_from_slice(&chunk),
                PtyEvent::Exit { code } => return (output, code),
            }
        }
    }

    #[tokio::test]
    async fn spawn_produces_output_then_exit() {
        let (handle, rx) = PtyHandle::spawn(&spec("/bin/sh", &["-c", "echo marker-ok"])).unwrap();
        assert!(handle.pid().is_some());

        let (output, code) = collect_until_exit(rx).await;
        assert!(String::from_utf8_lossy(&output).contains("marker-ok"));
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn kill_delivers_exit_event() {
        let (handle, rx) = PtyHandle::spawn(&spec("/bin/sh", &["-c", "sleep 30"])).unwrap();
        handle.kill().unwrap();
        let (_, _code) = collect_until_exit(rx).await;
    }

    #[tokio::test]
    async fn write_feeds_the_shell() {
        let (handle, rx) = PtyHandle::spawn(&spec("/bin/sh", &[])).unwrap();
        handle.write(b"echo input-marker\nexit\n").unwrap();
        let (output, _) = collect_until_exit(rx).await;
        assert!(String::from_utf8_lossy(&output).contains("input-marker"));
    }

    #[test]
    fn spawn_failure_is_typed() {
        let Err(err) = PtyHandle::spawn(&spec("/definitely/not/a/shell", &[])) else {
            panic!("spawning a missing shell must fail");
        };
        assert!(matches!(err, DeckError::Spawn(_)));
    }

    #[test]
    fn liveness_probe() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(999_999_999));
    }
}
