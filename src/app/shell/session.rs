use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::shell::framer::{frame_command, new_sentinel, FramedReply};
use crate::app::shell::launcher::ShellLauncher;

const MERGE_STDERR: &[u8] = b"exec 2>&1\n";

/// One persistent interactive shell process bound to one device.
pub struct ShellSession {
    pub serial: String,
    pub id: Uuid,
    created_at: Instant,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ShellSession {
    pub fn spawn(launcher: &dyn ShellLauncher, serial: &str) -> Result<Self, std::io::Error> {
        let mut child = launcher.launch(serial)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture shell stdin"));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture shell stdout"));
        let (mut stdin, stdout) = match (stdin, stdout) {
            (Ok(stdin), Ok(stdout)) => (stdin, stdout),
            (Err(err), _) | (_, Err(err)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        // Command errors belong in the framed reply, ahead of the marker. A shell
        // that already exited surfaces on the first command instead.
        if let Err(err) = stdin.write_all(MERGE_STDERR).and_then(|_| stdin.flush()) {
            debug!(serial = %serial, error = %err, "failed to merge shell stderr");
        }

        let id = Uuid::new_v4();
        if let Some(stderr) = child.stderr.take() {
            let serial_stderr = serial.to_string();
            // Only the launcher's own diagnostics (adb itself) still arrive here.
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) => debug!(serial = %serial_stderr, session = %id, stderr = %line, "shell stderr"),
                        Err(_) => break,
                    }
                }
            });
        }

        debug!(serial = %serial, session = %id, "spawned persistent shell");
        Ok(Self {
            serial: serial.to_string(),
            id,
            created_at: Instant::now(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(err) => {
                warn!(serial = %self.serial, error = %err, "failed to poll shell process");
                false
            }
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Sends one command and blocks until its framed reply is read.
    pub fn execute(&mut self, command: &str) -> std::io::Result<FramedReply> {
        let sentinel = new_sentinel();
        frame_command(&mut self.stdout, &mut self.stdin, command, &sentinel)
    }

    pub fn terminate(mut self) {
        if let Err(err) = self.child.kill() {
            // Already exited is fine; anything else is worth a trace.
            if err.kind() != std::io::ErrorKind::InvalidInput {
                debug!(serial = %self.serial, error = %err, "failed to kill shell process");
            }
        }
        let _ = self.child.wait();
        debug!(
            serial = %self.serial,
            session = %self.id,
            age_ms = self.age().as_millis() as u64,
            "terminated persistent shell"
        );
    }
}
