use std::process::{Child, Command, Stdio};

use crate::app::adb::locator::interactive_shell_args;

/// Spawns the long-lived interactive shell process for one device.
///
/// The child must have piped stdin, stdout and stderr.
pub trait ShellLauncher: Send + Sync {
    fn launch(&self, serial: &str) -> std::io::Result<Child>;
}

impl<F> ShellLauncher for F
where
    F: Fn(&str) -> std::io::Result<Child> + Send + Sync,
{
    fn launch(&self, serial: &str) -> std::io::Result<Child> {
        (self)(serial)
    }
}

pub struct AdbShellLauncher {
    program: String,
}

impl AdbShellLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ShellLauncher for AdbShellLauncher {
    fn launch(&self, serial: &str) -> std::io::Result<Child> {
        piped_command(&self.program, &interactive_shell_args(serial)).spawn()
    }
}

pub fn piped_command(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}
