pub mod framer;
pub mod launcher;
pub mod registry;
pub mod session;

/// Ad hoc command access to a device, as seen by the sampler and other features.
///
/// Failures never surface as `Err`: they come back as `Error: ...` text so polling
/// call sites keep going. Use [`is_shell_error`] to tell them apart.
pub trait DeviceShell: Send + Sync {
    fn execute(&self, serial: &str, command: &str) -> String;

    /// Returns whether anything was tracked for `serial`.
    fn close(&self, serial: &str) -> bool;
}

pub const SHELL_ERROR_PREFIX: &str = "Error:";
pub const DEVICE_REQUIRED: &str = "Error: device id is required";

pub fn shell_not_running(serial: &str) -> String {
    format!("{SHELL_ERROR_PREFIX} Shell for {serial} is not running.")
}

pub fn shell_spawn_failed(serial: &str, err: &std::io::Error) -> String {
    format!("{SHELL_ERROR_PREFIX} Failed to start shell for {serial}: {err}")
}

pub fn is_shell_error(output: &str) -> bool {
    output.starts_with(SHELL_ERROR_PREFIX)
}
