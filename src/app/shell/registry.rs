//! Per-device persistent shells behind two levels of locking.
//!
//! The map lock only guards inserting and removing device slots and is never
//! held across spawning or shell I/O. Each slot hands out turns in ticket
//! order, so one device's commands run strictly FIFO while other devices
//! proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::app::shell::launcher::ShellLauncher;
use crate::app::shell::session::ShellSession;
use crate::app::shell::{
    shell_not_running, shell_spawn_failed, DeviceShell, DEVICE_REQUIRED,
};

struct SlotState {
    session: Option<ShellSession>,
    next_ticket: u64,
    now_serving: u64,
    retired: bool,
}

struct DeviceSlot {
    state: Mutex<SlotState>,
    turn: Condvar,
}

impl DeviceSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                session: None,
                next_ticket: 0,
                now_serving: 0,
                retired: false,
            }),
            turn: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every earlier caller on this device has released its turn.
    fn acquire(self: &Arc<Self>) -> DeviceTurn {
        let mut state = self.lock_state();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.now_serving != ticket {
            state = self
                .turn
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let session = state.session.take();
        let retired = state.retired;
        drop(state);
        DeviceTurn {
            slot: Arc::clone(self),
            session,
            retired,
            retire_on_release: false,
        }
    }
}

/// Exclusive use of one device's shell. Releasing it hands the session back and
/// wakes the next ticket, even when the holder panicked.
struct DeviceTurn {
    slot: Arc<DeviceSlot>,
    session: Option<ShellSession>,
    retired: bool,
    retire_on_release: bool,
}

impl DeviceTurn {
    fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.terminate();
        }
    }
}

impl Drop for DeviceTurn {
    fn drop(&mut self) {
        let leftover = {
            let mut state = self.slot.lock_state();
            let leftover = if self.retire_on_release || self.retired {
                state.retired = true;
                self.session.take()
            } else {
                state.session = self.session.take();
                None
            };
            state.now_serving += 1;
            leftover
        };
        self.slot.turn.notify_all();
        if let Some(session) = leftover {
            session.terminate();
        }
    }
}

pub struct SessionRegistry {
    launcher: Arc<dyn ShellLauncher>,
    slots: Mutex<HashMap<String, Arc<DeviceSlot>>>,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn ShellLauncher>) -> Self {
        Self {
            launcher,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Arc<DeviceSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_for(&self, serial: &str) -> Arc<DeviceSlot> {
        let mut slots = self.lock_slots();
        slots
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(DeviceSlot::new()))
            .clone()
    }

    /// Runs `command` on the device's persistent shell and returns its trimmed
    /// output, spawning the shell on first use or after it exited.
    pub fn execute(&self, serial: &str, command: &str) -> String {
        if serial.trim().is_empty() {
            return DEVICE_REQUIRED.to_string();
        }
        loop {
            let slot = self.slot_for(serial);
            let mut turn = slot.acquire();
            if turn.retired {
                // Closed while we queued; look the device up again.
                continue;
            }
            return self.execute_in_turn(&mut turn, serial, command);
        }
    }

    fn execute_in_turn(&self, turn: &mut DeviceTurn, serial: &str, command: &str) -> String {
        if let Some(mut session) = turn.session.take() {
            if session.is_alive() {
                turn.session = Some(session);
            } else {
                info!(serial = %serial, session = %session.id, "shell exited; spawning a replacement");
                session.terminate();
            }
        }

        if turn.session.is_none() {
            match ShellSession::spawn(self.launcher.as_ref(), serial) {
                Ok(session) => turn.session = Some(session),
                Err(err) => {
                    warn!(serial = %serial, error = %err, "failed to spawn persistent shell");
                    return shell_spawn_failed(serial, &err);
                }
            }
        }

        let Some(session) = turn.session.as_mut() else {
            return shell_not_running(serial);
        };
        if !session.is_alive() {
            turn.discard_session();
            return shell_not_running(serial);
        }

        match session.execute(command) {
            Ok(reply) if reply.complete => reply.text,
            Ok(reply) => {
                debug!(serial = %serial, "shell stream ended before the end marker");
                turn.discard_session();
                if reply.text.is_empty() {
                    shell_not_running(serial)
                } else {
                    reply.text
                }
            }
            Err(err) => {
                warn!(serial = %serial, error = %err, "shell write/read failed");
                turn.discard_session();
                shell_not_running(serial)
            }
        }
    }

    /// Terminates the device's shell and forgets the device. Waits for commands
    /// already queued on it. Unknown devices are a no-op.
    pub fn close(&self, serial: &str) -> bool {
        let slot = self.lock_slots().remove(serial);
        let Some(slot) = slot else {
            return false;
        };
        let mut turn = slot.acquire();
        turn.retire_on_release = true;
        debug!(serial = %serial, "closing persistent shell");
        true
    }

    pub fn close_all(&self) -> usize {
        let serials: Vec<String> = self.lock_slots().keys().cloned().collect();
        let closed = serials
            .iter()
            .filter(|serial| self.close(serial))
            .count();
        if closed > 0 {
            info!(count = closed, "closed all persistent shells");
        }
        closed
    }

    pub fn is_tracked(&self, serial: &str) -> bool {
        self.lock_slots().contains_key(serial)
    }

    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceShell for SessionRegistry {
    fn execute(&self, serial: &str, command: &str) -> String {
        SessionRegistry::execute(self, serial, command)
    }

    fn close(&self, serial: &str) -> bool {
        SessionRegistry::close(self, serial)
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::shell::is_shell_error;
    use crate::app::shell::launcher::piped_command;
    use std::process::{Child, Command, Stdio};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn local_sh_registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(Arc::new(|_serial: &str| {
            piped_command("sh", &[]).spawn()
        })))
    }

    fn process_exists(pid: u32) -> bool {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[test]
    fn execute_creates_session_on_first_use() {
        let registry = local_sh_registry();
        assert!(!registry.is_tracked("dev-1"));
        assert_eq!(registry.execute("dev-1", "echo hello"), "hello");
        assert!(registry.is_tracked("dev-1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn output_is_trimmed_and_multiline_preserved() {
        let registry = local_sh_registry();
        assert_eq!(registry.execute("dev-1", "printf '  a\\nb  \\n\\n'"), "a\nb");
        assert_eq!(registry.execute("dev-1", ""), "");
    }

    #[test]
    fn unknown_command_reports_shell_error_text() {
        let registry = local_sh_registry();
        let output = registry.execute("dev-1", "lbt_no_such_command_xyz");
        assert!(output.contains("lbt_no_such_command_xyz"), "unexpected output: {output}");
        assert!(output.contains("not found"), "unexpected output: {output}");
        assert_eq!(registry.execute("dev-1", "echo still-alive"), "still-alive");
    }

    #[test]
    fn unterminated_last_line_is_kept() {
        let registry = local_sh_registry();
        assert_eq!(registry.execute("dev-1", "printf abc"), "abc");
        assert_eq!(registry.execute("dev-1", "echo next"), "next");
    }

    #[test]
    fn close_then_execute_starts_fresh_shell() {
        let registry = local_sh_registry();
        registry.execute("dev-1", "LBT_MARK=stale");
        assert_eq!(registry.execute("dev-1", "echo $LBT_MARK"), "stale");

        assert!(registry.close("dev-1"));
        assert!(!registry.is_tracked("dev-1"));

        assert_eq!(registry.execute("dev-1", "echo \"[$LBT_MARK]\""), "[]");
    }

    #[test]
    fn close_is_idempotent() {
        let registry = local_sh_registry();
        assert!(!registry.close("never-seen"));
        registry.execute("dev-1", "true");
        assert!(registry.close("dev-1"));
        assert!(!registry.close("dev-1"));
    }

    #[test]
    fn empty_device_id_is_rejected_softly() {
        let registry = local_sh_registry();
        assert_eq!(registry.execute("  ", "echo hi"), DEVICE_REQUIRED);
        assert!(registry.is_empty());
    }

    #[test]
    fn exited_shell_returns_not_running_promptly() {
        let registry = SessionRegistry::new(Arc::new(|_serial: &str| {
            piped_command("sh", &["-c".to_string(), "exit 0".to_string()]).spawn()
        }));
        let started = Instant::now();
        let output = registry.execute("gone", "echo hi");
        assert_eq!(output, shell_not_running("gone"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn shell_exit_mid_session_is_replaced_on_next_call() {
        let registry = local_sh_registry();
        assert_eq!(registry.execute("dev-1", "echo one"), "one");
        assert_eq!(registry.execute("dev-1", "exit 3"), shell_not_running("dev-1"));
        assert_eq!(registry.execute("dev-1", "echo two"), "two");
    }

    #[test]
    fn spawn_failure_is_soft() {
        let registry = SessionRegistry::new(Arc::new(|_serial: &str| -> std::io::Result<Child> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "adb not found"))
        }));
        let output = registry.execute("dev-1", "echo hi");
        assert!(is_shell_error(&output), "unexpected output: {output}");
        assert!(output.contains("adb not found"));
    }

    #[test]
    fn concurrent_callers_on_one_device_get_their_own_output() {
        let registry = local_sh_registry();
        let mut handles = Vec::new();
        for idx in 0..12 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let token = format!("token-{idx}");
                let output = registry.execute("shared", &format!("echo {token}; echo {token}-tail"));
                (token, output)
            }));
        }
        for handle in handles {
            let (token, output) = handle.join().expect("join");
            assert_eq!(output, format!("{token}\n{token}-tail"));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_device_commands_complete_in_issue_order() {
        let registry = local_sh_registry();
        registry.execute("dev-1", "true");

        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut handles = Vec::new();
        for (idx, command) in ["sleep 0.3; echo 0", "echo 1", "echo 2"].iter().enumerate() {
            let registry = Arc::clone(&registry);
            let order = Arc::clone(&order);
            let command = command.to_string();
            handles.push(thread::spawn(move || {
                let output = registry.execute("dev-1", &command);
                order.lock().expect("order").push(output);
            }));
            if idx + 1 < 3 {
                thread::sleep(Duration::from_millis(60));
            }
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(*order.lock().expect("order"), vec!["0", "1", "2"]);
    }

    #[test]
    fn different_devices_do_not_block_each_other() {
        let registry = local_sh_registry();
        registry.execute("slow", "true");
        registry.execute("fast", "true");

        let slow_registry = Arc::clone(&registry);
        let slow = thread::spawn(move || slow_registry.execute("slow", "sleep 1; echo slow"));
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert_eq!(registry.execute("fast", "echo fast"), "fast");
        assert!(
            started.elapsed() < Duration::from_millis(700),
            "fast device waited {:?}",
            started.elapsed()
        );
        assert_eq!(slow.join().expect("join"), "slow");
    }

    #[test]
    fn close_all_empties_registry_and_reaps_processes() {
        let pids = Arc::new(Mutex::new(Vec::<u32>::new()));
        let spawned = Arc::new(AtomicUsize::new(0));
        let pids_launch = Arc::clone(&pids);
        let spawned_launch = Arc::clone(&spawned);
        let registry = SessionRegistry::new(Arc::new(move |_serial: &str| -> std::io::Result<Child> {
            let child = piped_command("sh", &[]).spawn()?;
            pids_launch.lock().expect("pids").push(child.id());
            spawned_launch.fetch_add(1, Ordering::SeqCst);
            Ok(child)
        }));

        for serial in ["a", "b", "c"] {
            assert_eq!(registry.execute(serial, "echo up"), "up");
        }
        assert_eq!(spawned.load(Ordering::SeqCst), 3);

        assert_eq!(registry.close_all(), 3);
        assert!(registry.is_empty());
        for pid in pids.lock().expect("pids").iter() {
            assert!(!process_exists(*pid), "process {pid} still alive");
        }
    }

    #[test]
    fn close_waits_for_in_flight_command() {
        let registry = local_sh_registry();
        registry.execute("dev-1", "true");

        let worker_registry = Arc::clone(&registry);
        let worker = thread::spawn(move || worker_registry.execute("dev-1", "sleep 0.3; echo done"));
        thread::sleep(Duration::from_millis(80));

        assert!(registry.close("dev-1"));
        assert_eq!(worker.join().expect("join"), "done");
        assert!(!registry.is_tracked("dev-1"));
    }
}
