use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::app::config::PerfSettings;
use crate::app::error::{ensure_non_empty, ensure_package_name, AppError};
use crate::app::models::{Metric, PerfEvent, PerfSample};
use crate::app::perf::frames::FrameTracker;
use crate::app::perf::parse::{
    find_surface_view_name, gfxinfo_command, gfxinfo_reset_command, meminfo_command,
    parse_cpu_percent, parse_frame_timestamps, parse_gfxinfo, parse_ram_mb,
    surface_latency_command, SURFACE_LIST_COMMAND, TOP_SNAPSHOT_COMMAND,
};
use crate::app::perf::sink::{CallbackSink, ChannelSink, PerfEmitter, PerfSink};
use crate::app::shell::{is_shell_error, DeviceShell};

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub reset_settle: Duration,
    pub stop_timeout: Duration,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self::from(&PerfSettings::default())
    }
}

impl From<&PerfSettings> for SamplerSettings {
    fn from(settings: &PerfSettings) -> Self {
        Self {
            interval: settings.interval(),
            reset_settle: settings.reset_settle(),
            stop_timeout: settings.stop_timeout(),
        }
    }
}

pub struct PerfMonitorHandle {
    pub package: String,
    pub stop_flag: Arc<AtomicBool>,
    /// Set by `stop` when it gave up waiting; the loop then closes the shell itself.
    pub detached: Arc<AtomicBool>,
    pub join: JoinHandle<()>,
}

/// Runs at most one polling loop per device and publishes samples to a sink.
pub struct PerfSampler {
    shell: Arc<dyn DeviceShell>,
    settings: SamplerSettings,
    monitors: Mutex<HashMap<String, PerfMonitorHandle>>,
}

impl PerfSampler {
    pub fn new(shell: Arc<dyn DeviceShell>, settings: SamplerSettings) -> Self {
        Self {
            shell,
            settings,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    fn lock_monitors(
        &self,
        trace_id: &str,
    ) -> Result<MutexGuard<'_, HashMap<String, PerfMonitorHandle>>, AppError> {
        self.monitors
            .lock()
            .map_err(|_| AppError::system("Perf monitor registry locked", trace_id))
    }

    /// Starts monitoring `package` on `serial`. `Ok(false)` when a loop is
    /// already running for the device.
    pub fn start(
        &self,
        serial: &str,
        package: &str,
        sink: Arc<dyn PerfSink>,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        ensure_non_empty(serial, "serial", trace_id)?;
        ensure_package_name(package, trace_id)?;
        let package = package.trim();

        let mut guard = self.lock_monitors(trace_id)?;
        if let Some(existing) = guard.get(serial) {
            if !existing.join.is_finished() {
                debug!(trace_id = %trace_id, serial = %serial, "perf monitor already running");
                return Ok(false);
            }
            // The previous loop ended on its own; reap it before starting anew.
            if let Some(finished) = guard.remove(serial) {
                let _ = finished.join.join();
            }
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let detached = Arc::new(AtomicBool::new(false));
        let monitor = MonitorLoop {
            shell: Arc::clone(&self.shell),
            serial: serial.to_string(),
            package: package.to_string(),
            sink,
            settings: self.settings.clone(),
            stop_flag: Arc::clone(&stop_flag),
            detached: Arc::clone(&detached),
            trace_id: trace_id.to_string(),
        };
        let join = std::thread::Builder::new()
            .name(format!("perf-{serial}"))
            .spawn(move || monitor.run())
            .map_err(|err| {
                AppError::system(format!("Failed to spawn perf monitor: {err}"), trace_id)
            })?;

        guard.insert(
            serial.to_string(),
            PerfMonitorHandle {
                package: package.to_string(),
                stop_flag,
                detached,
                join,
            },
        );
        info!(trace_id = %trace_id, serial = %serial, package = %package, "perf monitor started");
        Ok(true)
    }

    pub fn start_with_callback(
        &self,
        serial: &str,
        package: &str,
        emitter: PerfEmitter,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        self.start(serial, package, Arc::new(CallbackSink::new(emitter)), trace_id)
    }

    pub fn start_with_channel(
        &self,
        serial: &str,
        package: &str,
        tx: Sender<PerfEvent>,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        self.start(serial, package, Arc::new(ChannelSink::new(tx)), trace_id)
    }

    /// Stops the device's loop and closes its shell. `Ok(false)` when nothing
    /// was running.
    pub fn stop(&self, serial: &str, trace_id: &str) -> Result<bool, AppError> {
        ensure_non_empty(serial, "serial", trace_id)?;

        let handle = self.lock_monitors(trace_id)?.remove(serial);
        let Some(handle) = handle else {
            return Ok(false);
        };

        handle.stop_flag.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.settings.stop_timeout;
        while !handle.join.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if handle.join.is_finished() {
            if handle.join.join().is_err() {
                warn!(trace_id = %trace_id, serial = %serial, "perf monitor thread panicked");
            }
        } else {
            // No new commands start once the stop flag is set; the loop closes
            // the shell again after the one still in flight.
            handle.detached.store(true, Ordering::SeqCst);
            warn!(
                trace_id = %trace_id,
                serial = %serial,
                timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                "perf monitor did not exit in time; detaching"
            );
        }

        self.shell.close(serial);
        info!(trace_id = %trace_id, serial = %serial, package = %handle.package, "perf monitor stopped");
        Ok(true)
    }

    pub fn stop_all(&self, trace_id: &str) -> usize {
        let serials: Vec<String> = match self.lock_monitors(trace_id) {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to list perf monitors");
                return 0;
            }
        };
        serials
            .iter()
            .filter(|serial| matches!(self.stop(serial, trace_id), Ok(true)))
            .count()
    }

    pub fn is_running(&self, serial: &str) -> bool {
        self.monitors
            .lock()
            .map(|guard| {
                guard
                    .get(serial)
                    .map(|handle| !handle.join.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

impl Drop for PerfSampler {
    fn drop(&mut self) {
        if let Ok(guard) = self.monitors.lock() {
            for handle in guard.values() {
                handle.stop_flag.store(true, Ordering::Relaxed);
            }
        }
    }
}

struct MonitorLoop {
    shell: Arc<dyn DeviceShell>,
    serial: String,
    package: String,
    sink: Arc<dyn PerfSink>,
    settings: SamplerSettings,
    stop_flag: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
    trace_id: String,
}

impl MonitorLoop {
    fn run(self) {
        self.poll();
        if self.detached.load(Ordering::SeqCst) {
            // `stop` gave up waiting, so its close may have raced our last command.
            self.shell.close(&self.serial);
        }
        debug!(trace_id = %self.trace_id, serial = %self.serial, "perf monitor loop exited");
    }

    fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Runs `command` unless a stop was requested.
    fn shell_output(&self, command: &str) -> Option<String> {
        if self.stopping() {
            return None;
        }
        Some(self.shell.execute(&self.serial, command))
    }

    fn poll(&self) {
        let starting = format!(
            "Starting monitoring for app '{}' on device '{}'...",
            self.package, self.serial
        );
        if self.sink.publish(PerfEvent::status(&self.serial, starting)).is_err() {
            return;
        }

        // Scope jank and frame totals to this session.
        if self.shell_output(&gfxinfo_reset_command(&self.package)).is_none() {
            return;
        }
        sleep_with_stop(self.settings.reset_settle, &self.stop_flag);

        let started = Instant::now();
        let mut frames = FrameTracker::default();

        while !self.stopping() {
            let tick_started = Instant::now();
            let published = match self.tick(started, &mut frames) {
                Ok(Some(sample)) if !self.stopping() => {
                    self.sink.publish(PerfEvent::Sample(sample)).map_err(|err| {
                        AppError::system(err.to_string(), self.trace_id.as_str())
                    })
                }
                Ok(_) => return,
                Err(err) => Err(err),
            };
            if let Err(err) = published {
                warn!(
                    trace_id = %self.trace_id,
                    serial = %self.serial,
                    error = %err,
                    "perf monitor loop failed"
                );
                let _ = self.sink.publish(PerfEvent::status(
                    &self.serial,
                    format!("ERROR in monitoring loop: {}", err.error),
                ));
                return;
            }

            let elapsed = tick_started.elapsed();
            if elapsed < self.settings.interval {
                sleep_with_stop(self.settings.interval - elapsed, &self.stop_flag);
            }
        }
    }

    /// `Ok(None)` when a stop interrupted the tick.
    fn tick(
        &self,
        started: Instant,
        frames: &mut FrameTracker,
    ) -> Result<Option<PerfSample>, AppError> {
        let Some(meminfo) = self.shell_output(&meminfo_command(&self.package)) else {
            return Ok(None);
        };
        let Some(top) = self.shell_output(TOP_SNAPSHOT_COMMAND) else {
            return Ok(None);
        };
        let Some(gfxinfo) = self.shell_output(&gfxinfo_command(&self.package)) else {
            return Ok(None);
        };
        let Some(fps) = self.sample_fps(frames)? else {
            return Ok(None);
        };
        let gfx = parse_gfxinfo(&gfxinfo);

        Ok(Some(PerfSample {
            device: self.serial.clone(),
            package: self.package.clone(),
            timestamp: Utc::now().timestamp_millis(),
            elapsed: started.elapsed().as_millis() as u64,
            cpu: parse_cpu_percent(&top, &self.package),
            ram: parse_ram_mb(&meminfo),
            gpu: gfx.gpu_kb,
            missed_vsync: gfx.missed_vsync,
            jank: gfx.jank,
            fps,
        }))
    }

    fn sample_fps(&self, frames: &mut FrameTracker) -> Result<Option<Metric>, AppError> {
        let Some(layers) = self.shell_output(SURFACE_LIST_COMMAND) else {
            return Ok(None);
        };
        if is_shell_error(&layers) {
            return Ok(Some(Metric::NotAvailable));
        }
        let surface = find_surface_view_name(&layers, &self.package).map_err(|err| {
            AppError::system(
                format!("Invalid surface pattern for {}: {err}", self.package),
                self.trace_id.as_str(),
            )
        })?;
        let Some(surface) = surface else {
            return Ok(Some(Metric::NotAvailable));
        };

        let Some(latency) = self.shell_output(&surface_latency_command(&surface)) else {
            return Ok(None);
        };
        if is_shell_error(&latency) {
            return Ok(Some(Metric::NotAvailable));
        }
        Ok(Some(frames.observe(parse_frame_timestamps(&latency))))
    }
}

fn sleep_with_stop(duration: Duration, stop_flag: &Arc<AtomicBool>) {
    let mut remaining = duration;
    let chunk = Duration::from_millis(50);
    while remaining > Duration::from_millis(0) {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let step = if remaining > chunk { chunk } else { remaining };
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
