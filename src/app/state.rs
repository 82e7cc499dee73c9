use std::sync::Arc;

use tracing::info;

use crate::app::adb::locator::resolve_adb_program;
use crate::app::config::AppConfig;
use crate::app::perf::sampler::{PerfSampler, SamplerSettings};
use crate::app::shell::launcher::{AdbShellLauncher, ShellLauncher};
use crate::app::shell::registry::SessionRegistry;

/// Everything a front-end needs to drive devices: one shell registry shared by
/// ad hoc commands and the sampler.
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub sampler: PerfSampler,
    pub adb_program: String,
}

impl AppState {
    pub fn new(config: &AppConfig) -> Self {
        let adb_program = resolve_adb_program(&config.adb.command_path);
        let launcher = Arc::new(AdbShellLauncher::new(adb_program.clone()));
        Self::with_launcher(launcher, SamplerSettings::from(&config.perf), adb_program)
    }

    pub fn with_launcher(
        launcher: Arc<dyn ShellLauncher>,
        settings: SamplerSettings,
        adb_program: String,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(launcher));
        let sampler = PerfSampler::new(sessions.clone(), settings);
        Self {
            sessions,
            sampler,
            adb_program,
        }
    }

    /// Stops every monitor and closes every shell so no helper process outlives the app.
    pub fn shutdown(&self, trace_id: &str) {
        let monitors = self.sampler.stop_all(trace_id);
        let shells = self.sessions.close_all();
        info!(trace_id = %trace_id, monitors, shells, "shutdown complete");
    }
}
