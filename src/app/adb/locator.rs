use std::path::Path;

use crate::app::error::AppError;

/// Strips one pair of wrapping quotes, as pasted from a file manager.
pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

pub fn validate_adb_program(program: &str, trace_id: &str) -> Result<(), AppError> {
    if program.trim().is_empty() {
        return Err(AppError::validation("ADB command is empty", trace_id));
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err(AppError::validation(
            "ADB path must point to an executable file",
            trace_id,
        ));
    }
    if !path.exists() {
        return Err(AppError::dependency(
            "ADB executable not found at the configured path",
            trace_id,
        ));
    }
    Ok(())
}

/// Arguments for an interactive, long-lived `adb shell` bound to one device.
pub fn interactive_shell_args(serial: &str) -> Vec<String> {
    vec!["-s".to_string(), serial.to_string(), "shell".to_string()]
}
