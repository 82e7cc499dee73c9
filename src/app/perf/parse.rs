use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::{JankStats, Metric};
use crate::app::shell::is_shell_error;

pub const TOP_SNAPSHOT_COMMAND: &str = "top -n 1 -b";
pub const SURFACE_LIST_COMMAND: &str = "dumpsys SurfaceFlinger --list";

/// Column holding %CPU in Android's `top -b` output when no field carries a `%`.
const TOP_CPU_COLUMN: usize = 8;

pub fn meminfo_command(package: &str) -> String {
    format!("dumpsys meminfo {package}")
}

pub fn gfxinfo_command(package: &str) -> String {
    format!("dumpsys gfxinfo {package}")
}

pub fn gfxinfo_reset_command(package: &str) -> String {
    format!("dumpsys gfxinfo {package} reset")
}

pub fn surface_latency_command(surface_name: &str) -> String {
    format!("dumpsys SurfaceFlinger --latency '{surface_name}'")
}

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern is valid"))
}

/// `dumpsys meminfo` TOTAL (KB) as MB with two decimals.
pub fn parse_ram_mb(meminfo: &str) -> Metric {
    static TOTAL: OnceLock<Regex> = OnceLock::new();
    if !meminfo.contains("TOTAL") {
        return Metric::NotAvailable;
    }
    cached(&TOTAL, r"TOTAL\s+(\d+)")
        .captures(meminfo)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .map(|kb| Metric::value(format!("{:.2}", kb as f64 / 1024.0)))
        .unwrap_or(Metric::NotAvailable)
}

/// %CPU of the first `top` line naming `package`.
///
/// A shell error or an unparseable line is N/A; a package missing from the
/// snapshot is idle, so "0.0".
pub fn parse_cpu_percent(top_output: &str, package: &str) -> Metric {
    if is_shell_error(top_output) || top_output.contains("not found") {
        return Metric::NotAvailable;
    }
    let Some(line) = top_output.lines().find(|line| line.contains(package)) else {
        return Metric::value("0.0");
    };
    let parts: Vec<&str> = line.split_whitespace().collect();
    if let Some(tagged) = parts.iter().find(|part| part.contains('%')) {
        return Metric::value(tagged.replace('%', ""));
    }
    parts
        .get(TOP_CPU_COLUMN)
        .map(|value| Metric::value(*value))
        .unwrap_or(Metric::NotAvailable)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GfxStats {
    pub jank: JankStats,
    pub gpu_kb: Metric,
    pub missed_vsync: Metric,
}

pub fn parse_gfxinfo(gfxinfo: &str) -> GfxStats {
    GfxStats {
        jank: parse_jank(gfxinfo),
        gpu_kb: parse_gpu_memory_kb(gfxinfo),
        missed_vsync: parse_missed_vsync(gfxinfo),
    }
}

pub fn parse_jank(gfxinfo: &str) -> JankStats {
    static JANKY: OnceLock<Regex> = OnceLock::new();
    static TOTAL: OnceLock<Regex> = OnceLock::new();
    let Some(caps) = cached(&JANKY, r"Janky frames: (\d+) \(([\d.]+)%\)").captures(gfxinfo) else {
        return JankStats::default();
    };
    let Ok(janky_frames) = caps[1].parse::<u64>() else {
        return JankStats::default();
    };
    let total_frames = cached(&TOTAL, r"Total frames rendered: (\d+)")
        .captures(gfxinfo)
        .and_then(|total| total[1].parse::<u64>().ok());
    JankStats {
        janky_frames,
        percent: caps[2].to_string(),
        total_frames,
    }
}

/// GPU memory normalized to KB with two decimals.
pub fn parse_gpu_memory_kb(gfxinfo: &str) -> Metric {
    static GPU: OnceLock<Regex> = OnceLock::new();
    cached(&GPU, r"Total GPU memory usage:\s+\d+ bytes, ([\d.]+) (KB|MB)")
        .captures(gfxinfo)
        .and_then(|caps| {
            let value = caps[1].parse::<f64>().ok()?;
            normalize_gpu_kb(value, &caps[2])
        })
        .map(Metric::value)
        .unwrap_or(Metric::NotAvailable)
}

pub fn normalize_gpu_kb(value: f64, unit: &str) -> Option<String> {
    match unit {
        "KB" => Some(format!("{value:.2}")),
        "MB" => Some(format!("{:.2}", value * 1024.0)),
        _ => None,
    }
}

pub fn parse_missed_vsync(gfxinfo: &str) -> Metric {
    static VSYNC: OnceLock<Regex> = OnceLock::new();
    cached(&VSYNC, r"Number Missed Vsync: (\d+)")
        .captures(gfxinfo)
        .map(|caps| Metric::value(&caps[1]))
        .unwrap_or(Metric::NotAvailable)
}

/// Picks the package's SurfaceView layer, preferring the BLAST variant.
pub fn find_surface_view_name(
    layer_list: &str,
    package: &str,
) -> Result<Option<String>, regex::Error> {
    let escaped = regex::escape(package);
    let blast = Regex::new(&format!(r"(SurfaceView\[.*?{escaped}\S*?\(BLAST\)#\d+)"))?;
    if let Some(caps) = blast.captures(layer_list) {
        return Ok(Some(caps[1].to_string()));
    }
    let plain = Regex::new(&format!(r"(SurfaceView\[.*?{escaped}.*?#\d+)"))?;
    Ok(plain.captures(layer_list).map(|caps| caps[1].to_string()))
}

/// Frame-present timestamps from `SurfaceFlinger --latency`.
///
/// The first line is the refresh period; frame rows have three columns and a
/// leading `0` marks an unused slot.
pub fn parse_frame_timestamps(latency_output: &str) -> HashSet<u64> {
    latency_output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 3 || parts[0] == "0" {
                return None;
            }
            parts[2].parse::<u64>().ok()
        })
        .filter(|ts| *ts != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_converts_total_kb_to_mb() {
        let meminfo = "** MEMINFO in pid 1234 [com.example.app] **\n  Native Heap  1000\n        TOTAL    20480    12000\n";
        assert_eq!(parse_ram_mb(meminfo), Metric::value("20.00"));
        assert_eq!(parse_ram_mb("TOTAL 20480"), Metric::value("20.00"));
    }

    #[test]
    fn ram_without_total_is_not_available() {
        assert_eq!(parse_ram_mb("No process found for: com.example.app"), Metric::NotAvailable);
        assert_eq!(parse_ram_mb("TOTAL PSS: n/a"), Metric::NotAvailable);
    }

    #[test]
    fn cpu_prefers_percent_tagged_field() {
        let top = "  PID USER PR NI VIRT RES SHR S %CPU %MEM TIME+ ARGS\n 4321 u0_a1 10 -10 4.1G 210M 120M S 12.5% 3.1 0:10.00 com.example.app\n";
        assert_eq!(parse_cpu_percent(top, "com.example.app"), Metric::value("12.5"));
    }

    #[test]
    fn cpu_falls_back_to_fixed_column() {
        let top = " 4321 u0_a1 10 -10 4.1G 210M 120M S 33.0 3.1 0:10.00 com.example.app\n";
        assert_eq!(parse_cpu_percent(top, "com.example.app"), Metric::value("33.0"));
    }

    #[test]
    fn cpu_missing_package_is_idle_and_errors_are_not_available() {
        let top = " 1 root 20 0 10M 1M 1M S 0.0 0.1 0:01.00 init\n";
        assert_eq!(parse_cpu_percent(top, "com.example.app"), Metric::value("0.0"));
        assert_eq!(
            parse_cpu_percent("Error: Shell for ABC is not running.", "com.example.app"),
            Metric::NotAvailable
        );
        assert_eq!(parse_cpu_percent("/system/bin/sh: top: not found", "top"), Metric::NotAvailable);
        assert_eq!(parse_cpu_percent("com.example.app S", "com.example.app"), Metric::NotAvailable);
    }

    #[test]
    fn gfxinfo_extracts_jank_gpu_and_vsync() {
        let gfx = "\
Stats since: 1234ns
Total frames rendered: 240
Janky frames: 12 (5.00%)
Number Missed Vsync: 3
Total GPU memory usage:
  2097152 bytes, 2.00 MB
";
        let stats = parse_gfxinfo(gfx);
        assert_eq!(stats.jank.to_string(), "5.00% (12/240)");
        assert_eq!(stats.missed_vsync, Metric::value("3"));
        assert_eq!(stats.gpu_kb, Metric::value("2048.00"));
    }

    #[test]
    fn gfxinfo_defaults_when_patterns_are_missing() {
        let stats = parse_gfxinfo("No process found for: com.example.app");
        assert_eq!(stats.jank.to_string(), "0% (0/0)");
        assert_eq!(stats.gpu_kb, Metric::NotAvailable);
        assert_eq!(stats.missed_vsync, Metric::NotAvailable);
    }

    #[test]
    fn jank_without_total_marks_unknown() {
        assert_eq!(parse_jank("Janky frames: 7 (1.25%)").to_string(), "1.25% (7/?)");
    }

    #[test]
    fn gpu_units_normalize_to_kb() {
        assert_eq!(normalize_gpu_kb(2.0, "MB").as_deref(), Some("2048.00"));
        assert_eq!(normalize_gpu_kb(512.0, "KB").as_deref(), Some("512.00"));
        assert_eq!(normalize_gpu_kb(1.0, "GB"), None);
        assert_eq!(
            parse_gpu_memory_kb("Total GPU memory usage:\n  524288 bytes, 512.00 KB"),
            Metric::value("512.00")
        );
    }

    #[test]
    fn surface_name_prefers_blast_layer() {
        let list = "\
SurfaceView[com.example.app/com.example.app.MainActivity]#120
SurfaceView[com.example.app/com.example.app.MainActivity](BLAST)#121
com.example.app/com.example.app.MainActivity#119
";
        assert_eq!(
            find_surface_view_name(list, "com.example.app").expect("pattern"),
            Some("SurfaceView[com.example.app/com.example.app.MainActivity](BLAST)#121".to_string())
        );
    }

    #[test]
    fn surface_name_falls_back_to_plain_layer() {
        let list = "StatusBar#12\nSurfaceView - com.other/.Main#3\nSurfaceView[com.example.app/.GameActivity]#88\n";
        assert_eq!(
            find_surface_view_name(list, "com.example.app").expect("pattern"),
            Some("SurfaceView[com.example.app/.GameActivity]#88".to_string())
        );
        assert_eq!(find_surface_view_name(list, "com.absent").expect("pattern"), None);
    }

    #[test]
    fn surface_name_escapes_package_dots() {
        let list = "SurfaceView[comXexampleXapp/.Main]#1\n";
        assert_eq!(find_surface_view_name(list, "com.example.app").expect("pattern"), None);
    }

    #[test]
    fn frame_timestamps_skip_header_and_empty_slots() {
        let latency = "16666666\n0 0 0\n100 150 200\n300 350 400\nbogus line\n0 0 0\n";
        let stamps = parse_frame_timestamps(latency);
        assert_eq!(stamps, HashSet::from([200, 400]));
        assert!(parse_frame_timestamps("").is_empty());
    }

    #[test]
    fn commands_quote_surface_names() {
        assert_eq!(
            surface_latency_command("SurfaceView[com.example.app/.Main](BLAST)#1"),
            "dumpsys SurfaceFlinger --latency 'SurfaceView[com.example.app/.Main](BLAST)#1'"
        );
        assert_eq!(gfxinfo_reset_command("com.example.app"), "dumpsys gfxinfo com.example.app reset");
        assert_eq!(meminfo_command("com.example.app"), "dumpsys meminfo com.example.app");
        assert_eq!(gfxinfo_command("com.example.app"), "dumpsys gfxinfo com.example.app");
    }
}
