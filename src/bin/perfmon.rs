use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use lazy_blacktea_perf_lib::app::adb::locator::validate_adb_program;
use lazy_blacktea_perf_lib::app::config::{config_path, load_config, save_config, AppConfig};
use lazy_blacktea_perf_lib::app::logging::init_logging;
use lazy_blacktea_perf_lib::app::perf::sink::{JsonLinesSink, PerfSink, TableSink};
use lazy_blacktea_perf_lib::app::shell::is_shell_error;
use lazy_blacktea_perf_lib::app::state::AppState;
use uuid::Uuid;

const USAGE: &str = "\
usage:
  perfmon exec    [--serial SERIAL] <command...>
  perfmon monitor [--serial SERIAL] --package PACKAGE [--duration-secs N] [--json]
  perfmon init-config

SERIAL defaults to $ANDROID_SERIAL. Without --duration-secs, monitoring runs
until stdin is closed or a line is entered.";

#[derive(Debug, Clone)]
enum Mode {
    Exec { command: String },
    Monitor {
        package: String,
        duration: Option<Duration>,
        json: bool,
    },
    InitConfig,
}

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    mode: Mode,
}

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut package: Option<String> = None;
    let mut duration: Option<Duration> = None;
    let mut json = false;
    let mut rest: Vec<String> = Vec::new();

    let mut it = std::env::args().skip(1);
    let mode_name = it.next().ok_or_else(|| USAGE.to_string())?;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--package" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--package requires a value".to_string())?;
                package = Some(value);
            }
            "--duration-secs" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--duration-secs requires a value".to_string())?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --duration-secs: {value}"))?;
                duration = Some(Duration::from_secs(secs));
            }
            "--json" => {
                json = true;
            }
            "--" => {
                rest.extend(it.by_ref());
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => rest.push(arg),
        }
    }

    let mode = match mode_name.as_str() {
        "exec" => {
            if rest.is_empty() {
                return Err("exec requires a command".to_string());
            }
            Mode::Exec {
                command: rest.join(" "),
            }
        }
        "monitor" => Mode::Monitor {
            package: package.ok_or_else(|| "--package is required".to_string())?,
            duration,
            json,
        },
        "init-config" => Mode::InitConfig,
        _ => return Err(USAGE.to_string()),
    };

    if !matches!(mode, Mode::InitConfig) && serial.is_none() {
        return Err("--serial (or ANDROID_SERIAL) is required".to_string());
    }
    Ok(Args { serial, mode })
}

fn wait_for_stdin_line() {
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let config = match load_config(&trace_id) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.log_level);

    if matches!(args.mode, Mode::InitConfig) {
        match save_config(&AppConfig::default(), &trace_id) {
            Ok(()) => println!("{}", config_path().display()),
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        }
        return;
    }

    let state = AppState::new(&config);
    if let Err(err) = validate_adb_program(&state.adb_program, &trace_id) {
        eprintln!("{err}");
        std::process::exit(1);
    }
    let serial = args.serial.unwrap_or_default();

    let code = match args.mode {
        Mode::Exec { command } => {
            let output = state.sessions.execute(&serial, &command);
            println!("{output}");
            if is_shell_error(&output) {
                1
            } else {
                0
            }
        }
        Mode::Monitor {
            package,
            duration,
            json,
        } => {
            let sink: Arc<dyn PerfSink> = if json {
                Arc::new(JsonLinesSink::new(std::io::stdout()))
            } else {
                Arc::new(TableSink::new(std::io::stdout()))
            };
            match state.sampler.start(&serial, &package, sink, &trace_id) {
                Ok(_) => {
                    match duration {
                        Some(duration) => std::thread::sleep(duration),
                        None => wait_for_stdin_line(),
                    }
                    0
                }
                Err(err) => {
                    eprintln!("{err}");
                    1
                }
            }
        }
        Mode::InitConfig => 0,
    };

    state.shutdown(&trace_id);
    std::process::exit(code);
}
