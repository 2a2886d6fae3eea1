//! Headless smoke driver: proves the core works against a live adb install.
//! Runs discovery once, a shell probe, and (optionally) a screenshot, then
//! reports per-check results and exits with the core's contract codes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use lazy_blacktea_core::config::AppConfig;
use lazy_blacktea_core::logging::init_logging;
use lazy_blacktea_core::{DeviceToolkit, ExitCode};

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    out_dir: PathBuf,
    json: bool,
    with_screenshot: bool,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|skip
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    version: String,
    serial: Option<String>,
    device_count: usize,
    checks: Vec<SmokeCheck>,
    artifacts: HashMap<String, String>,
}

fn parse_args() -> Args {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|value| !value.trim().is_empty());
    let mut out_dir = std::env::temp_dir().join("blacktea_smoke");
    let mut json = false;
    let mut with_screenshot = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--serial" => serial = args.next(),
            "--out" => {
                if let Some(value) = args.next() {
                    out_dir = PathBuf::from(value);
                }
            }
            "--json" => json = true,
            "--with-screenshot" => with_screenshot = true,
            other => {
                eprintln!("unknown argument: {other}");
            }
        }
    }
    Args {
        serial,
        out_dir,
        json,
        with_screenshot,
    }
}

fn run_check(
    checks: &mut Vec<SmokeCheck>,
    name: &'static str,
    run: impl FnOnce() -> Result<(), String>,
) -> bool {
    let started = Instant::now();
    match run() {
        Ok(()) => {
            checks.push(SmokeCheck {
                name,
                status: "pass",
                duration_ms: started.elapsed().as_millis(),
                error: None,
            });
            true
        }
        Err(error) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: started.elapsed().as_millis(),
                error: Some(error),
            });
            false
        }
    }
}

fn main() {
    init_logging();
    let args = parse_args();
    let toolkit = DeviceToolkit::new_ephemeral(AppConfig::default());
    let mut checks = Vec::new();
    let mut artifacts = HashMap::new();

    if let Err(err) = toolkit.start() {
        eprintln!("startup failed: {err}");
        std::process::exit(ExitCode::StartupFailure.code());
    }

    // Let the first discovery tick land.
    let deadline = Instant::now() + Duration::from_secs(10);
    while toolkit.list_devices().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(200));
    }
    let devices = toolkit.list_devices();
    if devices.is_empty() {
        eprintln!("no devices found");
        toolkit.shutdown(None);
        std::process::exit(ExitCode::NoDevices.code());
    }

    let serial = args
        .serial
        .clone()
        .or_else(|| devices.first().map(|device| device.serial.clone()))
        .expect("at least one device");
    let serials = vec![serial.clone()];

    let mut all_passed = run_check(&mut checks, "shell_getprop", || {
        let handle = toolkit
            .run_shell(&serials, "getprop ro.build.version.release")
            .map_err(|err| err.to_string())?;
        let block = handle
            .wait_block(Duration::from_secs(40))
            .ok_or_else(|| "no command block".to_string())?;
        let result = block
            .results
            .first()
            .ok_or_else(|| "empty command block".to_string())?;
        if result.succeeded() && !result.lines.is_empty() {
            Ok(())
        } else {
            Err(format!("exit={:?} error={:?}", result.exit_code, result.error))
        }
    });

    if args.with_screenshot {
        all_passed &= run_check(&mut checks, "screenshot", || {
            let handle = toolkit
                .take_screenshot(&serials, &args.out_dir)
                .map_err(|err| err.to_string())?;
            let summary = handle
                .wait_summary(Duration::from_secs(40))
                .ok_or_else(|| "no summary".to_string())?;
            if summary.succeeded == summary.total {
                if let Some(path) = summary.artifacts.first() {
                    artifacts.insert("screenshot".to_string(), path.clone());
                }
                Ok(())
            } else {
                Err(format!("{} of {} failed", summary.failed, summary.total))
            }
        });
    } else {
        checks.push(SmokeCheck {
            name: "screenshot",
            status: "skip",
            duration_ms: 0,
            error: None,
        });
    }

    toolkit.shutdown(None);

    let summary = SmokeSummary {
        tool: "blacktea-smoke",
        version: lazy_blacktea_core::version::app_version(),
        serial: Some(serial),
        device_count: devices.len(),
        checks,
        artifacts,
    };
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_default()
        );
    } else {
        println!(
            "{} devices; {} checks",
            summary.device_count,
            summary.checks.len()
        );
        for check in &summary.checks {
            match &check.error {
                Some(error) => println!("  {:<16} {} ({})", check.name, check.status, error),
                None => println!("  {:<16} {} ({} ms)", check.name, check.status, check.duration_ms),
            }
        }
    }

    let code = if all_passed {
        ExitCode::Success
    } else {
        ExitCode::PartialFailure
    };
    std::process::exit(code.code());
}
