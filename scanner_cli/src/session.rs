//! Config loading and command sessions against the simulated printer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{Result, WrapErr};
use scanner_config::Config;
use scanner_core::Scanner;
use scanner_hardware::{SimConfig, SimulatedPrinter};
use serde_json::json;

use crate::cli::json_mode;
use crate::error_fmt::{humanize, reason_name};

pub fn load_config(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let cfg = scanner_config::load_toml(&text)
        .wrap_err_with(|| format!("parse config {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// `scanner check`.
pub fn check(cfg: &Config) {
    let sensor = cfg
        .scanner
        .sensor
        .as_deref()
        .or(cfg.scanner.sensor_alt.as_deref())
        .unwrap_or("scanner");
    let models: Vec<&str> = cfg.models.keys().map(String::as_str).collect();
    let mesh = if cfg.scan_mesh().is_some() { "scan" } else { "off" };
    if json_mode() {
        println!(
            "{}",
            json!({
                "ok": true,
                "sensor": sensor,
                "mode": cfg.scanner.mode.as_str(),
                "models": models,
                "mesh": mesh,
            })
        );
    } else {
        println!(
            "Config OK: sensor={sensor} mode={} models=[{}] mesh={mesh}",
            cfg.scanner.mode.as_str(),
            models.join(",")
        );
    }
}

#[derive(Debug, Default)]
pub struct RunOpts {
    pub script: Option<PathBuf>,
    pub commands: Vec<String>,
    pub seed: u64,
    pub no_home: bool,
    pub stream_dir: Option<PathBuf>,
    pub keep_going: bool,
}

fn script_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|l| l.split(['#', ';']).next().unwrap_or_default().trim())
        .filter(|l| !l.is_empty())
}

fn printer_for(cfg: &Config, seed: u64) -> SimulatedPrinter {
    let mut sim_cfg = SimConfig::for_printer(cfg);
    sim_cfg.seed = seed;
    SimulatedPrinter::new(sim_cfg)
}

fn scanner_for(cfg: &Config, sim: &SimulatedPrinter, seed: u64, stream_dir: Option<&Path>) -> Result<Scanner> {
    let mut builder = Scanner::builder()
        .with_config(cfg)
        .with_host(sim)
        .with_clock(Box::new(sim.clock()))
        .with_seed(seed);
    if let Some(dir) = stream_dir {
        builder = builder.with_stream_dir(dir);
    }
    builder.try_build()
}

fn emit(line: &str, console: &[String], error: Option<&eyre::Report>) {
    if json_mode() {
        let mut obj = json!({ "command": line, "ok": error.is_none(), "console": console });
        if let Some(e) = error {
            obj["reason"] = json!(reason_name(e));
            obj["error"] = json!(e.to_string());
        }
        println!("{obj}");
        return;
    }
    println!("> {line}");
    for msg in console {
        println!("{msg}");
    }
    if let Some(e) = error {
        println!("!! {}", humanize(e));
    }
}

/// `scanner run`: feed each line to the dispatcher and echo the console.
pub fn run(cfg: &Config, opts: &RunOpts, stop: &AtomicBool) -> Result<()> {
    let script = match &opts.script {
        Some(path) => fs::read_to_string(path)
            .wrap_err_with(|| format!("read script {}", path.display()))?,
        None => String::new(),
    };
    let lines: Vec<&str> = script_lines(&script)
        .chain(opts.commands.iter().map(|c| c.trim()))
        .collect();
    if lines.is_empty() {
        eyre::bail!("no commands given: pass --script FILE or -c LINE");
    }

    let sim = printer_for(cfg, opts.seed);
    if !opts.no_home {
        sim.home_xy();
    }
    let mut scanner = scanner_for(cfg, &sim, opts.seed, opts.stream_dir.as_deref())?;
    tracing::info!(commands = lines.len(), "session started");

    let mut first_error = None;
    for line in lines {
        if stop.load(Ordering::Relaxed) {
            tracing::warn!("interrupted, skipping remaining commands");
            break;
        }
        let result = scanner.run_line(line);
        let console = sim.take_console();
        emit(line, &console, result.as_ref().err());
        if let Err(e) = result {
            if !opts.keep_going {
                return Err(e);
            }
            first_error.get_or_insert(e);
        }
    }

    let pending = sim.pending();
    if !pending.is_empty() && !json_mode() {
        println!("SAVE_CONFIG pending changes:");
        print!("{}", pending.render());
    }
    if let Some(mesh) = sim.mesh() {
        tracing::info!(x = mesh.x_count, y = mesh.y_count, "mesh applied");
    }
    first_error.map_or(Ok(()), Err)
}

/// `scanner self-check`: build against the simulator and take one reading.
pub fn self_check(cfg: &Config) -> Result<()> {
    let sim = printer_for(cfg, 1);
    let mut scanner = scanner_for(cfg, &sim, 1, None)?;
    let reading = scanner.query_status()?;
    let model = scanner.status().model;
    if json_mode() {
        println!("{}", json!({ "ok": true, "reading": reading, "model": model }));
    } else {
        println!(
            "OK: {} freq={} model={}",
            scanner.sensor().name(),
            reading["freq"],
            model.as_deref().unwrap_or("none")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# header\nCARTOGRAPHER_QUERY ; inline\n\n  PROBE SAMPLES=2\n;all comment\n";
        let lines: Vec<&str> = script_lines(text).collect();
        assert_eq!(lines, vec!["CARTOGRAPHER_QUERY", "PROBE SAMPLES=2"]);
    }
}
