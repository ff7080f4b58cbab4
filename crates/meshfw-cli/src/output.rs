//! Output formatting for CLI responses

use std::path::Path;

use anyhow::Error;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    let error_json = json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "code": crate::error::exit_code(error),
        }
    });
    match serde_json::to_string_pretty(&error_json) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format error as JSON: {e}"),
    }
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

/// Print a JSON success payload
pub fn print_json(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Report a firmware file written to `out`
pub fn print_saved(action: &str, out: &Path, bytes: u64, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(json!({
            "success": true,
            "action": action,
            "path": out.display().to_string(),
            "bytes": bytes,
        }));
    }
    println!(
        "{} {} ({} bytes)",
        "✓".green(),
        out.display().to_string().bold(),
        bytes
    );
    Ok(())
}

/// Report whether a URL answered a HEAD probe
pub fn print_probe(url: &str, exists: bool, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(json!({
            "success": true,
            "url": url,
            "exists": exists,
        }));
    }
    if exists {
        println!("{} {}", "✓".green(), url);
    } else {
        println!("{} {} {}", "✗".red(), url, "(not found)".dimmed());
    }
    Ok(())
}

/// Download bar driven by fractional progress; hidden in JSON mode
pub fn download_bar(json: bool, message: &str) -> anyhow::Result<ProgressBar> {
    if json {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
        .progress_chars("#>-");
    bar.set_style(style);
    bar.set_message(message.to_string());
    Ok(bar)
}

/// Map a `0.0..=1.0` fraction onto the bar's percent scale
pub fn fraction_to_percent(fraction: f32) -> u64 {
    let clamped = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    (clamped * 100.0).round() as u64
}
