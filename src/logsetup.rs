// Logging setup and secret masking.

use std::path::Path;

use log::LevelFilter;

/// Partially mask a sensitive value: first/last 4 chars visible, rest
/// elided. Short values are fully masked. Counts chars, not bytes, so
/// multibyte input never splits a character.
pub fn mask_sensitive(input: &str) -> String {
    let count = input.chars().count();
    if count <= 8 {
        return "***".to_string();
    }
    let start: String = input.chars().take(4).collect();
    let end: String = input.chars().skip(count - 4).collect();
    format!("{}...{}", start, end)
}

/// Wire up fern: human-readable lines to stderr, everything to
/// `<log_dir>/install.log`. Level comes from MATRIX_INSTALLER_LOG
/// (off/error/warn/info/debug/trace), defaulting to info.
pub fn init_logging(log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let log_file = log_dir.join("install.log");

    let level = match std::env::var("MATRIX_INSTALLER_LOG")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // reqwest/hyper are chatty at debug; keep them at info
        .level_for("hyper", LevelFilter::Info)
        .level_for("reqwest", LevelFilter::Info)
        .chain(std::io::stderr())
        .chain(fern::log_file(log_file)?)
        .apply()?;

    Ok(())
}
