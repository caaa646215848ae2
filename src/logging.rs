//! Logging setup for the fan control daemon

use std::path::Path;

use fern::Dispatch;
use log::LevelFilter;

/// Setup logging with the specified verbosity level.
///
/// Logs always go to stdout; when `log_file` is given, the same records are
/// appended to that file as well.
pub fn setup(verbosity: u8, log_file: Option<&Path>) -> Result<(), fern::InitError> {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut dispatch = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;

    Ok(())
}
