use std::path::Path;

/// Initialize logging, writing to a log file in the data dir when
/// possible. If the file cannot be opened (permissions, readonly FS),
/// fall back to stderr.
pub fn init(log_file: &Path) {
    use env_logger::Target;
    use std::fs;
    use std::io;

    let target = (|| -> io::Result<Target> {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        Ok(Target::Pipe(Box::new(file)))
    })()
    .unwrap_or(Target::Stderr);

    env_logger::Builder::from_default_env()
        .target(target)
        .filter_level(log::LevelFilter::Info)
        .init();
}

/// Plain stderr logging for the worker subprocess, whose stdout is a
/// JSON protocol stream that must stay clean.
pub fn init_stderr() {
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stderr)
        .filter_level(log::LevelFilter::Info)
        .init();
}
