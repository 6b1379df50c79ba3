use nomi_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter directives from the config, with `--verbose` forcing debug.
/// `RUST_LOG` still wins when set.
pub fn filter_directives(logging: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level)
        .chain(logging.filters.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn init(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let directives = filter_directives(logging, verbose);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let json = logging.format == "json";
    let stdout = logging.output == "stdout";
    let result = match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, false) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, true) => builder.with_writer(std::io::stdout).try_init(),
        (false, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}
