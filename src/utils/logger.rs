use log::LevelFilter;

/// Initializes `env_logger`; `RUST_LOG` still overrides the default level.
pub fn setup_logger(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}
