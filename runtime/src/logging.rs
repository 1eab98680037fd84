/// Creates the process logger.
///
/// Logs go to stderr. Level is Debug in development builds and Info in
/// production builds; `RUST_LOG` overrides both.
pub fn builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(if cfg!(debug_assertions) {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Info)
        .parse_default_env();
    builder
}

/// Install the process logger. Safe to call more than once.
pub fn init() {
    if builder().try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
