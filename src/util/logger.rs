use log::SetLoggerError;

/// Attempt to init an env_logger for txcore.
/// Does nothing if the "builtin_env_logger" feature is disabled.
///
/// The filter defaults to `info` and can be overridden with `RUST_LOG`. Records carry
/// microsecond timestamps so that interleavings of maintenance passes can be read back.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::Builder::from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
            .format_timestamp_micros()
            .is_test(cfg!(test))
            .try_init()
        } else {
            Ok(())
        }
    }
}

/// Initialize the logger once per process. A logger installed by the embedder takes precedence.
pub(crate) fn init() {
    match try_init() {
        Ok(_) => debug!("txcore initialized the logger."),
        Err(_) => debug!(
            "txcore failed to initialize the logger. Possibly a logger has been initialized by user."
        ),
    }
}
