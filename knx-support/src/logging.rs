//! Terminal logging bootstrap for binaries and examples. Library code never
//! initializes a global logger itself; it only emits through the `log`
//! facade and leaves the choice of sink to the process that embeds it.

/// Installs a line-oriented terminal logger at `debug` level, honoring
/// `RUST_LOG` if set. Idempotent: a second call is a no-op.
pub fn init_default() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format_timestamp_millis()
        .try_init();
}
