//! Thin `tracing`-based logging facade, mirroring the `ckb-logger`/
//! `ckb-logger-service` split: a typed `LoggerConfig` feeds one `init` call
//! that installs a process-wide subscriber, and every component crate logs
//! through the `tracing` macros rather than `println!`.

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// `EnvFilter` directive string, e.g. `"cc_node=debug,cc_network=info"`.
    /// Falls back to `"info"` when empty.
    pub filter: String,
    pub with_target: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig { filter: "info".into(), with_target: true }
    }
}

/// Installs the global `tracing` subscriber. Idempotent: a second call
/// (e.g. from a second test in the same process) is a harmless no-op
/// rather than a panic, since `tracing`'s global dispatcher can only be set
/// once per process.
pub fn init(config: LoggerConfig) {
    let filter = if config.filter.is_empty() {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = fmt().with_env_filter(filter).with_target(config.with_target).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_safe_to_call_more_than_once() {
        init(LoggerConfig::default());
        init(LoggerConfig { filter: "debug".into(), with_target: false });
    }
}
