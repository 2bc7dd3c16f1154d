//! tracing setup for the binary.
//!
//! Filter precedence: `log` from the config file, then `RUST_LOG`, then the
//! level picked by `-v`/`-q` (info by default, which shows every request).

use std::io::IsTerminal;

use anyhow::anyhow;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub filter: Option<String>,
}

impl LogConfig {
    pub fn from_flags(verbose: u8, quiet: bool, filter: Option<&str>) -> Self {
        let level = match (quiet, verbose) {
            (true, _) => Level::WARN,
            (false, 0) => Level::INFO,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        };
        Self {
            level,
            filter: filter.map(str::to_string),
        }
    }

    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        if let Some(directive) = &self.filter {
            return EnvFilter::try_new(directive)
                .map_err(|e| anyhow!("invalid log filter '{}': {}", directive, e));
        }
        Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string().to_lowercase())))
    }
}

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    fmt()
        .with_env_filter(config.env_filter()?)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("logging setup failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pick_the_level() {
        assert_eq!(LogConfig::from_flags(0, false, None).level, Level::INFO);
        assert_eq!(LogConfig::from_flags(1, false, None).level, Level::DEBUG);
        assert_eq!(LogConfig::from_flags(4, false, None).level, Level::TRACE);
        assert_eq!(LogConfig::from_flags(0, true, None).level, Level::WARN);
    }

    #[test]
    fn config_filter_must_parse() {
        let bad = LogConfig::from_flags(0, false, Some("mailbox=notalevel"));
        assert!(bad.env_filter().is_err());
        let good = LogConfig::from_flags(0, false, Some("mailbox=debug"));
        assert!(good.env_filter().is_ok());
    }
}
