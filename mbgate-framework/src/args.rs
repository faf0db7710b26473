//! CLI argument parsing for the gateway.

use std::path::PathBuf;

use clap::Parser;

/// Default configuration path.
pub const DEFAULT_CONFIG: &str = "/usr/local/etc/mb_mqttbridge.json";

/// Command line arguments of a gateway binary.
#[derive(Parser, Debug, Clone)]
#[command(about = "Modbus to MQTT gateway")]
pub struct GatewayArgs {
    /// Path to configuration file (JSON or JSON5).
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Stay in the foreground with debug logging.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Write the process id to this file.
    #[arg(short = 'p', long = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl GatewayArgs {
    /// Parse CLI arguments from the process environment.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Effective log level override: an explicit `--log-level` wins, `-d`
    /// implies `debug`.
    pub fn log_level_override(&self) -> Option<String> {
        self.log_level
            .clone()
            .or_else(|| self.debug.then(|| "debug".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = GatewayArgs::try_parse_from(["mqtt-bridge-modbus"]).unwrap();
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
        assert!(!args.debug);
        assert!(args.pidfile.is_none());
        assert_eq!(args.log_level_override(), None);
    }

    #[test]
    fn test_args_short_flags() {
        let args = GatewayArgs::try_parse_from([
            "mqtt-bridge-modbus",
            "-c",
            "gw.json5",
            "-d",
            "-p",
            "/var/run/gw.pid",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("gw.json5"));
        assert!(args.debug);
        assert_eq!(args.pidfile, Some(PathBuf::from("/var/run/gw.pid")));
        assert_eq!(args.log_level_override().as_deref(), Some("debug"));
    }

    #[test]
    fn test_explicit_log_level_wins() {
        let args =
            GatewayArgs::try_parse_from(["mqtt-bridge-modbus", "-d", "--log-level", "trace"])
                .unwrap();
        assert_eq!(args.log_level_override().as_deref(), Some("trace"));
    }
}
