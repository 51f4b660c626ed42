#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config =
        toml::from_str(&txt).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

    cfg.validate()?;

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Transports;
    use std::io::Write;

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp,
            r#"
local_name = "lab-node"
tcp_port = 9354
transports = ["tcp", "udp", "appletalk"]

[telemetry]
level = "warn"
sinks = ["console", "callback"]
"#
        )
        .unwrap();

        let cfg = load_from_path(tmp.path()).unwrap();
        assert_eq!(cfg.local_name, "lab-node");
        assert_eq!(cfg.tcp_port, 9354);
        assert_eq!(cfg.discovery_port, 7353, "untouched fields keep defaults");
        assert!(cfg.transports.contains(Transports::APPLETALK));
        assert_eq!(cfg.telemetry.level, crate::telemetry::LogLevel::Warn);
    }

    #[test]
    fn invalid_values_are_refused() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "queue_capacity = 40").unwrap();
        assert!(load_from_path(tmp.path()).is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            load_from_path("/definitely/not/here.toml"),
            Err(Error::Config(_))
        ));
    }
}
