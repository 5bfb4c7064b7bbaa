use camino::Utf8PathBuf;
use config::{Config, File};
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Cfg {
    #[serde(default)]
    pub agent: CfgAgent,
    pub peers: CfgPeers,
    #[serde(default)]
    pub log: CfgLog,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgAgent {
    /// Unprivileged account the worker switches to.
    pub user: String,
    /// Used when `user` does not exist.
    pub fallback_user: String,
}

impl Default for CfgAgent {
    fn default() -> Self {
        CfgAgent {
            user: "_smtpmfa".to_string(),
            fallback_user: "_smtpd".to_string(),
        }
    }
}

/// Unix sockets of the collaborating processes.
#[derive(Debug, Deserialize, Clone)]
pub struct CfgPeers {
    pub parent: Utf8PathBuf,
    pub smtp: Utf8PathBuf,
    pub lookup: Utf8PathBuf,
    pub control: Utf8PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgLog {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_level() -> String {
    "info".to_string()
}

impl Cfg {
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .build()
            .into_diagnostic()?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
[agent]
user = "_filter"
fallback_user = "nobody"

[peers]
parent = "/var/run/smtpd/parent.sock"
smtp = "/var/run/smtpd/smtp.sock"
lookup = "/var/run/smtpd/lookup.sock"
control = "/var/run/smtpd/control.sock"

[log]
level = "debug"
format = "json"
"#,
        );

        let cfg = Cfg::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.agent.user, "_filter");
        assert_eq!(cfg.agent.fallback_user, "nobody");
        assert_eq!(cfg.peers.lookup, "/var/run/smtpd/lookup.sock");
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.log.format, LogFormat::Json);
    }

    #[test]
    fn test_defaults() {
        let file = write_config(
            r#"
[peers]
parent = "parent.sock"
smtp = "smtp.sock"
lookup = "lookup.sock"
control = "control.sock"
"#,
        );

        let cfg = Cfg::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.agent.user, "_smtpmfa");
        assert_eq!(cfg.agent.fallback_user, "_smtpd");
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.log.format, LogFormat::Text);
    }

    #[test]
    fn test_missing_peers() {
        let file = write_config("[log]\nlevel = \"warn\"\n");
        assert!(Cfg::load(file.path().to_str().unwrap()).is_err());
    }
}
