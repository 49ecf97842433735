//! Global CLI options and config resolution.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use printsync_agent::AgentConfig;

/// Global options; each can also be set through the environment.
#[derive(Args, Debug, Clone)]
pub struct AgentOpts {
    /// Agent config file (env: PRINTSYNC_CONFIG)
    #[arg(short = 'c', long, global = true, env = "PRINTSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Device auth token (env: PRINTSYNC_TOKEN)
    #[arg(long, global = true, env = "PRINTSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Moonraker base URL (env: PRINTSYNC_PRINTER_URL)
    #[arg(long, global = true, env = "PRINTSYNC_PRINTER_URL")]
    pub printer_url: Option<String>,

    /// Cloud REST base URL (env: PRINTSYNC_CLOUD_URL)
    #[arg(long, global = true, env = "PRINTSYNC_CLOUD_URL")]
    pub cloud_url: Option<String>,
}

impl AgentOpts {
    /// Load the config file (defaults when none is given) and apply flag overrides.
    pub fn load_config(&self) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => AgentConfig::default(),
        };
        if let Some(token) = &self.token {
            config.cloud.auth_token = token.clone();
        }
        if let Some(url) = &self.printer_url {
            config.printer.url = url.clone();
        }
        if let Some(url) = &self.cloud_url {
            config.cloud.url = url.clone();
        }
        Ok(config.expand_paths())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn opts(config: Option<PathBuf>) -> AgentOpts {
        AgentOpts {
            config,
            token: None,
            printer_url: None,
            cloud_url: None,
        }
    }

    #[test]
    fn flags_override_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[cloud]\nurl = \"https://cloud.example.com/\"\nauth_token = \"from-file\"\n\n[printer]\nurl = \"http://printer.local:7125\""
        )
        .unwrap();

        let mut opts = opts(Some(file.path().to_path_buf()));
        let config = opts.load_config().unwrap();
        assert_eq!(config.cloud.auth_token, "from-file");
        assert_eq!(config.printer.url, "http://printer.local:7125");

        opts.token = Some("from-flag".into());
        opts.cloud_url = Some("https://staging.example.com/".into());
        let config = opts.load_config().unwrap();
        assert_eq!(config.cloud.auth_token, "from-flag");
        assert_eq!(config.cloud.url, "https://staging.example.com/");
        assert_eq!(config.printer.url, "http://printer.local:7125");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let opts = opts(Some(PathBuf::from("/nonexistent/printsync.toml")));
        assert!(opts.load_config().is_err());
    }

    #[test]
    fn no_config_file_uses_defaults() {
        let config = opts(None).load_config().unwrap();
        assert!(config.cloud.auth_token.is_empty());
        assert_eq!(config.printer.url, "http://127.0.0.1:7125");
    }
}
