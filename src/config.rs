//! Process configuration, read from a TOML file next to the executable.
//!
//! A missing file is written out with documented defaults and the process
//! exits so the operator can edit it and restart. Missing or invalid keys
//! are fatal at startup, reported with the offending key name.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use once_cell::sync::Lazy;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "gateproxy.toml";

/// Written verbatim when no config file exists yet.
pub const DEFAULT_CONFIG: &str = "\
# Where the real gateway server lives.
gateway_host = \"gwgt1.joymax.com\"
gateway_port = 15779

# Local binds. Point the game client at client_bind and the bot at
# observer_bind, both on 127.0.0.1.
listen_ip = \"0.0.0.0\"
client_bind = 19000
observer_bind = 19002

# Maximum bytes accepted per socket read.
max_read = 16384
";

/// Directory holding the running executable, resolved once. Falls back
/// to the working directory when the path cannot be determined.
static EXECUTABLE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
});

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Gateway server hostname or literal address.
    pub gateway_host: String,
    pub gateway_port: u16,
    /// Address to listen on; `0.0.0.0` means every interface.
    pub listen_ip: String,
    /// Local bind port for the game client.
    pub client_bind: u16,
    /// Local bind port for observer (bot) connections.
    pub observer_bind: u16,
    /// Maximum bytes accepted per socket read.
    pub max_read: usize,
}

impl Config {
    pub fn client_listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.client_bind)
    }

    pub fn observer_listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.observer_bind)
    }
}

/// Loads the config, or creates a default one and asks for a restart.
pub fn load_or_create() -> anyhow::Result<Config> {
    let path = EXECUTABLE_DIR.join(CONFIG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text)
            .with_context(|| format!("invalid config file at {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("failed to create {}", path.display()))?;
            anyhow::bail!(
                "no config file found; a default one was written to {}. \
                 Edit it and restart.",
                path.display()
            )
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.gateway_host, "gwgt1.joymax.com");
        assert_eq!(config.gateway_port, 15779);
        assert_eq!(config.listen_ip, "0.0.0.0");
        assert_eq!(config.client_bind, 19000);
        assert_eq!(config.observer_bind, 19002);
        assert_eq!(config.max_read, 16384);
        assert_eq!(config.client_listen_addr(), "0.0.0.0:19000");
        assert_eq!(config.observer_listen_addr(), "0.0.0.0:19002");
    }

    #[test]
    fn missing_key_names_the_key() {
        let err = toml::from_str::<Config>("gateway_host = \"example.com\"").unwrap_err();
        assert!(err.to_string().contains("gateway_port"));
    }
}
