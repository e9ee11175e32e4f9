use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::channel::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    /// Pending connections the listener accepts before refusing.
    pub backlog: u32,
    pub registry_path: PathBuf,
    pub activity_log_path: PathBuf,
    /// Root that InstallModule file names are resolved against.
    pub module_dir: PathBuf,
    /// Ends an idle controller/endpoint relay. Unset means wait forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_idle_timeout_secs: Option<u64>,
    pub max_frame_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2016)),
            bind_ip: None,
            backlog: 10,
            registry_path: "clients.json".into(),
            activity_log_path: "tether.log".into(),
            module_dir: ".".into(),
            relay_idle_timeout_secs: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("tether.toml"))
                .merge(Json::file("tether.json"))
                .merge(Env::prefixed("TETHER_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // If bind_ip is set, override the IP part of bind_addr
        if let Some(ref ip) = config.bind_ip {
            let port = config.bind_addr.port();
            config.bind_addr = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        Ok(config)
    }

    pub fn relay_idle_timeout(&self) -> Option<Duration> {
        self.relay_idle_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 2016);
        assert_eq!(config.backlog, 10);
        assert_eq!(config.registry_path, PathBuf::from("clients.json"));
        assert!(config.relay_idle_timeout().is_none());
    }

    #[test]
    fn test_layers_and_bind_ip() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tether.toml",
                r#"
                bind_addr = "127.0.0.1:4000"
                module_dir = "modules"
                relay_idle_timeout_secs = 30
                "#,
            )?;
            jail.set_env("TETHER_BIND_IP", "10.0.0.5");
            jail.set_env("TETHER_BACKLOG", "32");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.bind_addr, "10.0.0.5:4000".parse().unwrap());
            assert_eq!(config.backlog, 32);
            assert_eq!(config.module_dir, PathBuf::from("modules"));
            assert_eq!(config.relay_idle_timeout(), Some(Duration::from_secs(30)));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_bind_ip() {
        Jail::expect_with(|jail| {
            jail.set_env("TETHER_BIND_IP", "not-an-ip");
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
