use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Which registry agents reconciliation talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterMode {
    /// One statically configured agent.
    Single,
    /// One agent per node matching the node selector.
    Node,
    /// One agent per pod matching the pod selector, reached on its host IP.
    Pod,
}

/// Which resource kind drives reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterSource {
    Service,
    Endpoint,
    Pod,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ConsulConfig {
    pub address: String,
    pub port: u16,
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: 8500,
            scheme: "http".into(),
            token: None,
            timeout_secs: 2,
        }
    }
}

impl std::fmt::Debug for ConsulConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ConsulConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Namespace to watch services in; all namespaces when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub register_mode: RegisterMode,
    pub register_source: RegisterSource,
    /// Ownership tag stamped on every registered entry.
    pub k8s_tag: String,
    pub node_selector: String,
    pub pod_selector: String,
    pub consul: ConsulConfig,
    pub sync_interval_secs: u64,
    pub clean_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            register_mode: RegisterMode::Single,
            register_source: RegisterSource::Service,
            k8s_tag: "kubernetes".into(),
            node_selector: "consul=enabled".into(),
            pod_selector: "app=consul".into(),
            consul: ConsulConfig::default(),
            sync_interval_secs: 120,
            clean_interval_secs: 1800,
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("kube-consul-register.toml"))
            .merge(Json::file("kube-consul-register.json"))
            .merge(Env::prefixed("KCR_").split("__"))
    }

    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| Error::config(format!("failed to load configuration: {e}")))?;

        // Support mounted secrets for the ACL token
        if let Ok(token_file) = std::env::var("KCR_CONSUL_TOKEN_FILE") {
            let token = std::fs::read_to_string(&token_file)
                .map_err(|e| Error::config(format!("can't read {token_file}: {e}")))?;
            config.consul.token = Some(token.trim().to_string());
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 || self.clean_interval_secs == 0 {
            return Err(Error::config("sync and clean intervals must be non-zero"));
        }
        if !matches!(self.consul.scheme.as_str(), "http" | "https") {
            return Err(Error::config(format!(
                "unsupported consul scheme {:?}",
                self.consul.scheme
            )));
        }
        if self.k8s_tag.is_empty() {
            return Err(Error::config("k8s_tag must not be empty"));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }

    /// Selector applied when listing nodes for target addresses; only
    /// honored in node mode.
    pub fn target_node_selector(&self) -> Option<&str> {
        match self.register_mode {
            RegisterMode::Node => Some(self.node_selector.as_str()),
            RegisterMode::Single | RegisterMode::Pod => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_target_single_local_agent() {
        let cfg = Config::default();
        assert_eq!(cfg.register_mode, RegisterMode::Single);
        assert_eq!(cfg.register_source, RegisterSource::Service);
        assert_eq!(cfg.consul.address, "127.0.0.1");
        assert_eq!(cfg.consul.port, 8500);
        assert_eq!(cfg.target_node_selector(), None);
    }

    #[test]
    fn debug_output_hides_token() {
        let mut cfg = Config::default();
        cfg.consul.token = Some("s3cr3t-acl".into());

        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("s3cr3t-acl"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn file_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "kube-consul-register.toml",
                r#"
                    register_mode = "node"
                    k8s_tag = "k8s"
                    [consul]
                    port = 8501
                    scheme = "https"
                "#,
            )?;
            jail.set_env("KCR_NAMESPACE", "apps");
            jail.set_env("KCR_CONSUL__ADDRESS", "consul.local");

            let cfg = Config::from_figment(Config::figment()).expect("config loads");
            assert_eq!(cfg.register_mode, RegisterMode::Node);
            assert_eq!(cfg.k8s_tag, "k8s");
            assert_eq!(cfg.namespace.as_deref(), Some("apps"));
            assert_eq!(cfg.consul.address, "consul.local");
            assert_eq!(cfg.consul.port, 8501);
            assert_eq!(cfg.consul.scheme, "https");
            assert_eq!(cfg.target_node_selector(), Some("consul=enabled"));
            Ok(())
        });
    }

    #[test]
    fn zero_interval_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("KCR_SYNC_INTERVAL_SECS", "0");
            let err = Config::from_figment(Config::figment()).unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            Ok(())
        });
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("KCR_CONSUL__SCHEME", "ftp");
            assert!(Config::from_figment(Config::figment()).is_err());
            Ok(())
        });
    }
}
