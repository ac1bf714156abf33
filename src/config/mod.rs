pub mod columns;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{TdeError, TdeResult};
use crate::protocol::decoder::DEFAULT_MAX_MESSAGE_SIZE;

pub use columns::{
    BlindIndexSettings, ColumnConfig, ColumnDefinition, EncryptionConfig, EncryptionSettings,
    JoinSettings, StaticEncryptionConfig, TableDefinition, DEFAULT_JOIN_KEY_SIZE,
};

/// How the proxy talks to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamSsl {
    #[default]
    Disable,
    Require,
}

/// Everything one proxy instance needs, as read from file, environment and command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub listen: String,
    pub upstream: String,
    /// Rewrite queries and results. When off, the proxy only frames messages.
    pub enable_sql_parsing: bool,
    /// Forward queries the parser rejects so the server reports the error itself.
    pub permissive_parsing: bool,
    /// Answer SSLRequest locally and terminate TLS in the proxy.
    pub terminate_ssl: bool,
    pub upstream_ssl: UpstreamSsl,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub upstream_ca: Option<PathBuf>,
    pub upstream_server_name: Option<String>,
    pub max_message_size: u32,
    pub join_key_size: usize,
    pub tables: Vec<TableDefinition>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:6432".to_string(),
            upstream: "127.0.0.1:5432".to_string(),
            enable_sql_parsing: true,
            permissive_parsing: false,
            terminate_ssl: false,
            upstream_ssl: UpstreamSsl::Disable,
            tls_cert: None,
            tls_key: None,
            upstream_ca: None,
            upstream_server_name: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            join_key_size: DEFAULT_JOIN_KEY_SIZE,
            tables: Vec::new(),
        }
    }
}

impl ProxySettings {
    /// Layers the optional configuration file and `PGTDE_*` environment variables over the
    /// defaults. Nested keys use `__`, e.g. `PGTDE_UPSTREAM_SSL=require`.
    pub fn load(path: Option<&Path>) -> TdeResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PGTDE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: ProxySettings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TdeError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> TdeResult<()> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(TdeError::Config(
                "tls_cert and tls_key must be configured together".to_string(),
            ));
        }
        if self.max_message_size < 5 {
            return Err(TdeError::Config(format!(
                "max_message_size {} is too small",
                self.max_message_size
            )));
        }
        Ok(())
    }

    pub fn encryption_config(&self) -> TdeResult<StaticEncryptionConfig> {
        StaticEncryptionConfig::from_definitions(&self.tables, self.join_key_size)
    }

    /// Host name presented to the server during the upstream TLS handshake.
    pub fn upstream_host(&self) -> String {
        if let Some(name) = &self.upstream_server_name {
            return name.clone();
        }
        match self.upstream.rsplit_once(':') {
            Some((host, _)) => host.trim_matches(['[', ']']).to_string(),
            None => self.upstream.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ProxySettings::default();
        assert!(settings.enable_sql_parsing);
        assert_eq!(settings.upstream_ssl, UpstreamSsl::Disable);
        assert_eq!(settings.upstream_host(), "127.0.0.1");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_cert_without_key_is_invalid() {
        let settings = ProxySettings {
            tls_cert: Some(PathBuf::from("server.crt")),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_explicit_server_name_wins() {
        let settings = ProxySettings {
            upstream: "[::1]:5432".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.upstream_host(), "::1");

        let settings = ProxySettings {
            upstream_server_name: Some("db.internal".to_string()),
            ..settings
        };
        assert_eq!(settings.upstream_host(), "db.internal");
    }
}
