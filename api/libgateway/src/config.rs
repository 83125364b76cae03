//! The gateway's own configuration file.
//!
//! Every field has a default matching a stock nginx install, so an empty file (or no file at
//! all) gives a working gateway for the sites module.
use crate::layout::{GatewayLayout, ModuleLayout, SingletonFile};
use crate::proxy::NginxController;
use crate::{error, Result};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct GatewayConfig {
    /// The port the gateway listens on, advertised to website relations.
    pub port: u16,
    /// The inbound port published once both an upstream and a website relation are present.
    pub publish_port: u16,
    /// Whether the catch-all exact-server-names site is installed.
    pub exact_server_names: bool,
    /// Whether the streams module is managed.
    pub streams: bool,
    pub paths: PathsConfig,
    pub nginx: NginxConfig,
    pub templates: TemplatesConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 80,
            publish_port: 80,
            exact_server_names: false,
            streams: false,
            paths: PathsConfig::default(),
            nginx: NginxConfig::default(),
            templates: TemplatesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct PathsConfig {
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
    pub streams_available: PathBuf,
    pub streams_enabled: PathBuf,
    pub exact_server_names_available: PathBuf,
    pub exact_server_names_enabled: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sites_available: "/etc/nginx/sites-available/juju".into(),
            sites_enabled: "/etc/nginx/sites-enabled".into(),
            streams_available: "/etc/nginx/streams-available/juju".into(),
            streams_enabled: "/etc/nginx/streams-enabled".into(),
            exact_server_names_available: "/etc/nginx/sites-available/__exact-server-names"
                .into(),
            exact_server_names_enabled: "/etc/nginx/sites-enabled/__exact-server-names".into(),
        }
    }
}

impl PathsConfig {
    /// Every path under `root`, laid out like a stock nginx install.  Handy for tests and for
    /// running against a scratch tree.
    pub fn under<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            sites_available: root.join("sites-available/juju"),
            sites_enabled: root.join("sites-enabled"),
            streams_available: root.join("streams-available/juju"),
            streams_enabled: root.join("streams-enabled"),
            exact_server_names_available: root.join("sites-available/__exact-server-names"),
            exact_server_names_enabled: root.join("sites-enabled/__exact-server-names"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct NginxConfig {
    pub binary: PathBuf,
    pub validate_args: Vec<String>,
    pub reload_args: Vec<String>,
    /// Upper bound for each nginx command; unset means wait as long as it takes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            binary: crate::proxy::DEFAULT_BINARY.into(),
            validate_args: vec!["-t".to_string()],
            reload_args: vec!["-s".to_string(), "reload".to_string()],
            command_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct TemplatesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact_server_names: Option<PathBuf>,
}

impl GatewayConfig {
    pub async fn from_file<P: AsRef<Path>>(filepath: P) -> Result<Self> {
        let filepath = filepath.as_ref();
        let contents = fs::read_to_string(filepath)
            .await
            .context(error::ReadFileSnafu { filepath })?;
        toml::de::from_str(&contents).context(error::ParseConfigSnafu { filepath })
    }

    pub fn layout(&self) -> GatewayLayout {
        let paths = &self.paths;
        GatewayLayout {
            sites: ModuleLayout::new(&paths.sites_available, &paths.sites_enabled),
            streams: self
                .streams
                .then(|| ModuleLayout::new(&paths.streams_available, &paths.streams_enabled)),
            exact_server_names: SingletonFile::new(
                &paths.exact_server_names_available,
                &paths.exact_server_names_enabled,
            ),
        }
    }

    pub fn controller(&self) -> NginxController {
        NginxController::new(&self.nginx.binary)
            .with_validate_args(self.nginx.validate_args.iter().cloned())
            .with_reload_args(self.nginx.reload_args.iter().cloned())
            .with_timeout(self.nginx.command_timeout_secs.map(Duration::from_secs))
    }
}
