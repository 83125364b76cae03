//! libgateway reconciles the upstream definitions announced by backend units against the
//! on-disk configuration of an nginx gateway.
//!
//! Each reconciliation cycle follows the same path:
//!
//! ```text
//! event -> Gateway -> DescriptorStore (did anything change?)
//!       -> ModuleLayout::clear -> materialize_* -> ModuleLayout::enable_all
//!       -> ProxyControl::commit (validate, then reload) -> Status
//! ```
//!
//! The configuration directories are the system of record for what the proxy serves; the
//! change-detection baseline only lives as long as the process.
use std::path::PathBuf;

pub mod config;
pub mod descriptor;
pub mod gateway;
pub mod layout;
pub mod materialize;
pub mod proxy;
pub mod store;
pub mod template;
mod util;

pub use config::GatewayConfig;
pub use descriptor::{DesiredState, UpstreamDescriptor, UpstreamFeed};
pub use error::Error;
pub use gateway::{Event, Gateway, GatewayState, Notifier, Status};
pub use layout::{ConfigModule, GatewayLayout, ModuleLayout, SingletonFile};
pub use proxy::{NginxController, ProxyControl};
pub use store::DescriptorStore;
pub use template::TemplateRenderer;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Failed to apply proxy configuration: {}", source))]
        Commit { source: crate::proxy::Error },

        #[snafu(display(
            "Failed to create directory '{}': {}",
            directory.to_string_lossy(), source
        ))]
        CreateDirectory {
            source: std::io::Error,
            directory: PathBuf,
        },

        #[snafu(display("Failed to determine the working directory: {}", source))]
        CurrentDirectory { source: std::io::Error },

        #[snafu(display(
            "Failed to link '{}' to '{}': {}",
            link.to_string_lossy(), target.to_string_lossy(), source
        ))]
        CreateLink {
            source: std::io::Error,
            link: PathBuf,
            target: PathBuf,
        },

        #[snafu(display("Refusing to use '{}' as a configuration file name", filename))]
        InvalidFilename { filename: String },

        #[snafu(display(
            "Failed to parse gateway config '{}': {}",
            filepath.to_string_lossy(), source
        ))]
        ParseConfig {
            source: toml::de::Error,
            filepath: PathBuf,
        },

        #[snafu(display(
            "Failed to read from file '{}': {}",
            filepath.to_string_lossy(), source
        ))]
        ReadFile {
            source: std::io::Error,
            filepath: PathBuf,
        },

        #[snafu(display(
            "Failed to read file metadata '{}': {}",
            filepath.to_string_lossy(), source
        ))]
        ReadFileMetadata {
            source: std::io::Error,
            filepath: PathBuf,
        },

        #[snafu(display(
            "Failed to read link '{}': {}",
            filepath.to_string_lossy(), source
        ))]
        ReadLink {
            source: std::io::Error,
            filepath: PathBuf,
        },

        #[snafu(display("Failed to register template '{}': {}", name, source))]
        RegisterTemplate {
            #[snafu(source(from(handlebars::TemplateError, Box::new)))]
            source: Box<handlebars::TemplateError>,
            name: String,
        },

        #[snafu(display(
            "Failed to remove file '{}': {}",
            filepath.to_string_lossy(), source
        ))]
        RemoveFile {
            source: std::io::Error,
            filepath: PathBuf,
        },

        #[snafu(display("Failed to render template '{}': {}", name, source))]
        RenderTemplate {
            #[snafu(source(from(handlebars::RenderError, Box::new)))]
            source: Box<handlebars::RenderError>,
            name: String,
        },

        #[snafu(display(
            "Failed to read from directory '{}': {}",
            directory.to_string_lossy(), source
        ))]
        TraverseDirectory {
            source: std::io::Error,
            directory: PathBuf,
        },

        #[snafu(display(
            "Failed to write file '{}': {}",
            filepath.to_string_lossy(), source
        ))]
        WriteFile {
            source: std::io::Error,
            filepath: PathBuf,
        },
    }
}

pub type Result<T> = std::result::Result<T, error::Error>;

/// Joins a configuration file name onto a directory, refusing names that would escape it or
/// collide with the temporary files used while writing.
pub(crate) fn config_path<P: Into<PathBuf>>(dir: P, filename: &str) -> Result<PathBuf> {
    snafu::ensure!(
        is_valid_filename(filename),
        error::InvalidFilenameSnafu { filename }
    );
    Ok(dir.into().join(filename))
}

pub(crate) fn is_valid_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.starts_with('.')
        && !filename.contains('/')
        && !filename.contains('\0')
}
