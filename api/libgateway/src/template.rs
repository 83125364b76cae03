//! Rendering of the configuration the gateway itself contributes: the server block that gathers
//! every unit's location fragments, and the catch-all used for exact server names.
use crate::{error, Result};
use handlebars::Handlebars;
use serde::Serialize;
use snafu::ResultExt;
use std::path::Path;

pub const SERVER_TEMPLATE: &str = "server";
pub const EXACT_SERVER_NAMES_TEMPLATE: &str = "exact-server-names";

const DEFAULT_SERVER_TEMPLATE: &str = "\
server {
    listen {{port}};
    listen [::]:{{port}};
{{#each locations}}
{{{this}}}
{{/each}}
}
";

const DEFAULT_EXACT_SERVER_NAMES_TEMPLATE: &str = "\
server {
    listen {{port}} default_server;
    listen [::]:{{port}} default_server;
    server_name _;
    return 444;
}
";

#[derive(Debug, Serialize)]
struct ServerContext<'a> {
    port: u16,
    locations: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct ExactServerNamesContext {
    port: u16,
}

/// Holds the two gateway templates, either the built-in defaults or overrides read from disk.
#[derive(Debug)]
pub struct TemplateRenderer {
    registry: Handlebars<'static>,
    port: u16,
}

impl TemplateRenderer {
    /// A renderer using the built-in templates.
    pub fn new(port: u16) -> Result<Self> {
        Self::from_sources(port, DEFAULT_SERVER_TEMPLATE, DEFAULT_EXACT_SERVER_NAMES_TEMPLATE)
    }

    /// A renderer using the given template sources.
    pub fn from_sources(port: u16, server: &str, exact_server_names: &str) -> Result<Self> {
        let mut registry = Handlebars::new();
        // Fragments are nginx configuration, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);

        for (name, source) in [
            (SERVER_TEMPLATE, server),
            (EXACT_SERVER_NAMES_TEMPLATE, exact_server_names),
        ] {
            registry
                .register_template_string(name, source)
                .context(error::RegisterTemplateSnafu { name })?;
        }

        Ok(Self { registry, port })
    }

    /// A renderer using override files where given and the defaults elsewhere.
    pub async fn from_files<P1, P2>(
        port: u16,
        server: Option<P1>,
        exact_server_names: Option<P2>,
    ) -> Result<Self>
    where
        P1: AsRef<Path>,
        P2: AsRef<Path>,
    {
        let server = match server {
            Some(path) => read_template(path).await?,
            None => DEFAULT_SERVER_TEMPLATE.to_string(),
        };
        let exact_server_names = match exact_server_names {
            Some(path) => read_template(path).await?,
            None => DEFAULT_EXACT_SERVER_NAMES_TEMPLATE.to_string(),
        };
        Self::from_sources(port, &server, &exact_server_names)
    }

    /// Renders one server block holding the given location fragments, in order.
    pub fn render_server(&self, locations: &[&str]) -> Result<String> {
        let context = ServerContext {
            port: self.port,
            locations,
        };
        self.registry
            .render(SERVER_TEMPLATE, &context)
            .context(error::RenderTemplateSnafu {
                name: SERVER_TEMPLATE,
            })
    }

    pub fn render_exact_server_names(&self) -> Result<String> {
        self.registry
            .render(
                EXACT_SERVER_NAMES_TEMPLATE,
                &ExactServerNamesContext { port: self.port },
            )
            .context(error::RenderTemplateSnafu {
                name: EXACT_SERVER_NAMES_TEMPLATE,
            })
    }
}

async fn read_template<P: AsRef<Path>>(path: P) -> Result<String> {
    tokio::fs::read_to_string(path.as_ref())
        .await
        .context(error::ReadFileSnafu {
            filepath: path.as_ref(),
        })
}
