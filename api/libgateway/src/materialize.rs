//! Turns descriptor batches into configuration files.
//!
//! These functions only write; deciding whether a cycle should run at all, and clearing the
//! previous cycle's files, is the gateway's job.
use crate::descriptor::UpstreamDescriptor;
use crate::layout::ModuleLayout;
use crate::template::TemplateRenderer;
use crate::Result;
use log::warn;
use std::collections::HashSet;
use std::path::PathBuf;

/// Name of the merged location file in the sites module.
pub const SERVER_FILE: &str = "server";

const UPSTREAM_FILE_SUFFIX: &str = "-upstream";

pub fn upstream_file_name(unit: &str) -> String {
    format!("{}{}", unit, UPSTREAM_FILE_SUFFIX)
}

/// Writes one `<unit>-upstream` file per descriptor offering an upstream block.  Units of the
/// same application share a file, so the last one in the batch wins.
pub async fn materialize_upstreams(
    layout: &ModuleLayout,
    descriptors: &[UpstreamDescriptor],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for descriptor in descriptors {
        let config = match descriptor.nginx_config() {
            Some(config) => config,
            None => continue,
        };
        let unit = match usable_unit(descriptor) {
            Some(unit) => unit,
            None => continue,
        };
        let path = layout.write(&upstream_file_name(unit), config).await?;
        if !written.contains(&path) {
            written.push(path);
        }
    }
    Ok(written)
}

/// Keeps the first location fragment offered by each unit, in the order units first appear.
pub fn dedup_locations(descriptors: &[UpstreamDescriptor]) -> Vec<&str> {
    let mut seen_units = HashSet::new();
    descriptors
        .iter()
        .filter_map(|descriptor| {
            let location = descriptor.location_config()?;
            let unit = usable_unit(descriptor)?;
            if seen_units.insert(unit) {
                Some(location)
            } else {
                None
            }
        })
        .collect()
}

/// Renders the deduplicated location fragments into a single server file.  Nothing is written
/// when no unit offers a location.
pub async fn materialize_locations(
    layout: &ModuleLayout,
    renderer: &TemplateRenderer,
    descriptors: &[UpstreamDescriptor],
) -> Result<Option<PathBuf>> {
    let locations = dedup_locations(descriptors);
    if locations.is_empty() {
        return Ok(None);
    }
    let rendered = renderer.render_server(&locations)?;
    Ok(Some(layout.write(SERVER_FILE, rendered).await?))
}

/// Writes one `<unit>` file per descriptor offering a stream block.
pub async fn materialize_streams(
    layout: &ModuleLayout,
    descriptors: &[UpstreamDescriptor],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for descriptor in descriptors {
        let config = match descriptor.stream_config() {
            Some(config) => config,
            None => continue,
        };
        let unit = match usable_unit(descriptor) {
            Some(unit) => unit,
            None => continue,
        };
        let path = layout.write(unit, config).await?;
        if !written.contains(&path) {
            written.push(path);
        }
    }
    Ok(written)
}

fn usable_unit(descriptor: &UpstreamDescriptor) -> Option<&str> {
    let unit = descriptor.file_unit();
    if unit.is_none() {
        warn!(
            "Skipping descriptor from '{}': unit name can't be used as a file name",
            descriptor.remote_unit_name
        );
    }
    unit
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn location(unit: &str, config: &str) -> UpstreamDescriptor {
        UpstreamDescriptor::new(unit).with_location_config(config)
    }

    fn sites(root: &TempDir) -> ModuleLayout {
        ModuleLayout::new(
            root.path().join("sites-available/juju"),
            root.path().join("sites-enabled"),
        )
    }

    #[test]
    fn test_first_location_per_unit_wins() {
        let descriptors = vec![
            location("a/0", "a1"),
            location("b/0", "b1"),
            location("a/1", "a2"),
        ];
        assert_eq!(dedup_locations(&descriptors), vec!["a1", "b1"]);
    }

    #[test]
    fn test_units_without_locations_do_not_claim_a_slot() {
        let descriptors = vec![
            UpstreamDescriptor::new("a/0").with_nginx_config("upstream a {}"),
            location("a/1", ""),
            location("a/2", "a2"),
            location("/0", "nameless"),
        ];
        assert_eq!(dedup_locations(&descriptors), vec!["a2"]);
    }

    #[tokio::test]
    async fn test_upstreams_written_verbatim() {
        let root = TempDir::new().unwrap();
        let layout = sites(&root);
        layout.ensure().await.unwrap();

        let descriptors = vec![
            UpstreamDescriptor::new("app/0").with_nginx_config("upstream app { server 10.0.0.1; }"),
            UpstreamDescriptor::new("db/0"),
            UpstreamDescriptor::new("web/3").with_nginx_config("upstream web {}"),
        ];
        let written = materialize_upstreams(&layout, &descriptors).await.unwrap();
        assert_eq!(
            written,
            vec![
                layout.available.join("app-upstream"),
                layout.available.join("web-upstream")
            ]
        );
        assert_eq!(
            std::fs::read_to_string(layout.available.join("app-upstream")).unwrap(),
            "upstream app { server 10.0.0.1; }"
        );
    }

    #[tokio::test]
    async fn test_no_locations_no_server_file() {
        let root = TempDir::new().unwrap();
        let layout = sites(&root);
        layout.ensure().await.unwrap();
        let renderer = TemplateRenderer::new(80).unwrap();

        let descriptors = vec![UpstreamDescriptor::new("app/0").with_nginx_config("x")];
        let written = materialize_locations(&layout, &renderer, &descriptors)
            .await
            .unwrap();
        assert_eq!(written, None);
        assert!(layout.managed_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locations_merged_into_server_file() {
        let root = TempDir::new().unwrap();
        let layout = sites(&root);
        layout.ensure().await.unwrap();
        let renderer = TemplateRenderer::from_sources(
            80,
            "{{#each locations}}{{this}}\n{{/each}}",
            "",
        )
        .unwrap();

        let descriptors = vec![
            location("a/0", "a1"),
            location("b/0", "b1"),
            location("a/1", "a2"),
        ];
        let written = materialize_locations(&layout, &renderer, &descriptors)
            .await
            .unwrap();
        assert_eq!(written, Some(layout.available.join(SERVER_FILE)));
        assert_eq!(
            std::fs::read_to_string(layout.available.join(SERVER_FILE)).unwrap(),
            "a1\nb1\n"
        );
    }

    #[tokio::test]
    async fn test_streams_named_after_unit() {
        let root = TempDir::new().unwrap();
        let layout = ModuleLayout::new(
            root.path().join("streams-available/juju"),
            root.path().join("streams-enabled"),
        );
        layout.ensure().await.unwrap();

        let descriptors = vec![
            UpstreamDescriptor::new("dns/0").with_stream_config("server { listen 53 udp; }"),
            UpstreamDescriptor::new("app/0").with_nginx_config("upstream app {}"),
        ];
        let written = materialize_streams(&layout, &descriptors).await.unwrap();
        assert_eq!(written, vec![layout.available.join("dns")]);
    }
}
