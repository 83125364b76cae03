//! The upstream data model: what a backend unit announces, and the shapes in which a relation
//! feed may hand those announcements over.
use crate::is_valid_filename;
use serde::{Deserialize, Serialize};

/// One remote unit's announcement.  Any subset of the three fragments may be offered; `None` and
/// the empty string both mean "not offered".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    /// The announcing unit, in the form `app/N`.
    pub remote_unit_name: String,

    /// An upstream block (backend pool definition).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_config: Option<String>,

    /// A location block routing requests to the upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_config: Option<String>,

    /// A TCP/UDP stream block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_config: Option<String>,
}

impl UpstreamDescriptor {
    pub fn new<S: Into<String>>(remote_unit_name: S) -> Self {
        Self {
            remote_unit_name: remote_unit_name.into(),
            ..Default::default()
        }
    }

    pub fn with_nginx_config<S: Into<String>>(mut self, config: S) -> Self {
        self.nginx_config = Some(config.into());
        self
    }

    pub fn with_location_config<S: Into<String>>(mut self, config: S) -> Self {
        self.location_config = Some(config.into());
        self
    }

    pub fn with_stream_config<S: Into<String>>(mut self, config: S) -> Self {
        self.stream_config = Some(config.into());
        self
    }

    /// The application name, i.e. everything before the first `/` of the unit name.
    ///
    /// e.g. "app/0" becomes "app"
    pub fn unit(&self) -> &str {
        self.remote_unit_name
            .split('/')
            .next()
            .unwrap_or(&self.remote_unit_name)
    }

    /// Returns the unit name if it can safely be used to name files in a config directory.
    pub fn file_unit(&self) -> Option<&str> {
        let unit = self.unit();
        if is_valid_filename(unit) {
            Some(unit)
        } else {
            None
        }
    }

    pub fn nginx_config(&self) -> Option<&str> {
        offered(&self.nginx_config)
    }

    pub fn location_config(&self) -> Option<&str> {
        offered(&self.location_config)
    }

    pub fn stream_config(&self) -> Option<&str> {
        offered(&self.stream_config)
    }
}

fn offered(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|value| !value.is_empty())
}

/// A full replacement batch from the upstream relation.  Relations expose their data in one of
/// several shapes: a single unified list, or one list per kind of fragment.  Whatever is absent
/// is treated as an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamFeed {
    /// Unified list carrying any mix of fragments per descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstreams: Option<Vec<UpstreamDescriptor>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx_configs: Option<Vec<UpstreamDescriptor>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx_locations: Option<Vec<UpstreamDescriptor>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx_streams: Option<Vec<UpstreamDescriptor>>,
}

impl UpstreamFeed {
    /// Builds a feed from the unified shape.
    pub fn unified(upstreams: Vec<UpstreamDescriptor>) -> Self {
        Self {
            upstreams: Some(upstreams),
            ..Default::default()
        }
    }

    /// Splits the feed into per-group lists.  A group-specific list wins over the unified list
    /// for that group.
    pub fn into_desired(self) -> DesiredState {
        let UpstreamFeed {
            upstreams,
            nginx_configs,
            nginx_locations,
            nginx_streams,
        } = self;

        let unified = || upstreams.clone().unwrap_or_default();
        DesiredState {
            configs: nginx_configs.unwrap_or_else(unified),
            locations: nginx_locations.unwrap_or_else(unified),
            streams: nginx_streams.unwrap_or_else(unified),
        }
    }
}

/// The complete desired set for one feed update, grouped by the kind of fragment each group
/// contributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub configs: Vec<UpstreamDescriptor>,
    pub locations: Vec<UpstreamDescriptor>,
    pub streams: Vec<UpstreamDescriptor>,
}

impl DesiredState {
    /// True when no group offers a single usable fragment, i.e. one that would be written out.
    pub fn is_empty(&self) -> bool {
        let usable = |d: &UpstreamDescriptor, fragment: Option<&str>| {
            fragment.is_some() && d.file_unit().is_some()
        };
        !self.configs.iter().any(|d| usable(d, d.nginx_config()))
            && !self.locations.iter().any(|d| usable(d, d.location_config()))
            && !self.streams.iter().any(|d| usable(d, d.stream_config()))
    }
}

/// Change-detection keys, one per group of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorGroup {
    Configs,
    Locations,
    Streams,
}

impl DescriptorGroup {
    pub const ALL: [DescriptorGroup; 3] = [
        DescriptorGroup::Configs,
        DescriptorGroup::Locations,
        DescriptorGroup::Streams,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            DescriptorGroup::Configs => "upstreams.nginx_configs",
            DescriptorGroup::Locations => "upstreams.nginx_locations",
            DescriptorGroup::Streams => "upstreams.nginx_streams",
        }
    }

    pub fn select<'a>(&self, desired: &'a DesiredState) -> &'a [UpstreamDescriptor] {
        match self {
            DescriptorGroup::Configs => &desired.configs,
            DescriptorGroup::Locations => &desired.locations,
            DescriptorGroup::Streams => &desired.streams,
        }
    }
}
