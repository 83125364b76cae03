//! The reconciliation orchestrator.
//!
//! A `Gateway` consumes one event at a time and moves through
//!
//! ```text
//! Uninitialized --setup--> Ready --upstream-changed--> Serving
//!                            |                          |   ^
//!                            +----upstream-departed---> NoUpstream
//! ```
//!
//! Failures never escape `handle`: they become a blocked `Status` and the gateway stays in the
//! state it was in, with whatever was written left on disk for inspection.
use crate::config::GatewayConfig;
use crate::descriptor::{DescriptorGroup, DesiredState, UpstreamFeed};
use crate::layout::GatewayLayout;
use crate::materialize::{materialize_locations, materialize_streams, materialize_upstreams};
use crate::proxy::ProxyControl;
use crate::store::DescriptorStore;
use crate::template::TemplateRenderer;
use crate::{error, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayState {
    /// The directory layout hasn't been set up yet.
    Uninitialized,
    /// Set up, no upstream data received yet.
    Ready,
    /// Set up, and no upstream is being served.
    NoUpstream,
    /// Upstream configuration was committed successfully.
    Serving,
}

/// The user-visible outcome of the most recent event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "kebab-case")]
pub enum Status {
    Maintenance(String),
    Waiting(String),
    Active(String),
    Blocked(String),
}

impl Status {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Status::Blocked(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Status::Maintenance(message)
            | Status::Waiting(message)
            | Status::Active(message)
            | Status::Blocked(message) => message,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Status::Maintenance(_) => "maintenance",
            Status::Waiting(_) => "waiting",
            Status::Active(_) => "active",
            Status::Blocked(_) => "blocked",
        };
        write!(f, "{}: {}", kind, self.message())
    }
}

/// Inbound events, as delivered by the relation runtime.  Events must be handed to the gateway
/// one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// The proxy is installed and available.
    Setup,
    /// The upstream relation delivered a full replacement batch.
    UpstreamChanged {
        #[serde(flatten)]
        feed: UpstreamFeed,
    },
    /// No upstream relation is present anymore.
    UpstreamDeparted,
    /// The exact-server-names option changed.
    ConfigChanged { exact_server_names: bool },
    WebsiteAvailable,
    WebsiteDeparted,
}

/// The downstream website relation.
pub trait Notifier {
    /// Advertises the port the gateway listens on.
    fn configure(&mut self, port: u16);

    /// Publishes the inbound port once the gateway has both upstreams and a website relation.
    fn publish_info(&mut self, port: u16);
}

const READY: &str = "ready";
const WAITING_FOR_UPSTREAM: &str = "waiting for upstream relation";
const WAITING_FOR_SETUP: &str = "waiting for nginx";

pub struct Gateway<P, N> {
    layout: GatewayLayout,
    renderer: TemplateRenderer,
    proxy: P,
    notifier: N,
    store: DescriptorStore,
    state: GatewayState,
    status: Status,
    port: u16,
    publish_port: u16,
    exact_server_names: bool,
    upstream_present: bool,
    website_present: bool,
    published: bool,
}

impl<P, N> Gateway<P, N>
where
    P: ProxyControl,
    N: Notifier,
{
    pub fn new(
        config: &GatewayConfig,
        renderer: TemplateRenderer,
        proxy: P,
        notifier: N,
    ) -> Self {
        Self {
            layout: config.layout(),
            renderer,
            proxy,
            notifier,
            store: DescriptorStore::new(),
            state: GatewayState::Uninitialized,
            status: Status::Maintenance(WAITING_FOR_SETUP.to_string()),
            port: config.port,
            publish_port: config.publish_port,
            exact_server_names: config.exact_server_names,
            upstream_present: false,
            website_present: false,
            published: false,
        }
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn layout(&self) -> &GatewayLayout {
        &self.layout
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Processes one event to completion and returns the resulting status.
    pub async fn handle(&mut self, event: Event) -> &Status {
        debug!("Handling {:?} in state {:?}", event, self.state);
        match event {
            Event::Setup => self.setup().await,
            Event::UpstreamChanged { feed } => self.upstream_changed(feed).await,
            Event::UpstreamDeparted => self.upstream_departed().await,
            Event::ConfigChanged { exact_server_names } => {
                self.config_changed(exact_server_names).await
            }
            Event::WebsiteAvailable => self.website_available(),
            Event::WebsiteDeparted => {
                self.website_present = false;
                self.published = false;
            }
        }
        &self.status
    }

    async fn setup(&mut self) {
        if self.state != GatewayState::Uninitialized {
            debug!("Gateway already set up");
            return;
        }

        if let Err(e) = self.layout.ensure().await {
            self.block(e);
            return;
        }
        self.state = GatewayState::Ready;
        info!("Gateway layout ready");

        match self.apply_exact_server_names().await {
            Ok(()) => self.settle(),
            Err(e) => self.block(e),
        }
    }

    async fn upstream_changed(&mut self, feed: UpstreamFeed) {
        if self.state == GatewayState::Uninitialized {
            warn!("Ignoring upstream data received before setup");
            return;
        }
        self.upstream_present = true;

        let mut desired = feed.into_desired();
        if self.layout.streams.is_none() {
            if desired.streams.iter().any(|d| d.stream_config().is_some()) {
                warn!("Ignoring stream configuration: stream support is disabled");
            }
            desired.streams.clear();
        }

        // Every group is compared so that every baseline is refreshed.
        let mut changed = false;
        for group in DescriptorGroup::ALL {
            changed |= self.store.changed(group.key(), group.select(&desired));
        }

        if !changed {
            debug!("Upstream data unchanged, nothing to do");
        } else {
            match self.reconcile(&desired).await {
                Ok(()) if desired.is_empty() => {
                    info!("No upstream configuration offered");
                    self.state = GatewayState::NoUpstream;
                    self.settle();
                }
                Ok(()) => {
                    info!("Upstream configuration applied");
                    self.state = GatewayState::Serving;
                    self.settle();
                }
                Err(e) => {
                    // Retry the whole cycle on the next event, even if its data is identical.
                    self.forget_baselines();
                    self.block(e);
                }
            }
        }

        self.maybe_publish();
    }

    async fn upstream_departed(&mut self) {
        self.upstream_present = false;
        self.published = false;

        match self.state {
            GatewayState::Uninitialized => {
                debug!("Upstream departed before setup, nothing to clean");
                return;
            }
            GatewayState::NoUpstream => return,
            GatewayState::Ready | GatewayState::Serving => {}
        }

        // Forgotten before clearing so that a re-appearance rebuilds everything, even when the
        // clear below fails partway.
        self.forget_baselines();
        if let Err(e) = self.layout.clear().await {
            self.block(e);
            return;
        }
        if let Err(e) = self.proxy.commit().await {
            warn!("Failed to apply configuration without upstreams: {}", e);
        }
        self.state = GatewayState::NoUpstream;
        self.settle();
    }

    async fn config_changed(&mut self, exact_server_names: bool) {
        self.exact_server_names = exact_server_names;
        if self.state == GatewayState::Uninitialized {
            debug!("Recorded exact-server-names={} for setup", exact_server_names);
            return;
        }
        match self.apply_exact_server_names().await {
            Ok(()) => self.settle(),
            Err(e) => self.block(e),
        }
    }

    fn website_available(&mut self) {
        self.website_present = true;
        self.notifier.configure(self.port);
        self.maybe_publish();
    }

    fn maybe_publish(&mut self) {
        if self.upstream_present && self.website_present && !self.published {
            self.notifier.publish_info(self.publish_port);
            self.published = true;
        }
    }

    /// Rewrites every managed module from scratch and commits the result.
    async fn reconcile(&mut self, desired: &DesiredState) -> Result<()> {
        self.status = Status::Maintenance("applying upstream configuration".to_string());
        self.layout.clear().await?;

        let mut written = materialize_upstreams(&self.layout.sites, &desired.configs).await?;
        written.extend(
            materialize_locations(&self.layout.sites, &self.renderer, &desired.locations).await?,
        );
        if let Some(streams) = &self.layout.streams {
            written.extend(materialize_streams(streams, &desired.streams).await?);
        }
        let linked = self.layout.enable_all().await?;
        debug!("Wrote {} file(s), linked {}", written.len(), linked);

        self.proxy.commit().await.context(error::CommitSnafu)
    }

    /// Installs or removes the catch-all site to match the option, then commits.
    async fn apply_exact_server_names(&mut self) -> Result<()> {
        let file = &self.layout.exact_server_names;
        if self.exact_server_names {
            let rendered = self.renderer.render_exact_server_names()?;
            file.install(rendered).await?;
        } else {
            file.remove().await?;
        }
        self.proxy.commit().await.context(error::CommitSnafu)
    }

    fn forget_baselines(&mut self) {
        for group in DescriptorGroup::ALL {
            self.store.forget(group.key());
        }
    }

    /// Sets the healthy status for the current state.
    fn settle(&mut self) {
        self.status = match self.state {
            GatewayState::Uninitialized => Status::Maintenance(WAITING_FOR_SETUP.to_string()),
            GatewayState::Ready | GatewayState::NoUpstream => {
                Status::Waiting(WAITING_FOR_UPSTREAM.to_string())
            }
            GatewayState::Serving => Status::Active(READY.to_string()),
        };
    }

    fn block(&mut self, e: error::Error) {
        log::error!("{}", e);
        self.status = Status::Blocked(e.to_string());
    }
}
