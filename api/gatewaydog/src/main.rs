/*!
# Introduction

gatewaydog keeps an nginx reverse proxy in line with the upstream applications related to it.

It reads relation events, one JSON object per line, writes the nginx configuration the upstreams
ask for, and validates and reloads nginx whenever that configuration actually changes.

# Usage

```text
gatewaydog [--config <path>] [--log-level <level>] run
gatewaydog [--config <path>] reconcile --upstreams <feed.json>
gatewaydog [--config <path>] check
```

`run` handles events from stdin until EOF, printing a status line after each one:

```text
{"event": "setup"}
{"event": "upstream-changed", "upstreams": [{"remote_unit_name": "app/0", "nginx_config": "..."}]}
```

`reconcile` applies a single feed file and exits non-zero if the result is blocked.  `check` only
asks nginx to validate what is on disk.
*/

use argh::FromArgs;
use libgateway::{
    Event, Gateway, GatewayConfig, Notifier, ProxyControl, Status, TemplateRenderer, UpstreamFeed,
};
use log::{debug, info, warn, LevelFilter};
use serde::Serialize;
use simplelog::{Config as LogConfig, SimpleLogger};
use snafu::{ensure, ResultExt};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Stores user-supplied global arguments.
#[derive(FromArgs, Debug)]
#[argh(description = "keeps nginx configured for related upstream applications")]
struct Args {
    #[argh(option, description = "path to the gateway's TOML config file")]
    config: Option<PathBuf>,

    #[argh(
        option,
        default = "LevelFilter::Info",
        description = "log level: off, error, warn, info, debug or trace"
    )]
    log_level: LevelFilter,

    #[argh(subcommand)]
    subcommand: Subcommand,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Subcommand {
    Run(RunArgs),
    Reconcile(ReconcileArgs),
    Check(CheckArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "run", description = "handle events read from stdin until EOF")]
struct RunArgs {}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "reconcile",
    description = "set up and apply one upstream feed"
)]
struct ReconcileArgs {
    #[argh(option, description = "JSON file holding the upstream feed")]
    upstreams: PathBuf,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "check",
    description = "validate the configuration currently on disk"
)]
struct CheckArgs {}

/// A website-relation notification, printed as one JSON line.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "notify", rename_all = "kebab-case")]
enum Notification {
    Configure { port: u16 },
    PublishInfo { port: u16 },
}

/// Prints website notifications to stdout for the relation runtime to pick up.
#[derive(Debug, Default)]
struct StdoutNotifier;

impl StdoutNotifier {
    fn emit(&self, notification: &Notification) {
        if let Err(e) = print_line(&mut std::io::stdout(), notification) {
            warn!("Failed to emit {:?}: {}", notification, e);
        }
    }
}

impl Notifier for StdoutNotifier {
    fn configure(&mut self, port: u16) {
        self.emit(&Notification::Configure { port });
    }

    fn publish_info(&mut self, port: u16) {
        self.emit(&Notification::PublishInfo { port });
    }
}

fn print_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context(error::SerializeSnafu)?;
    writeln!(out, "{}", line).context(error::WriteStdoutSnafu)?;
    out.flush().context(error::WriteStdoutSnafu)
}

/// Parses one input line.  Blank lines are skipped quietly; malformed ones with a warning.
fn parse_event(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping malformed event '{}': {}", line, e);
            None
        }
    }
}

async fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    match path {
        Some(path) => GatewayConfig::from_file(path)
            .await
            .context(error::ConfigSnafu),
        None => Ok(GatewayConfig::default()),
    }
}

async fn build_gateway<P, N>(config: &GatewayConfig, proxy: P, notifier: N) -> Result<Gateway<P, N>>
where
    P: ProxyControl,
    N: Notifier,
{
    let renderer = TemplateRenderer::from_files(
        config.port,
        config.templates.server.as_ref(),
        config.templates.exact_server_names.as_ref(),
    )
    .await
    .context(error::TemplatesSnafu)?;
    Ok(Gateway::new(config, renderer, proxy, notifier))
}

/// Feeds every event from `input` to the gateway, printing the resulting status after each one.
async fn handle_events<R, W, P, N>(
    gateway: &mut Gateway<P, N>,
    input: R,
    out: &mut W,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: Write,
    P: ProxyControl,
    N: Notifier,
{
    let mut handled = 0;
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context(error::ReadStdinSnafu)? {
        let event = match parse_event(&line) {
            Some(event) => event,
            None => continue,
        };
        let status = gateway.handle(event).await;
        print_line(out, status)?;
        handled += 1;
    }
    Ok(handled)
}

async fn run(config: &GatewayConfig) -> Result<()> {
    let mut gateway = build_gateway(config, config.controller(), StdoutNotifier).await?;
    let stdin = BufReader::new(tokio::io::stdin());
    let handled = handle_events(&mut gateway, stdin, &mut std::io::stdout()).await?;
    info!("Input closed after {} event(s)", handled);
    Ok(())
}

async fn read_feed(path: &Path) -> Result<UpstreamFeed> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .context(error::ReadFeedSnafu { path })?;
    serde_json::from_str(&contents).context(error::ParseFeedSnafu { path })
}

async fn reconcile<P: ProxyControl>(
    config: &GatewayConfig,
    proxy: P,
    feed: UpstreamFeed,
) -> Result<Status> {
    let mut gateway = build_gateway(config, proxy, StdoutNotifier).await?;
    for event in [Event::Setup, Event::UpstreamChanged { feed }] {
        let status = gateway.handle(event).await;
        debug!("{}", status);
        ensure!(
            !status.is_blocked(),
            error::BlockedSnafu {
                message: status.message()
            }
        );
    }
    Ok(gateway.status().clone())
}

async fn check(config: &GatewayConfig) -> Result<()> {
    config
        .controller()
        .validate()
        .await
        .context(error::ValidateSnafu)?;
    println!("nginx configuration is valid");
    Ok(())
}

async fn run_subcommand(args: Args) -> Result<()> {
    SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?;
    let config = load_config(args.config.as_deref()).await?;

    match args.subcommand {
        Subcommand::Run(_) => run(&config).await,
        Subcommand::Reconcile(reconcile_args) => {
            let feed = read_feed(&reconcile_args.upstreams).await?;
            let status = reconcile(&config, config.controller(), feed).await?;
            print_line(&mut std::io::stdout(), &status)
        }
        Subcommand::Check(_) => check(&config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = argh::from_env();
    match run_subcommand(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("Failed to load config: {}", source))]
        Config { source: libgateway::Error },

        #[snafu(display("Failed to load templates: {}", source))]
        Templates { source: libgateway::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Failed to read upstream feed '{}': {}", path.display(), source))]
        ReadFeed {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Invalid upstream feed '{}': {}", path.display(), source))]
        ParseFeed {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Failed to read events from stdin: {}", source))]
        ReadStdin { source: std::io::Error },

        #[snafu(display("Failed to serialize output: {}", source))]
        Serialize { source: serde_json::Error },

        #[snafu(display("Failed to write to stdout: {}", source))]
        WriteStdout { source: std::io::Error },

        #[snafu(display("{}", source))]
        Validate {
            source: libgateway::proxy::Error,
        },

        #[snafu(display("Gateway blocked: {}", message))]
        Blocked { message: String },
    }
}

type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use libgateway::config::PathsConfig;
    use libgateway::NginxController;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Recorded(Vec<Notification>);

    impl Notifier for Recorded {
        fn configure(&mut self, port: u16) {
            self.0.push(Notification::Configure { port });
        }

        fn publish_info(&mut self, port: u16) {
            self.0.push(Notification::PublishInfo { port });
        }
    }

    fn config(root: &TempDir) -> GatewayConfig {
        GatewayConfig {
            paths: PathsConfig::under(root.path()),
            ..Default::default()
        }
    }

    fn accepting_proxy() -> NginxController {
        NginxController::new("sh")
            .with_validate_args(vec!["-c", "exit 0"])
            .with_reload_args(vec!["-c", "exit 0"])
    }

    #[test]
    fn test_notification_lines() {
        assert_eq!(
            serde_json::to_string(&Notification::Configure { port: 80 }).unwrap(),
            r#"{"notify":"configure","port":80}"#
        );
        assert_eq!(
            serde_json::to_string(&Notification::PublishInfo { port: 443 }).unwrap(),
            r#"{"notify":"publish-info","port":443}"#
        );
    }

    #[test]
    fn test_parse_event() {
        assert_eq!(parse_event(r#" {"event": "setup"} "#), Some(Event::Setup));
        assert_eq!(parse_event(""), None);
        assert_eq!(parse_event("not json"), None);
        assert_eq!(parse_event(r#"{"event": "reboot"}"#), None);
    }

    #[tokio::test]
    async fn test_handle_events() {
        let root = TempDir::new().unwrap();
        let config = config(&root);
        let mut gateway = build_gateway(&config, accepting_proxy(), Recorded::default())
            .await
            .unwrap();

        let input = concat!(
            "{\"event\": \"setup\"}\n",
            "garbage\n",
            "\n",
            "{\"event\": \"website-available\"}\n",
            "{\"event\": \"upstream-changed\", \"upstreams\": [{\"remote_unit_name\": \"app/0\", ",
            "\"nginx_config\": \"upstream app { server 10.0.0.1; }\"}]}\n",
        );
        let mut out = Vec::new();
        let handled = handle_events(&mut gateway, input.as_bytes(), &mut out)
            .await
            .unwrap();

        assert_eq!(handled, 3);
        let lines: Vec<&str> = std::str::from_utf8(&out).unwrap().lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"status":"waiting","message":"waiting for upstream relation"}"#,
                r#"{"status":"waiting","message":"waiting for upstream relation"}"#,
                r#"{"status":"active","message":"ready"}"#,
            ]
        );
        assert_eq!(
            gateway.notifier().0,
            vec![
                Notification::Configure { port: 80 },
                Notification::PublishInfo { port: 80 }
            ]
        );
        assert!(config.paths.sites_enabled.join("app-upstream").exists());
    }

    #[tokio::test]
    async fn test_read_feed() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("feed.json");
        std::fs::write(
            &path,
            r#"{"nginx_configs": [{"remote_unit_name": "app/0", "nginx_config": "upstream app {}"}]}"#,
        )
        .unwrap();
        let feed = read_feed(&path).await.unwrap();
        assert_eq!(feed.nginx_configs.unwrap().len(), 1);

        std::fs::write(&path, "[").unwrap();
        assert!(read_feed(&path).await.is_err());
        assert!(read_feed(&root.path().join("missing.json")).await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_blocked() {
        let root = TempDir::new().unwrap();
        let config = config(&root);
        let feed = UpstreamFeed::unified(vec![libgateway::UpstreamDescriptor::new("app/0")
            .with_nginx_config("upstream app {}")]);

        let status = reconcile(&config, accepting_proxy(), feed.clone())
            .await
            .unwrap();
        assert_eq!(status, Status::Active("ready".to_string()));

        let rejecting = NginxController::new("sh")
            .with_validate_args(vec!["-c", "echo 'bad config' >&2; exit 1"]);
        let err = reconcile(&config, rejecting, feed).await.unwrap_err();
        assert!(err.to_string().contains("bad config"));
    }
}
