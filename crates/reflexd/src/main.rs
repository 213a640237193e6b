//! reflexd — the Reflex connection-count daemon.
//!
//! Reads socket state transitions as newline-delimited JSON (from a
//! kernel tracing exporter, a capture file or stdin), runs them through
//! the hysteresis detector and acts on the scaling signals it fires.
//!
//! # Usage
//!
//! ```text
//! reflexd run --config reflex.toml --events events.ndjson
//! conn-exporter | reflexd run --config reflex.toml --policy latch
//! reflexd check --config reflex.toml
//! ```

mod events;
mod runner;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::info;

use reflex_detector::{DebouncePolicy, KeyKind, ReflexConfig, Thresholds, parse_duration};

use crate::runner::{RunSettings, RunSummary};

#[derive(Parser)]
#[command(name = "reflexd", about = "Reflex connection hysteresis daemon")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Feed events into the detector and handle scaling signals.
    Run {
        /// Path to reflex.toml.
        #[arg(long)]
        config: PathBuf,

        /// Event file (NDJSON). Reads stdin when omitted.
        #[arg(long)]
        events: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate a config file and print the effective settings.
    Check {
        /// Path to reflex.toml.
        #[arg(long)]
        config: PathBuf,
    },
}

/// Command-line values layered over the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Override `thresholds.lower_limit`.
    #[arg(long)]
    lower: Option<u32>,

    /// Override `thresholds.upper_limit`.
    #[arg(long)]
    upper: Option<u32>,

    /// Override `thresholds.buffer_length`.
    #[arg(long)]
    buffer: Option<u32>,

    /// Override `detector.policy`.
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Additional key to monitor (repeatable).
    #[arg(long = "key")]
    keys: Vec<u32>,

    /// Override `daemon.report_interval` (e.g. "2s").
    #[arg(long)]
    report_interval: Option<String>,
}

impl Overrides {
    /// Merge into `config` and re-validate the result.
    ///
    /// Threshold overrides are combined with the file's values before
    /// validation, so `--lower` alone can still invert the band.
    fn apply(self, config: &mut ReflexConfig) -> anyhow::Result<()> {
        let t = config.thresholds;
        config.thresholds = Thresholds::new(
            self.lower.unwrap_or(t.lower_limit()),
            self.upper.unwrap_or(t.upper_limit()),
            self.buffer.unwrap_or(t.buffer_length()),
        )
        .context("invalid threshold override")?;

        if let Some(policy) = self.policy {
            config.detector.policy = policy.into();
        }
        config.detector.keys.extend(self.keys);
        if let Some(interval) = self.report_interval {
            parse_duration(&interval).context("invalid --report-interval")?;
            config.daemon.report_interval = Some(interval);
        }

        config.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    AutoReset,
    Latch,
}

impl From<PolicyArg> for DebouncePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::AutoReset => DebouncePolicy::AutoReset,
            PolicyArg::Latch => DebouncePolicy::Latch,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Run {
            config,
            events,
            overrides,
        } => {
            let mut config = load_config(&config)?;
            overrides.apply(&mut config)?;
            run(config, events).await
        }
        Command::Check { config } => {
            let config = load_config(&config)?;
            let settings = RunSettings::from_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            info!(
                rearm_after_ms = duration_ms(settings.rearm_after),
                report_interval_ms = duration_ms(settings.report_interval),
                "config ok"
            );
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reflexd=debug,reflex_detector=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<ReflexConfig> {
    let config = ReflexConfig::from_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

async fn run(config: ReflexConfig, events: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = RunSettings::from_config(&config)?;

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &events {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening events {}", path.display()))?;
            info!(path = %path.display(), "reading events from file");
            Box::new(BufReader::new(file))
        }
        None => {
            info!("reading events from stdin");
            Box::new(BufReader::new(tokio::io::stdin()))
        }
    };

    match config.detector.key_kind {
        KeyKind::Netns => {
            let keys = config.detector.netns_keys();
            let summary = runner::run::<u32, _>(&config, settings, &keys, input).await?;
            print_summary(&summary)
        }
        KeyKind::Port => {
            let keys = config.detector.port_keys()?;
            let summary = runner::run::<u16, _>(&config, settings, &keys, input).await?;
            print_summary(&summary)
        }
    }
}

fn print_summary<K: serde::Serialize>(summary: &RunSummary<K>) -> anyhow::Result<()> {
    let out = serde_json::json!({
        "events": summary.events,
        "rejected": summary.rejected,
        "signals": summary.signals,
        "final_counts": summary.final_counts,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ReflexConfig {
        ReflexConfig::from_toml(
            r#"
[thresholds]
lower_limit = 3
upper_limit = 10
buffer_length = 5

[detector]
keys = [1]
"#,
        )
        .unwrap()
    }

    #[test]
    fn no_overrides_keep_file_values() {
        let mut config = base();
        Overrides::default().apply(&mut config).unwrap();
        assert_eq!(config.thresholds, Thresholds::new(3, 10, 5).unwrap());
        assert_eq!(config.detector.policy, DebouncePolicy::AutoReset);
        assert_eq!(config.detector.keys, vec![1]);
    }

    #[test]
    fn overrides_merge_with_file() {
        let mut config = base();
        Overrides {
            upper: Some(20),
            buffer: Some(2),
            policy: Some(PolicyArg::Latch),
            keys: vec![2, 3],
            report_interval: Some("250ms".to_string()),
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap();

        assert_eq!(config.thresholds, Thresholds::new(3, 20, 2).unwrap());
        assert_eq!(config.detector.policy, DebouncePolicy::Latch);
        assert_eq!(config.detector.keys, vec![1, 2, 3]);
        assert_eq!(
            config.daemon.report_interval().unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn lower_override_past_file_upper_fails() {
        let mut config = base();
        let err = Overrides {
            lower: Some(20),
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap_err();
        assert!(format!("{err:#}").contains("lower limit 20"));
        assert_eq!(config.thresholds, Thresholds::new(3, 10, 5).unwrap());
    }

    #[test]
    fn bad_report_interval_fails() {
        let mut config = base();
        let err = Overrides {
            report_interval: Some("soon".to_string()),
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap_err();
        assert!(format!("{err:#}").contains("report-interval"));
    }

    #[test]
    fn port_override_is_range_checked() {
        let mut config = ReflexConfig::from_toml(
            "[thresholds]\nlower_limit = 1\nupper_limit = 3\nbuffer_length = 1\n\n[detector]\nkey_kind = \"port\"\n",
        )
        .unwrap();
        let err = Overrides {
            keys: vec![70000],
            ..Default::default()
        }
        .apply(&mut config)
        .unwrap_err();
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn cli_flags_parse_into_overrides() {
        let cli = Cli::try_parse_from([
            "reflexd", "run", "--config", "r.toml", "--lower", "1", "--key", "5", "--key", "6",
            "--policy", "latch",
        ])
        .unwrap();
        let Command::Run { overrides, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(overrides.lower, Some(1));
        assert_eq!(overrides.keys, vec![5, 6]);
        assert_eq!(overrides.policy, Some(PolicyArg::Latch));
    }
}
