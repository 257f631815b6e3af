use clap::{Parser, Subcommand, ValueEnum};
use sentinel_core::config::{load_config_or_default, ApnsConfig, ConfigError, SentinelConfig};
use sentinel_core::types::{PushEnvironment, TaskRunId, TokenRegistration, UserId};
use sentinel_detect::{wait_for_marker, DetectError, EventFn, TelemetryDetector, TelemetryEvent};
use sentinel_push::{
    PushDispatcher, PushPayload, ReqwestTransport, RunOutcome, SqliteTokenStore,
    StaticRunSummaries, StoreError, TaskRunNotice, TokenStore,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "sentinel.toml";

#[derive(Debug, Parser)]
#[command(
    name = "sentinel",
    version,
    about = "Detects agent completion and pushes task-run notifications"
)]
struct Cli {
    /// Path to the TOML config file (defaults apply when it is absent)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Block until the completion marker for a task run appears
    WaitMarker {
        #[arg(long)]
        task_run_id: String,
        /// Override the lifecycle directory from config
        #[arg(long)]
        lifecycle_dir: Option<PathBuf>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Block until a telemetry event arrives and print it as JSON
    WaitTelemetry {
        #[arg(long)]
        task_run_id: String,
        #[arg(long, value_enum, default_value_t = WaitTarget::AgentFinish)]
        until: WaitTarget,
        /// Read this log instead of the task run's default telemetry path
        #[arg(long)]
        log_path: Option<PathBuf>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Stream classified telemetry events as JSON lines until interrupted
    TailTelemetry {
        #[arg(long)]
        task_run_id: String,
        #[arg(long)]
        log_path: Option<PathBuf>,
        /// Exit after the first agent_finish event
        #[arg(long)]
        until_finish: bool,
    },
    /// Register or refresh a device token for a user
    RegisterToken {
        #[arg(long)]
        user: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        bundle_id: String,
        #[arg(long, default_value = "production", value_parser = parse_environment)]
        environment: PushEnvironment,
    },
    /// Send an ad-hoc push to every active device of a user
    Notify {
        #[arg(long)]
        user: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        /// Custom data entry, repeatable
        #[arg(long = "data", value_parser = parse_key_value)]
        data: Vec<(String, String)>,
    },
    /// Notify a user that a task run completed or failed
    NotifyRun {
        #[arg(long)]
        user: String,
        #[arg(long)]
        task_run_id: String,
        #[arg(long, value_enum, default_value_t = OutcomeArg::Completed)]
        outcome: OutcomeArg,
        /// Human-readable run title shown in the notification body
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WaitTarget {
    UserTurn,
    AgentFinish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutcomeArg {
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("failed to load config at {path}: {source}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("token store error: {0}")]
    Store(#[from] StoreError),
    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: &'static str, secs: u64 },
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to listen for ctrl-c: {0}")]
    Signal(#[source] std::io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("sentinel failed: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), MainError> {
    let config = load_config_or_default(&cli.config).map_err(|source| MainError::LoadConfig {
        path: cli.config.clone(),
        source,
    })?;
    debug!(config = %cli.config.display(), "configuration loaded");

    match cli.cmd {
        Command::WaitMarker {
            task_run_id,
            lifecycle_dir,
            timeout_secs,
        } => {
            let mut layout = config.layout.clone();
            if let Some(dir) = lifecycle_dir {
                layout.lifecycle_dir = dir;
            }
            let task_run_id = TaskRunId::new(task_run_id);
            info!(task_run_id = %task_run_id, dir = %layout.lifecycle_dir.display(), "waiting for completion marker");
            with_timeout(
                timeout_secs,
                "completion marker",
                wait_for_marker(&layout, &task_run_id),
            )
            .await??;
            println!("{}", layout.marker_path(&task_run_id).display());
            Ok(())
        }
        Command::WaitTelemetry {
            task_run_id,
            until,
            log_path,
            timeout_secs,
        } => {
            let path = telemetry_path(&config, &task_run_id, log_path);
            let detector = TelemetryDetector::new(path);
            let waiter: std::pin::Pin<
                Box<dyn Future<Output = Result<TelemetryEvent, DetectError>> + Send>,
            > = match until {
                WaitTarget::UserTurn => Box::pin(detector.wait_for_user_turn()),
                WaitTarget::AgentFinish => Box::pin(detector.wait_for_agent_finish()),
            };
            detector.start()?;
            let outcome = with_timeout(timeout_secs, "telemetry event", waiter).await;
            detector.stop();
            let event = outcome??;
            println!("{}", serde_json::to_string(&event)?);
            Ok(())
        }
        Command::TailTelemetry {
            task_run_id,
            log_path,
            until_finish,
        } => {
            let path = telemetry_path(&config, &task_run_id, log_path);
            let detector = TelemetryDetector::new(path);
            detector.subscribe(EventFn(|event: &TelemetryEvent| {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::warn!(error = %err, "failed to encode telemetry event"),
                }
            }));
            let finished = detector.wait_for_agent_finish();
            detector.start()?;

            let outcome = if until_finish {
                tokio::select! {
                    result = finished => result.map(|_| ()).map_err(MainError::from),
                    signal = tokio::signal::ctrl_c() => signal.map_err(MainError::Signal),
                }
            } else {
                tokio::signal::ctrl_c().await.map_err(MainError::Signal)
            };
            detector.stop();
            outcome
        }
        Command::RegisterToken {
            user,
            token,
            bundle_id,
            environment,
        } => {
            let store = open_store(&config)?;
            let record = store.register(&TokenRegistration {
                token,
                user_id: UserId::new(user),
                environment,
                bundle_id,
            })?;
            info!(user_id = %record.user_id, environment = %record.environment, "device token registered");
            Ok(())
        }
        Command::Notify {
            user,
            title,
            body,
            data,
        } => {
            let dispatcher = build_dispatcher(&config)?;
            let mut payload = PushPayload::new(title, body).with_sound(config.push.sound.clone());
            for (key, value) in data {
                payload = payload.with_data(key, value);
            }
            let report = dispatcher.send_to_user(&UserId::new(user), &payload).await;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Command::NotifyRun {
            user,
            task_run_id,
            outcome,
            title,
            error,
        } => {
            let dispatcher = build_dispatcher(&config)?;
            let task_run_id = TaskRunId::new(task_run_id);
            let mut summaries = StaticRunSummaries::new();
            if let Some(title) = title {
                summaries.insert(task_run_id.clone(), title);
            }
            let notice = TaskRunNotice {
                task_run_id,
                user_id: UserId::new(user),
                outcome: match outcome {
                    OutcomeArg::Completed => RunOutcome::Completed,
                    OutcomeArg::Failed => RunOutcome::Failed { error },
                },
            };
            let report = dispatcher.notify_task_run(&notice, &summaries).await;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
    }
}

async fn with_timeout<F: Future>(
    timeout_secs: Option<u64>,
    what: &'static str,
    future: F,
) -> Result<F::Output, MainError> {
    match timeout_secs {
        None => Ok(future.await),
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), future)
            .await
            .map_err(|_| MainError::Timeout { what, secs }),
    }
}

fn telemetry_path(
    config: &SentinelConfig,
    task_run_id: &str,
    override_path: Option<PathBuf>,
) -> PathBuf {
    override_path.unwrap_or_else(|| {
        config
            .layout
            .telemetry_log_path(&TaskRunId::new(task_run_id))
    })
}

fn open_store(config: &SentinelConfig) -> Result<SqliteTokenStore, MainError> {
    let store = SqliteTokenStore::open(&config.store.sqlite_path)?;
    store.migrate()?;
    Ok(store)
}

fn build_dispatcher(config: &SentinelConfig) -> Result<PushDispatcher, MainError> {
    let store = open_store(config)?;
    let transport =
        ReqwestTransport::new(Duration::from_secs(config.push.request_timeout_secs));
    Ok(PushDispatcher::new(
        ApnsConfig::from_env().as_ref(),
        Arc::new(transport),
        Arc::new(store),
    ))
}

fn parse_environment(value: &str) -> Result<PushEnvironment, String> {
    value.parse()
}

fn parse_key_value(value: &str) -> Result<(String, String), String> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{value}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{value}'"));
    }
    Ok((key.to_string(), val.to_string()))
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use sentinel_core::config::SentinelConfig;
    use sentinel_core::types::PushEnvironment;
    use std::path::PathBuf;

    use super::{parse_key_value, telemetry_path, Cli, Command, OutcomeArg, WaitTarget};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sentinel").chain(args.iter().copied()))
            .expect("valid args")
    }

    #[test]
    fn wait_telemetry_defaults_to_agent_finish() {
        let cli = parse(&["wait-telemetry", "--task-run-id", "run-1"]);
        assert_eq!(cli.config, PathBuf::from("sentinel.toml"));
        match cli.cmd {
            Command::WaitTelemetry {
                task_run_id,
                until,
                log_path,
                timeout_secs,
            } => {
                assert_eq!(task_run_id, "run-1");
                assert_eq!(until, WaitTarget::AgentFinish);
                assert!(log_path.is_none());
                assert!(timeout_secs.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn wait_telemetry_accepts_user_turn_and_timeout() {
        let cli = parse(&[
            "--config",
            "/etc/sentinel.toml",
            "wait-telemetry",
            "--task-run-id",
            "run-1",
            "--until",
            "user-turn",
            "--timeout-secs",
            "30",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/sentinel.toml"));
        assert!(matches!(
            cli.cmd,
            Command::WaitTelemetry {
                until: WaitTarget::UserTurn,
                timeout_secs: Some(30),
                ..
            }
        ));
    }

    #[test]
    fn register_token_parses_environment_aliases() {
        let cli = parse(&[
            "register-token",
            "--user",
            "alice",
            "--token",
            "abcd",
            "--bundle-id",
            "dev.sentinel.app",
            "--environment",
            "sandbox",
        ]);
        assert!(matches!(
            cli.cmd,
            Command::RegisterToken {
                environment: PushEnvironment::Development,
                ..
            }
        ));

        let err = Cli::try_parse_from([
            "sentinel",
            "register-token",
            "--user",
            "alice",
            "--token",
            "abcd",
            "--bundle-id",
            "b",
            "--environment",
            "staging",
        ])
        .expect_err("unknown environment");
        assert!(err.to_string().contains("invalid push environment"));
    }

    #[test]
    fn notify_collects_repeated_data_pairs() {
        let cli = parse(&[
            "notify",
            "--user",
            "alice",
            "--title",
            "Hi",
            "--body",
            "There",
            "--data",
            "taskRunId=run-1",
            "--data",
            "kind=manual",
        ]);
        match cli.cmd {
            Command::Notify { data, .. } => assert_eq!(
                data,
                vec![
                    ("taskRunId".to_string(), "run-1".to_string()),
                    ("kind".to_string(), "manual".to_string()),
                ]
            ),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn notify_run_defaults_to_completed() {
        let cli = parse(&["notify-run", "--user", "alice", "--task-run-id", "run-1"]);
        assert!(matches!(
            cli.cmd,
            Command::NotifyRun {
                outcome: OutcomeArg::Completed,
                title: None,
                error: None,
                ..
            }
        ));
    }

    #[test]
    fn key_value_parser_rejects_malformed_pairs() {
        assert_eq!(
            parse_key_value("a=b=c").expect("pair"),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn telemetry_path_prefers_override() {
        let config = SentinelConfig::default();
        assert_eq!(
            telemetry_path(&config, "run-9", None),
            PathBuf::from("/tmp/gemini-telemetry-run-9.log")
        );
        assert_eq!(
            telemetry_path(&config, "run-9", Some(PathBuf::from("/var/log/t.log"))),
            PathBuf::from("/var/log/t.log")
        );
    }
}
