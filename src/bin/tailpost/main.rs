// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::select;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use tailpost::config::Config;
use tailpost::engine::{self, Engine, EngineSettings};
use tailpost::pattern::PatternRegistry;
use tailpost::position::PositionStore;
use tailpost::publisher::{batch_queue, Broker, KafkaBroker, Publisher};
use tailpost::reaper::Reaper;
use tailpost::tailer::DrainLimits;

#[derive(Debug, Parser)]
#[command(name = "tailpost")]
#[command(bin_name = "tailpost")]
#[command(version, about, long_about = None)]
pub struct Arguments {
    /// Configuration document
    #[arg(long, env = "TAILPOST_CONFIG")]
    config: PathBuf,

    /// Log level
    #[arg(value_enum, long, env = "TAILPOST_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// tracing has no severities above error; `fatal` and `unknown` clamp
    /// onto the error filter.
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal | LogLevel::Unknown => "error",
        }
    }
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let _logger = match setup_logging(opt.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to set up logging: {}", e);
            return ExitCode::from(1);
        }
    };

    let config = match Config::load(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %opt.config.display(), error = %e, "Failed to load configuration.");
            return ExitCode::from(1);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "Failed to run tailpost.");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!(
        files = config.tailf.files.len(),
        position_file = %config.tailf.position_file.display(),
        brokers = ?config.kafka.brokers,
        "Starting tailpost.",
    );

    let registry = Arc::new(PatternRegistry::new(&config.tailf.files)?);
    let store = Arc::new(PositionStore::new(config.tailf.position_file.clone()));

    let limits = DrainLimits {
        max_batch_lines: config.tailf.max_batch_lines,
        max_batches: config.tailf.max_batches,
    };
    let (batch_tx, batch_rx) = batch_queue(config.tailf.max_batches * 10);

    let broker: Arc<dyn Broker> = Arc::new(KafkaBroker::new(&config.kafka)?);
    if !config.kafka.produce {
        warn!("kafka.produce is disabled, batches will be discarded (dry-run)");
    }
    let publisher = Publisher::new(batch_rx, broker, store.clone(), config.kafka.produce);

    let engine = Engine::new(
        registry,
        store.clone(),
        batch_tx,
        EngineSettings {
            from_beginning: config.tailf.from_beginning,
            limits,
        },
    );

    let reaper = config
        .tailf
        .delete_old_tailed_files
        .then(|| Reaper::new(store.clone(), config.tailf.post_delete_command.clone()));

    let engine_cancel = CancellationToken::new();
    let publisher_cancel = CancellationToken::new();
    let timer_cancel = CancellationToken::new();

    let mut engine_task_set = JoinSet::new();
    let mut publisher_task_set = JoinSet::new();
    let mut timer_task_set = JoinSet::new();

    {
        let cancel = engine_cancel.clone();
        engine_task_set.spawn(async move {
            engine
                .run(cancel)
                .await
                .map_err(|e| -> Box<dyn Error + Send + Sync> { e.into() })
        });
    }
    {
        let cancel = publisher_cancel.clone();
        publisher_task_set.spawn(async move {
            publisher
                .run(cancel)
                .await
                .map_err(|e| -> Box<dyn Error + Send + Sync> { e.into() })
        });
    }
    {
        let store = store.clone();
        let cancel = timer_cancel.clone();
        let flush_interval = Duration::from_secs(config.tailf.flush_interval);
        timer_task_set.spawn(async move {
            engine::run_timers(store, reaper, flush_interval, cancel).await;
            Ok(())
        });
    }

    let mut result = Ok(());
    select! {
        _ = signal_wait() => {
            info!("Shutdown signal received.");
        },
        e = wait_for_any_task(&mut engine_task_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of engine."),
                Err(e) => result = Err(e),
            }
        },
        e = wait_for_any_task(&mut publisher_task_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of publisher."),
                Err(e) => result = Err(e),
            }
        },
    }

    // Step one: stop the engine. It cancels its tailers, waits for them, and
    // writes a final position snapshot; the queue senders close with it.
    engine_cancel.cancel();
    let res = wait_for_tasks_with_timeout(&mut engine_task_set, Duration::from_secs(5)).await;
    if let Err(e) = res {
        result = result.and(Err(format!("timed out waiting for engine exit: {}", e).into()));
    }

    // The publisher drains whatever is still queued, then exits on queue
    // close. Give slow broker acknowledgement some headroom before forcing.
    let res = wait_for_tasks_with_timeout(&mut publisher_task_set, Duration::from_secs(5)).await;
    if res.is_err() {
        warn!("Publisher did not exit on queue close, cancelling.");
        publisher_cancel.cancel();
        let res =
            wait_for_tasks_with_timeout(&mut publisher_task_set, Duration::from_secs(2)).await;
        if let Err(e) = res {
            result = result.and(Err(format!("timed out waiting for publisher exit: {}", e).into()));
        }
    }

    timer_cancel.cancel();
    let _ = wait_for_tasks_with_timeout(&mut timer_task_set, Duration::from_secs(1)).await;

    // capture offsets acknowledged after the engine's final snapshot
    if let Err(e) = store.flush() {
        error!(error = %e, "Failed to write final position file.");
    }

    result
}

async fn wait_for_any_task(
    tasks: &mut JoinSet<Result<(), Box<dyn Error + Send + Sync>>>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let r = tasks.join_next().await;

    match r {
        None => Ok(()), // should not happen
        Some(res) => res?,
    }
}

async fn wait_for_tasks_with_timeout(
    tasks: &mut JoinSet<Result<(), Box<dyn Error + Send + Sync>>>,
    timeout: Duration,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let stop_at = Instant::now() + timeout;
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(v)) => match v {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                e => {
                    error!("Failed to join with task: {:?}", e)
                }
            },
        }
    }

    result
}

async fn signal_wait() {
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).expect("failed to install signal handler")
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_level: LogLevel) -> std::io::Result<LoggerGuard> {
    LogTracer::init().map_err(std::io::Error::other)?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_target(false)
        .with_level(true)
        .compact();

    let subscriber = Registry::default()
        .with(EnvFilter::new(log_level.as_filter()))
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).map_err(std::io::Error::other)?;

    Ok(guard)
}
