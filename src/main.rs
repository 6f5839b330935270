//! Passing-fields demo - Main Entry Point
//!
//! Two chained stages of ten instances each: the first multiplies every input
//! by an integer field, the second by a factor decoded from an object field,
//! and prints the result.
//!
//! Usage: `workers-demo [config.json|config.toml]`

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workers_rs::{
    config::{
        LoggingConfig, PipelineConfig, FIELD_AMOUNT_TO_MULTIPLY, STAGE_MULTIPLY_BY_FOUR,
        STAGE_MULTIPLY_BY_TWO,
    },
    pipeline::{CancelToken, PipelineGraph, Stage, Worker},
    ResultExt, WorkersError,
};

/// Object form of the second stage's multiplier field.
#[derive(Debug, Default, Deserialize)]
struct MultiplyConfig {
    amount_to_multiply: i64,
}

fn product_line(value: i64, amount: i64) -> String {
    format!("{} x {} = {}", value, amount, value * amount)
}

fn init_logging(logging: &LoggingConfig) -> workers_rs::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter.as_str()));

    match &logging.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "workers-demo.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            Ok(None)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => PipelineConfig::load(&path)
            .with_context(|| format!("Loading pipeline config {:?}", path))?,
        None => PipelineConfig::default(),
    };

    // Kept alive until the end of main so buffered log lines are flushed
    let _log_guard = init_logging(&config.logging).context("Initialising logging")?;

    tracing::info!("Starting passing-fields demo");

    let cancel = CancelToken::new();

    let multiply_by_two = Stage::builder(
        STAGE_MULTIPLY_BY_TWO,
        cancel.clone(),
        |w: &Worker<i64, i64>| {
            let amount = w.try_field_int(FIELD_AMOUNT_TO_MULTIPLY)?;
            for value in w.inputs() {
                println!("{}", product_line(value, amount));
                w.emit(value * amount)?;
            }
            Ok(())
        },
    )
    .configure(&config.stage_or_default(STAGE_MULTIPLY_BY_TWO))
    .start()
    .with_context(|| format!("Starting stage '{}'", STAGE_MULTIPLY_BY_TWO))?;

    let multiply_by_four = Stage::builder(
        STAGE_MULTIPLY_BY_FOUR,
        cancel.clone(),
        |w: &Worker<i64, ()>| {
            let mut multiply = MultiplyConfig::default();
            w.get_field_object_into(FIELD_AMOUNT_TO_MULTIPLY, &mut multiply)?;
            for value in w.inputs() {
                println!("{}", product_line(value, multiply.amount_to_multiply));
            }
            Ok(())
        },
    )
    .configure(&config.stage_or_default(STAGE_MULTIPLY_BY_FOUR))
    .link_from(&multiply_by_two)
    .start()
    .with_context(|| format!("Starting stage '{}'", STAGE_MULTIPLY_BY_FOUR))?;

    let mut graph = PipelineGraph::new();
    graph.add(multiply_by_two.clone());
    graph.add(multiply_by_four);

    let mut rng = match config.input.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let max_value = config.input.max_value.max(1);
    let count = config.input.count;

    let feeder = {
        let first = multiply_by_two.clone();
        std::thread::Builder::new()
            .name("feeder".to_string())
            .spawn(move || -> workers_rs::Result<()> {
                for _ in 0..count {
                    let value = rng.gen_range(0..max_value);
                    tracing::debug!("Sending {}", value);
                    if let Err(e) = first.send(value) {
                        return Err(WorkersError::from(e.reason).with_context("Feeding first stage"));
                    }
                }
                first.close().context("Closing pipeline input")
            })
            .map_err(WorkersError::from)?
    };

    let joined = graph.join_all_or_cancel(&cancel).context("Waiting for pipeline");
    let fed = feeder
        .join()
        .map_err(|_| anyhow::anyhow!("feeder thread panicked"))?;

    // A stage failure explains a rejected send, so report it first.
    joined?;
    fed?;

    tracing::info!("All stages completed");
    Ok(())
}
