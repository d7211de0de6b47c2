mod script;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tapwire_intercept::InterceptContext;
use tapwire_protocol::{decode_event_line, encode_reply};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::script::ScriptConfig;

#[derive(Debug, Parser)]
#[command(name = "tapwire", about = "Replay recorded proxy events against a route script")]
struct Cli {
    /// TOML route script.
    #[arg(long)]
    script: PathBuf,
    /// JSON-lines file of proxy events.
    #[arg(long)]
    events: PathBuf,
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("tapwire: {err}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<bool, String> {
    let script = ScriptConfig::load(&cli.script)?;
    let events = std::fs::read_to_string(&cli.events)
        .map_err(|err| format!("{}: {err}", cli.events.display()))?;

    let (context, mut replies) = InterceptContext::start(script.engine.clone());
    for spec in &script.routes {
        let route = context
            .control()
            .intercept_callback(spec.matcher()?, spec.callback()?)
            .await
            .map_err(|err| err.to_string())?;
        tracing::debug!(route = %route, url = %spec.url, action = ?spec.action, "route loaded");
    }

    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        while let Some(reply) = replies.recv().await {
            match encode_reply(&reply) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "failed to encode reply"),
            }
            printed += 1;
        }
        printed
    });

    let mut emitted = 0usize;
    for (index, line) in events.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event = decode_event_line(line)
            .map_err(|err| format!("{} line {}: {err}", cli.events.display(), index + 1))?;
        context
            .control()
            .emit(event)
            .await
            .map_err(|err| err.to_string())?;
        emitted += 1;
    }

    let report = context.finish().await.map_err(|err| err.to_string())?;
    let printed = printer.await.map_err(|err| err.to_string())?;
    for failure in &report.failures {
        eprintln!("FAIL {failure}");
    }
    tracing::info!(
        events = emitted,
        replies = printed,
        failures = report.failures.len(),
        aborted = report.teardown.aborted_subscriptions,
        "replay finished"
    );
    Ok(report.passed())
}
