use anyhow::Context;
use clap::Parser;
use flock::{Config, Flock, job, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = flock::config::Args::parse();

    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.log_format)?;
    tracing::debug!("{:?}", args);

    let engine = Flock::from_config(&config)?;
    let Some(path) = args.job.as_deref() else {
        tracing::info!(models = engine.catalog().len(), "No job given, nothing to run");
        return Ok(());
    };

    let job = job::Job::from_path(path)?;
    let report = job::run(&engine, &job).await.context("job failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
