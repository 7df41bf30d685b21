use anyhow::Result;
use clap::Parser;
use log::info;

use tally_core::config::{DeploymentMode, PipelineConfig};
use tally_core::error_bail;
use tally_core::source::LocalFileSource;
use tally_core::tool::{init_log, wait_for_signal};
use tally_pipeline::pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/pipeline.toml")]
    config: String,
}

async fn serve(args: Args) -> Result<()> {
    let config = PipelineConfig::from_config_file(&args.config)?;

    if config.pipeline.mode == DeploymentMode::Distributed {
        error_bail!(
            "distributed mode is scheduled by the coordinator, not by this binary, coordinator_endpoint: {}",
            config
                .pipeline
                .coordinator_endpoint
                .clone()
                .unwrap_or_default()
        );
    }

    let source = LocalFileSource::new(&config.source)?;

    info!(
        "Starting pipeline..., config: {}, consumer_group: {}, store: {}",
        args.config,
        source.consumer_group(),
        config.sink.store
    );

    let pipeline = Pipeline::from_config(config)?;
    let report = pipeline.run_until(source, wait_for_signal()).await?;

    info!(
        "pipeline exit, pulled: {}, acked: {}, failed: {}",
        report.pulled, report.acked, report.failed
    );

    Ok(())
}

fn main() -> Result<()> {
    init_log();

    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(args))?;

    Ok(())
}
