use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;
use pos2idon::pipeline::read_product_list;
use pos2idon::{Pipeline, PipelineConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pos2idon")]
#[command(about = "Mask and classify atmospherically corrected Sentinel-2 products")]
#[command(version)]
struct Args {
    /// JSON run configuration
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Text file with one Sentinel-2 L1C product name per line
    #[arg(short, long, value_name = "FILE")]
    products: PathBuf,

    /// Write the run summary as JSON to this file
    #[arg(long, value_name = "FILE")]
    summary: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== POS2IDON ===");

    let config = PipelineConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    let products = read_product_list(&args.products)
        .with_context(|| format!("reading product list {}", args.products.display()))?;
    let pipeline = Pipeline::new(config).context("setting up the pipeline")?;

    let summary = pipeline.run(&products);

    if let Some(path) = &args.summary {
        std::fs::write(path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("writing summary {}", path.display()))?;
    }

    info!("=== Done! ===");
    Ok(())
}
