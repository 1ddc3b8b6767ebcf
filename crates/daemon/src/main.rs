use clap::Parser;

use hdfs_mount::cli::Args;
use hdfs_mount::{logging, process};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = logging::init(&args.log_level);

    if let Err(e) = process::run(args).await {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
