use std::process::ExitCode;

use anyhow::Result;

use pacer::cli::run;

#[allow(clippy::use_debug)]
#[tokio::main]
async fn main() -> Result<ExitCode> {
    run().await
}
