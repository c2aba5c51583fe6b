use std::{io, path::PathBuf};

use registry_image::{
    config::EnvSnapshot,
    resource::{put, PutRequest},
    RegistryImageError, RegistryImageResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Function: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> RegistryImageResult<()> {
    let src = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| RegistryImageError::config("source path argument is required"))?;

    let request: PutRequest = serde_json::from_reader(io::stdin())?;
    init_logging(*request.source.get_debug());

    let env = EnvSnapshot::from_process();
    let response = put(&request, &src, &env, None).await?;

    serde_json::to_writer(io::stdout(), &response)?;
    println!();

    Ok(())
}

/// Logs go to stderr; stdout carries the response JSON.
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
