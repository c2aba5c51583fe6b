use std::io;

use registry_image::{
    config::EnvSnapshot,
    resource::{check, CheckRequest},
    RegistryImageResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Function: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> RegistryImageResult<()> {
    let request: CheckRequest = serde_json::from_reader(io::stdin())?;
    init_logging(*request.source.get_debug());

    let env = EnvSnapshot::from_process();
    let versions = check(&request, &env).await?;

    serde_json::to_writer(io::stdout(), &versions)?;
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
