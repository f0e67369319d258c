use mixrelay::{init_tracing, load_config, run_runtime, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = load_config()?;
    tracing::info!("configuration loaded");
    tracing::debug!("{}", config);

    let state = AppState::initialize(config).await?;
    run_runtime(state).await?;

    Ok(())
}
