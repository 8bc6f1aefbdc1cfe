//! Process entry point: load configuration from the environment, set up structured
//! logging, and hand off to the library's `run` loop.

use echo_auto_mirror::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().map_err(|e| {
        eprintln!("{e}");
        anyhow::anyhow!("invalid configuration")
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    echo_auto_mirror::run(config).await
}
