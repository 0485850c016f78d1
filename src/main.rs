use std::env;

use log::{error, info};

use streamload::config::ClientConfig;
use streamload::driver::Driver;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "tracing")]
    console_subscriber::init();

    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::init_from_env(env);

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "streamload.json".to_string());

    let config = match ClientConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let stats = Driver::new(config)?.run().await?;
    info!("Final statistics: {}", serde_json::to_string(&stats)?);

    Ok(())
}
