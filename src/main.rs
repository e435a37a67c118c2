mod appliance;
mod comfort;
mod config;
mod control;
mod models;
mod utils;
mod weather;

use log::{error, info};

use config::AppConfig;
use control::ControlLoop;
use weather::WeatherClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AppConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    info!(
        "Controlling plug {} at {}",
        config.plug.device_id, config.plug.address
    );

    let weather = WeatherClient::new(&config.weather_url, config.weather_timeout)?;
    let (plug, plug_events) = appliance::spawn(config.plug.clone());
    let control = ControlLoop::new(config.loop_config(), weather, plug);

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            // Keep the sender alive so the control loop keeps running
            std::future::pending::<()>().await;
        }
        let _ = tx.send(());
    });

    // Run control loop until shutdown signal
    tokio::select! {
        _ = control.run(plug_events) => {}
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
