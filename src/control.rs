//! Periodic humidex check driving the plug
use log::{error, info, warn};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::appliance::{ApplianceEvent, PowerSwitch};
use crate::comfort::compute_comfort_index;
use crate::models::CycleReport;
use crate::utils::{format_datetime, on_off};
use crate::weather::{WeatherError, WeatherSource};

/// Settings of the control loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    pub interval: Duration,
    /// Humidex above which the appliance runs
    pub comfort_level: f64,
}

/// Whether the appliance should run for the given humidex
///
/// Strictly greater: a humidex equal to the comfort level means off.
pub fn decide(comfort_index: f64, comfort_level: f64) -> bool {
    comfort_index > comfort_level
}

pub struct ControlLoop<W, P> {
    config: LoopConfig,
    weather: W,
    plug: P,
}

impl<W, P> ControlLoop<W, P>
where
    W: WeatherSource,
    P: PowerSwitch,
{
    pub fn new(config: LoopConfig, weather: W, plug: P) -> Self {
        ControlLoop {
            config,
            weather,
            plug,
        }
    }

    /// Run one fetch, compute, decide, switch cycle
    ///
    /// The plug is only commanded when an observation was obtained.
    pub async fn run_cycle(&self) -> Result<CycleReport, WeatherError> {
        let observation = self.weather.fetch_observation().await?;
        let comfort_index =
            compute_comfort_index(observation.temperature, observation.relative_humidity);
        let power_on = decide(comfort_index, self.config.comfort_level);

        self.plug.set_power(power_on);

        Ok(CycleReport {
            time: OffsetDateTime::now_utc(),
            observation,
            comfort_index,
            comfort_level: self.config.comfort_level,
            power_on,
        })
    }

    /// Run cycles forever: once immediately, then every interval
    ///
    /// Cycles run one at a time. A tick that comes due while a cycle is
    /// still in flight is skipped rather than queued. Plug events received
    /// between cycles are logged.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ApplianceEvent>) {
        info!(
            "Starting humidex control loop (every {:?}, comfort level {})",
            self.config.interval, self.config.comfort_level
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                event = events.recv(), if events_open => match event {
                    Some(event) => log_event(&event),
                    None => {
                        warn!("Plug session ended, no further plug events");
                        events_open = false;
                    }
                },
            }
        }
    }

    async fn tick(&self) {
        match self.run_cycle().await {
            Ok(report) => log_report(&report),
            Err(e) => error!("Skipping cycle: {}", e),
        }
    }
}

fn log_report(report: &CycleReport) {
    let time = format_datetime(&report.time);
    info!(
        "{} T = {:.1}°C RH = {:.0}% Hx = {:.2}",
        time,
        report.observation.temperature,
        report.observation.relative_humidity,
        report.comfort_index
    );
    info!(
        "{} setting A/C to {}, comfort level is {}",
        time,
        on_off(report.power_on),
        report.comfort_level
    );
}

fn log_event(event: &ApplianceEvent) {
    match event {
        ApplianceEvent::Connected => info!("Connected to plug"),
        ApplianceEvent::Disconnected => warn!("Disconnected from plug"),
        ApplianceEvent::Data(data) => info!("Data from plug: {}", data),
        ApplianceEvent::Error(message) => error!("Plug error: {}", message),
    }
}
