use time::OffsetDateTime;

/// Current weather conditions for the configured location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub temperature: f64,
    pub relative_humidity: f64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ObservationError {
    #[error("Temperature is not a finite number: {0}")]
    Temperature(f64),
    #[error("Relative humidity must be in (0, 100], got {0}")]
    Humidity(f64),
}

impl Observation {
    /// Build an observation, rejecting values the humidex cannot be computed from
    pub fn new(temperature: f64, relative_humidity: f64) -> Result<Self, ObservationError> {
        if !temperature.is_finite() {
            return Err(ObservationError::Temperature(temperature));
        }
        if !(relative_humidity > 0.0 && relative_humidity <= 100.0) {
            return Err(ObservationError::Humidity(relative_humidity));
        }
        Ok(Observation {
            temperature,
            relative_humidity,
        })
    }
}

/// Outcome of one completed control cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub time: OffsetDateTime,
    pub observation: Observation,
    pub comfort_index: f64,
    pub comfort_level: f64,
    pub power_on: bool,
}
