//! Humidex calculation from temperature and relative humidity

// Magnus formula coefficients over water (Sensirion application note)
const MAGNUS_BETA: f64 = 17.62;
const MAGNUS_LAMBDA: f64 = 243.12; // °C

const KELVIN_OFFSET: f64 = 273.15;
const HUMIDEX_VAPOR_COEFFICIENT: f64 = 5417.7530;

/// Compute the dew point for a temperature and relative humidity
///
/// `relative_humidity_percent` must be greater than zero; the logarithm is
/// undefined otherwise and the result will be NaN or infinite.
pub fn dew_point(temperature_c: f64, relative_humidity_percent: f64) -> f64 {
    let h = (relative_humidity_percent / 100.0).ln()
        + (MAGNUS_BETA * temperature_c) / (MAGNUS_LAMBDA + temperature_c);
    MAGNUS_LAMBDA * h / (MAGNUS_BETA - h)
}

/// Compute the humidex (perceived temperature) for the given conditions
///
/// The raw floating point value is returned without clamping or rounding.
/// Callers are responsible for rejecting non-positive humidity before
/// getting here (see `Observation::new`).
///
/// # Arguments
/// * `temperature_c` - Air temperature in degrees Celsius
/// * `relative_humidity_percent` - Relative humidity in percent, (0, 100]
pub fn compute_comfort_index(temperature_c: f64, relative_humidity_percent: f64) -> f64 {
    let dewpoint = dew_point(temperature_c, relative_humidity_percent);
    let vapor_pressure = 6.11
        * (HUMIDEX_VAPOR_COEFFICIENT
            * ((1.0 / KELVIN_OFFSET) - (1.0 / (KELVIN_OFFSET + dewpoint))))
        .exp();
    temperature_c + (5.0 / 9.0) * (vapor_pressure - 10.0)
}
