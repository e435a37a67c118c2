//! Current conditions from the Environment Canada citypage XML feed
use log::debug;
use roxmltree::{Document, Node};
use std::time::Duration;

use crate::models::Observation;
use crate::weather::{WeatherError, WeatherSource};

// Citypage document structure
const ROOT_ELEMENT: &str = "siteData";
const CURRENT_CONDITIONS: &str = "currentConditions";
const TEMPERATURE: &str = "temperature";
const RELATIVE_HUMIDITY: &str = "relativeHumidity";

/// HTTP client for one fixed weather endpoint
pub struct WeatherClient {
    client: reqwest::Client,
    url: String,
}

impl WeatherClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(WeatherClient {
            client,
            url: url.to_string(),
        })
    }
}

impl WeatherSource for WeatherClient {
    /// Fetch and parse the current conditions
    ///
    /// Every call is an independent round trip: no retry, no caching.
    async fn fetch_observation(&self) -> Result<Observation, WeatherError> {
        debug!("Fetching current conditions from {}", self.url);

        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        debug!("Received {} bytes of weather data", body.len());
        parse_observation(&body)
    }
}

/// Extract temperature and relative humidity from a citypage document
///
/// Reads the first `currentConditions` record under the `siteData` root.
/// Both fields are element text such as
/// `<temperature unitType="metric" units="C">22.4</temperature>`;
/// attributes are ignored.
///
/// # Returns
/// The observation, or `WeatherError::Parse` if the structure is not as
/// expected, a value is missing or not numeric, or the humidity is out of range
pub fn parse_observation(xml: &str) -> Result<Observation, WeatherError> {
    let document = Document::parse(xml)
        .map_err(|e| WeatherError::Parse(format!("invalid XML document: {}", e)))?;

    let root = document.root_element();
    if !root.has_tag_name(ROOT_ELEMENT) {
        return Err(WeatherError::Parse(format!(
            "unexpected root element <{}>",
            root.tag_name().name()
        )));
    }

    let current = child_element(root, CURRENT_CONDITIONS)?;
    let temperature = numeric_field(current, TEMPERATURE)?;
    let relative_humidity = numeric_field(current, RELATIVE_HUMIDITY)?;

    Observation::new(temperature, relative_humidity).map_err(|e| WeatherError::Parse(e.to_string()))
}

fn child_element<'a, 'input>(
    parent: Node<'a, 'input>,
    name: &str,
) -> Result<Node<'a, 'input>, WeatherError> {
    parent
        .children()
        .find(|node| node.is_element() && node.has_tag_name(name))
        .ok_or_else(|| {
            WeatherError::Parse(format!(
                "missing <{}> in <{}>",
                name,
                parent.tag_name().name()
            ))
        })
}

fn numeric_field(parent: Node<'_, '_>, name: &str) -> Result<f64, WeatherError> {
    let text = child_element(parent, name)?
        .text()
        .map(str::trim)
        .unwrap_or_default();

    if text.is_empty() {
        return Err(WeatherError::Parse(format!("<{}> has no value", name)));
    }

    text.parse::<f64>().map_err(|e| {
        WeatherError::Parse(format!("<{}> value '{}' is not a number: {}", name, text, e))
    })
}
