//! Visitor country detection.
//!
//! [`AttributeOracle`] is the seam the session uses to learn where a visitor is.
//! [`HttpGeolocationOracle`] asks a list of public IP geolocation services in order and returns
//! the first country any of them reports.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value;

/// Resolves the visitor's country.
#[async_trait]
pub trait AttributeOracle: Send + Sync {
    /// Best-effort country detection. `None` means no country could be determined; callers fall
    /// back to a default country.
    async fn detect_country(&self) -> Option<String>;
}

/// An oracle that always answers with the same country. Useful when the country is known from
/// another source (e.g., a CDN header).
#[derive(Debug, Clone)]
pub struct FixedCountry(pub String);

#[async_trait]
impl AttributeOracle for FixedCountry {
    async fn detect_country(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A single geolocation backend.
#[derive(Debug, Clone)]
pub struct GeolocationService {
    /// Name used in logs.
    pub name: &'static str,
    /// Endpoint returning a JSON description of the caller's IP.
    pub url: String,
    /// Extract the country from the JSON body.
    pub extract_country: fn(&Value) -> Option<String>,
}

impl GeolocationService {
    /// `ipapi.co`: prefers the full `country_name`, falls back to the `country` code.
    pub fn ipapi_co() -> GeolocationService {
        GeolocationService {
            name: "ipapi.co",
            url: "https://ipapi.co/json/".to_owned(),
            extract_country: country_name_or_code,
        }
    }

    /// `ip-api.com`.
    pub fn ip_api_com() -> GeolocationService {
        GeolocationService {
            name: "ip-api.com",
            url: "http://ip-api.com/json/".to_owned(),
            extract_country: country_field,
        }
    }

    /// `ipwho.is`.
    pub fn ipwho_is() -> GeolocationService {
        GeolocationService {
            name: "ipwho.is",
            url: "https://ipwho.is/".to_owned(),
            extract_country: country_field,
        }
    }
}

fn country_name_or_code(body: &Value) -> Option<String> {
    string_field(body, "country_name").or_else(|| string_field(body, "country"))
}

fn country_field(body: &Value) -> Option<String> {
    string_field(body, "country")
}

fn string_field(body: &Value, field: &str) -> Option<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Detects the visitor's country by querying IP geolocation services in sequence.
///
/// No service is authoritative; the first one that answers with a country wins. Failures of
/// individual services are logged and skipped.
pub struct HttpGeolocationOracle {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    services: Vec<GeolocationService>,
}

impl HttpGeolocationOracle {
    /// Per-request timeout applied to each service.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

    /// Create an oracle using the default services.
    pub fn new() -> HttpGeolocationOracle {
        HttpGeolocationOracle::with_services(vec![
            GeolocationService::ipapi_co(),
            GeolocationService::ip_api_com(),
            GeolocationService::ipwho_is(),
        ])
    }

    /// Create an oracle querying `services` in the given order.
    pub fn with_services(services: Vec<GeolocationService>) -> HttpGeolocationOracle {
        let client = reqwest::Client::builder()
            .timeout(HttpGeolocationOracle::DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                log::warn!(target: "personalize", "failed to configure geolocation client, using defaults: {:?}", err);
                reqwest::Client::new()
            });
        HttpGeolocationOracle { client, services }
    }

    async fn query(&self, service: &GeolocationService) -> crate::Result<Option<String>> {
        let response = self
            .client
            .get(&service.url)
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        Ok((service.extract_country)(&body))
    }
}

impl Default for HttpGeolocationOracle {
    fn default() -> HttpGeolocationOracle {
        HttpGeolocationOracle::new()
    }
}

#[async_trait]
impl AttributeOracle for HttpGeolocationOracle {
    async fn detect_country(&self) -> Option<String> {
        for service in &self.services {
            log::trace!(target: "personalize", service = service.name; "querying geolocation service");
            match self.query(service).await {
                Ok(Some(country)) => {
                    log::debug!(target: "personalize", service = service.name, country = country.as_str(); "detected visitor country");
                    return Some(country);
                }
                Ok(None) => {
                    log::debug!(target: "personalize", service = service.name; "geolocation service returned no country");
                }
                Err(err) => {
                    log::warn!(target: "personalize", service = service.name; "geolocation service failed: {:?}", err);
                }
            }
        }

        log::warn!(target: "personalize", "all geolocation services failed");
        None
    }
}
