//! Currencies offered by the storefront and their relationship to visitor countries.
use std::{collections::HashMap, str::FromStr, sync::OnceLock};

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Country used whenever detection fails or a currency has no dedicated audience.
pub const DEFAULT_COUNTRY: &str = "United States of America";

const EURO_COUNTRY_CODES: [&str; 11] = [
    "DE", "FR", "IT", "ES", "NL", "BE", "AT", "PT", "FI", "IE", "GR",
];

/// A display currency.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// US dollar.
    #[display("USD")]
    Usd,
    /// Euro.
    #[display("EUR")]
    Eur,
    /// Indian rupee.
    #[display("INR")]
    Inr,
}

impl Currency {
    /// Every supported currency.
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Eur, Currency::Inr];

    /// ISO 4217 code.
    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Inr => "INR",
        }
    }

    /// Symbol used when formatting prices.
    pub fn symbol(self) -> &'static str {
        match self {
            Currency::Usd => "$",
            Currency::Eur => "€",
            Currency::Inr => "₹",
        }
    }

    /// Suggest a currency for a detected country name.
    ///
    /// Matches both full names ("United States of America", "India") and short codes ("US",
    /// "USA", "IN"), case-insensitively. Anything else falls back to USD.
    pub fn suggest_for_country(country: &str) -> Currency {
        let country = country.trim().to_lowercase();
        if country.contains("united states") || country == "us" || country == "usa" {
            Currency::Usd
        } else if country.contains("india") || country == "in" {
            Currency::Inr
        } else {
            Currency::Usd
        }
    }

    /// Map an ISO 3166 alpha-2 country code to a currency. Euro-zone members map to EUR.
    pub fn for_country_code(code: &str) -> Currency {
        let code = code.trim().to_uppercase();
        if code == "IN" {
            Currency::Inr
        } else if EURO_COUNTRY_CODES.contains(&code.as_str()) {
            Currency::Eur
        } else {
            Currency::Usd
        }
    }
}

/// Error returned when parsing an unsupported currency code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported currency: {0}")]
pub struct UnknownCurrency(pub String);

impl FromStr for Currency {
    type Err = UnknownCurrency;

    fn from_str(s: &str) -> Result<Currency, UnknownCurrency> {
        match s.trim().to_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "INR" => Ok(Currency::Inr),
            _ => Err(UnknownCurrency(s.to_owned())),
        }
    }
}

/// Inverse mapping from a manually selected currency to the country the personalization audience
/// matches on.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyCountries {
    countries: HashMap<Currency, String>,
}

impl CurrencyCountries {
    /// Set the audience country for `currency`.
    pub fn with(mut self, currency: Currency, country: impl Into<String>) -> CurrencyCountries {
        self.countries.insert(currency, country.into());
        self
    }

    /// Country to submit for `currency`. Currencies without an entry use [`DEFAULT_COUNTRY`].
    pub fn country_for(&self, currency: Currency) -> &str {
        self.countries
            .get(&currency)
            .map(String::as_str)
            .unwrap_or(DEFAULT_COUNTRY)
    }
}

impl Default for CurrencyCountries {
    fn default() -> CurrencyCountries {
        // There is no euro audience; EUR visitors are matched as US visitors and only the content
        // uid differs.
        CurrencyCountries {
            countries: HashMap::new(),
        }
        .with(Currency::Usd, DEFAULT_COUNTRY)
        .with(Currency::Inr, "India")
        .with(Currency::Eur, DEFAULT_COUNTRY)
    }
}

/// Format a CMS price string for display.
///
/// Prices that already carry a currency symbol are returned untouched. Otherwise everything but
/// digits and separators is stripped and the currency symbol is prepended. Empty prices render as
/// `"N/A"`.
///
/// ```
/// # use personalize::{format_price, Currency};
/// assert_eq!(format_price("1,299.00", Currency::Inr), "₹1,299.00");
/// assert_eq!(format_price("$59", Currency::Inr), "$59");
/// ```
pub fn format_price(price: &str, currency: Currency) -> String {
    static HAS_SYMBOL: OnceLock<Regex> = OnceLock::new();
    static NON_NUMERIC: OnceLock<Regex> = OnceLock::new();

    if price.trim().is_empty() {
        return "N/A".to_owned();
    }

    let has_symbol = HAS_SYMBOL.get_or_init(|| Regex::new("[₹€$]").expect("valid regex"));
    if has_symbol.is_match(price) {
        return price.to_owned();
    }

    let non_numeric = NON_NUMERIC.get_or_init(|| Regex::new("[^0-9.,]").expect("valid regex"));
    format!("{}{}", currency.symbol(), non_numeric.replace_all(price, ""))
}
