use std::time::Duration;

use crate::{
    edge_client::DEFAULT_EDGE_BASE_URL, session::SessionSettings, ContentUidTable,
    CurrencyCountries, Personalizer, Result, VariantResolver, DEFAULT_COUNTRY,
};

/// Configuration for [`Personalizer`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use personalize::PersonalizeConfig;
/// let config = PersonalizeConfig::from_project_uid("project-uid")
///     .resolve_timeout(Duration::from_secs(2))
///     .default_country("India");
/// ```
#[derive(Debug, Clone)]
pub struct PersonalizeConfig {
    pub(crate) project_uid: Option<String>,
    pub(crate) edge_base_url: String,
    pub(crate) resolve_timeout: Duration,
    pub(crate) init_timeout: Duration,
    pub(crate) detection_timeout: Duration,
    pub(crate) default_country: String,
    pub(crate) content_uids: ContentUidTable,
    pub(crate) currency_countries: CurrencyCountries,
}

impl PersonalizeConfig {
    /// Environment variable holding the project uid.
    pub const PROJECT_UID_ENV: &'static str = "PERSONALIZE_PROJECT_UID";

    /// Default base URL for the edge API.
    pub const DEFAULT_EDGE_BASE_URL: &'static str = DEFAULT_EDGE_BASE_URL;

    /// Default timeout for one attribute round trip.
    pub const DEFAULT_RESOLVE_TIMEOUT: Duration = VariantResolver::DEFAULT_TIMEOUT;

    /// Default timeout for establishing the connection.
    pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default timeout for country detection.
    pub const DEFAULT_DETECTION_TIMEOUT: Duration = SessionSettings::DEFAULT_DETECTION_TIMEOUT;

    /// Create a default configuration for the specified project.
    ///
    /// ```
    /// # use personalize::PersonalizeConfig;
    /// PersonalizeConfig::from_project_uid("project-uid");
    /// ```
    pub fn from_project_uid(project_uid: impl Into<String>) -> Self {
        PersonalizeConfig::with_project_uid(Some(project_uid.into()))
    }

    /// Create a default configuration, reading the project uid from `PERSONALIZE_PROJECT_UID`.
    ///
    /// A missing variable is not an error here. Personalization then reports
    /// [`Error::NotConfigured`](crate::Error::NotConfigured) and content falls back to defaults.
    pub fn from_env() -> Self {
        let project_uid = std::env::var(PersonalizeConfig::PROJECT_UID_ENV).ok();
        if project_uid.is_none() {
            log::warn!(target: "personalize", "{} is not set, personalization is disabled", PersonalizeConfig::PROJECT_UID_ENV);
        }
        PersonalizeConfig::with_project_uid(project_uid)
    }

    fn with_project_uid(project_uid: Option<String>) -> Self {
        PersonalizeConfig {
            project_uid,
            edge_base_url: PersonalizeConfig::DEFAULT_EDGE_BASE_URL.to_owned(),
            resolve_timeout: PersonalizeConfig::DEFAULT_RESOLVE_TIMEOUT,
            init_timeout: PersonalizeConfig::DEFAULT_INIT_TIMEOUT,
            detection_timeout: PersonalizeConfig::DEFAULT_DETECTION_TIMEOUT,
            default_country: DEFAULT_COUNTRY.to_owned(),
            content_uids: ContentUidTable::default(),
            currency_countries: CurrencyCountries::default(),
        }
    }

    /// Override base URL for edge API calls. Clients should use the default setting in most cases.
    pub fn edge_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.edge_base_url = base_url.into();
        self
    }

    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn detection_timeout(mut self, timeout: Duration) -> Self {
        self.detection_timeout = timeout;
        self
    }

    /// Country used when detection fails.
    pub fn default_country(mut self, country: impl Into<String>) -> Self {
        self.default_country = country.into();
        self
    }

    /// Content variant uid for each currency.
    pub fn content_uids(mut self, content_uids: ContentUidTable) -> Self {
        self.content_uids = content_uids;
        self
    }

    /// Country submitted for each manually chosen currency.
    pub fn currency_countries(mut self, currency_countries: CurrencyCountries) -> Self {
        self.currency_countries = currency_countries;
        self
    }

    pub fn project_uid(&self) -> Option<&str> {
        self.project_uid.as_deref()
    }

    pub(crate) fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            detection_timeout: self.detection_timeout,
            default_country: self.default_country.clone(),
            currency_countries: self.currency_countries.clone(),
        }
    }

    /// Create a [`Personalizer`] talking to the edge API.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the edge base URL is invalid.
    pub fn to_personalizer(self) -> Result<Personalizer> {
        Personalizer::from_edge(self)
    }
}
