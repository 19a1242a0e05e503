//! An HTTP client for the personalization edge API.
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    connection::{Connection, PersonalizationClient},
    Error, Result, ShortAlias, VisitorAttributes, VisitorId,
};

pub const DEFAULT_EDGE_BASE_URL: &str = "https://personalize-edge.contentstack.com";

const MANIFEST_ENDPOINT: &str = "/manifest";
const USER_ATTRIBUTES_ENDPOINT: &str = "/user-attributes";
const EVENTS_ENDPOINT: &str = "/events";

const PROJECT_UID_HEADER: &str = "x-project-uid";
const USER_UID_HEADER: &str = "x-cs-personalize-user-uid";

/// Experiences and the variants currently active for a visitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub experiences: Vec<ManifestExperience>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestExperience {
    pub short_uid: String,
    /// `None` if the visitor matches no audience of this experience.
    #[serde(default)]
    pub active_variant_short_uid: Option<String>,
}

impl Manifest {
    /// Composite identifiers (`cs_personalize_<experience>_<variant>`) of all active variants.
    pub fn variant_identifiers(&self) -> Vec<String> {
        self.experiences
            .iter()
            .filter_map(|experience| {
                let variant = experience.active_variant_short_uid.as_deref()?;
                Some(format!("cs_personalize_{}_{}", experience.short_uid, variant))
            })
            .collect()
    }

    /// Experiences in which `alias` is the active variant.
    pub fn experiences_showing<'a>(&'a self, alias: &'a ShortAlias) -> impl Iterator<Item = &'a str> {
        self.experiences
            .iter()
            .filter(move |experience| {
                experience.active_variant_short_uid.as_deref() == Some(alias.as_str())
            })
            .map(|experience| experience.short_uid.as_str())
    }
}

/// [`PersonalizationClient`] talking to the edge API over HTTP.
///
/// One connection serves every visitor. Each request carries the visitor's [`VisitorId`] as the
/// user uid.
#[derive(Debug, Clone)]
pub struct EdgeClient {
    // Client holds a connection pool internally, so we're reusing the client between connections.
    http: reqwest::Client,
    base_url: String,
}

impl EdgeClient {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBaseUrl`] if `base_url` is not a valid URL.
    pub fn new(base_url: impl Into<String>) -> Result<EdgeClient> {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Url::parse(&base_url).map_err(Error::InvalidBaseUrl)?;
        Ok(EdgeClient {
            http: reqwest::Client::new(),
            base_url,
        })
    }
}

#[async_trait]
impl PersonalizationClient for EdgeClient {
    async fn init(&self, project_uid: &str) -> Result<Arc<dyn Connection>> {
        let connection = EdgeConnection {
            http: self.http.clone(),
            manifest_url: endpoint(&self.base_url, MANIFEST_ENDPOINT)?,
            user_attributes_url: endpoint(&self.base_url, USER_ATTRIBUTES_ENDPOINT)?,
            events_url: endpoint(&self.base_url, EVENTS_ENDPOINT)?,
            project_uid: project_uid.to_owned(),
            visitors: RwLock::new(HashMap::new()),
        };
        log::debug!(target: "personalize", project_uid; "connecting to personalization edge");

        // A manifest for a throwaway visitor proves the project uid is accepted.
        connection
            .fetch_manifest(&VisitorId::random())
            .await
            .map_err(|err| Error::connection(format!("failed to fetch manifest: {err}")))?;
        Ok(Arc::new(connection))
    }
}

fn endpoint(base_url: &str, path: &str) -> Result<Url> {
    Url::parse(&format!("{}{}", base_url, path)).map_err(Error::InvalidBaseUrl)
}

/// What the edge API holds for one visitor, as last seen by this connection.
#[derive(Debug, Default)]
struct VisitorState {
    manifest: Manifest,
    /// Attribute names present in the last accepted submission.
    submitted: BTreeSet<String>,
}

/// Connection shared by all visitors of a project.
pub struct EdgeConnection {
    http: reqwest::Client,
    manifest_url: Url,
    user_attributes_url: Url,
    events_url: Url,
    project_uid: String,
    visitors: RwLock<HashMap<VisitorId, VisitorState>>,
}

impl EdgeConnection {
    /// Number of visitors with state held by this connection.
    pub fn visitor_count(&self) -> usize {
        self.visitors.read().map(|visitors| visitors.len()).unwrap_or(0)
    }

    fn request(&self, method: reqwest::Method, url: &Url, visitor: &VisitorId) -> reqwest::RequestBuilder {
        self.http
            .request(method, url.clone())
            .header(PROJECT_UID_HEADER, &self.project_uid)
            .header(USER_UID_HEADER, visitor.as_str())
    }

    async fn fetch_manifest(&self, visitor: &VisitorId) -> Result<Manifest> {
        log::trace!(target: "personalize", visitor = visitor; "fetching manifest");
        let response = self
            .request(reqwest::Method::GET, &self.manifest_url, visitor)
            .send()
            .await?;
        let response = check_status(response)?;
        let manifest: Manifest = response.json().await?;

        log::trace!(target: "personalize", visitor = visitor, experiences = manifest.experiences.len(); "fetched manifest");
        Ok(manifest)
    }

    fn update_visitor(&self, visitor: &VisitorId, update: impl FnOnce(&mut VisitorState)) {
        // Err() only if the lock is poisoned. The previous state stays in place then.
        if let Ok(mut visitors) = self.visitors.write() {
            update(visitors.entry(visitor.clone()).or_default());
        }
    }

    async fn post_events(&self, visitor: &VisitorId, events: &[Value]) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &self.events_url, visitor)
            .json(events)
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }
}

/// Body of a user-attributes PATCH replacing the `previous` submission with `attributes`.
///
/// The edge API merges PATCH bodies into what it holds, so names submitted before but absent now
/// are sent as `null` to clear them.
fn user_attributes_body(previous: &BTreeSet<String>, attributes: &VisitorAttributes) -> Map<String, Value> {
    let mut body = previous
        .iter()
        .filter(|name| attributes.get(name.as_str()).is_none())
        .map(|name| (name.clone(), Value::Null))
        .collect::<Map<_, _>>();
    for (name, value) in attributes.iter() {
        body.insert(name.to_owned(), Value::String(value.to_owned()));
    }
    body
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    response.error_for_status().map_err(|err| {
        if err.status() == Some(StatusCode::UNAUTHORIZED) {
            log::warn!(target: "personalize", "personalization edge rejected the project uid");
        } else {
            log::warn!(target: "personalize", "received non-200 response from personalization edge: {:?}", err);
        }
        Error::from(err)
    })
}

#[async_trait]
impl Connection for EdgeConnection {
    async fn set_attributes(&self, visitor: &VisitorId, attributes: &VisitorAttributes) -> Result<()> {
        let previous = self
            .visitors
            .read()
            .ok()
            .and_then(|visitors| visitors.get(visitor).map(|state| state.submitted.clone()))
            .unwrap_or_default();
        let body = user_attributes_body(&previous, attributes);

        let response = self
            .request(reqwest::Method::PATCH, &self.user_attributes_url, visitor)
            .json(&body)
            .send()
            .await?;
        check_status(response)?;
        self.update_visitor(visitor, |state| {
            state.submitted = attributes.iter().map(|(name, _)| name.to_owned()).collect();
        });

        let manifest = self.fetch_manifest(visitor).await?;
        self.update_visitor(visitor, |state| state.manifest = manifest);
        Ok(())
    }

    fn variant_identifiers(&self, visitor: &VisitorId) -> Vec<String> {
        self.visitors
            .read()
            .ok()
            .and_then(|visitors| visitors.get(visitor).map(|state| state.manifest.variant_identifiers()))
            .unwrap_or_default()
    }

    async fn record_impression(&self, visitor: &VisitorId, alias: &ShortAlias) -> Result<()> {
        let events = {
            let visitors = self
                .visitors
                .read()
                .map_err(|_| Error::connection("manifest unavailable"))?;
            visitors
                .get(visitor)
                .map(|state| {
                    state
                        .manifest
                        .experiences_showing(alias)
                        .map(|experience| {
                            json!({
                                "type": "IMPRESSION",
                                "experienceShortUid": experience,
                                "variantShortUid": alias,
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        if events.is_empty() {
            return Err(Error::connection(format!(
                "no active experience shows variant {alias} to visitor {visitor}"
            )));
        }
        self.post_events(visitor, &events).await
    }

    async fn record_event(&self, visitor: &VisitorId, name: &str, payload: Value) -> Result<()> {
        self.post_events(
            visitor,
            &[json!({
                "type": "EVENT",
                "eventKey": name,
                "data": payload,
            })],
        )
        .await
    }

    fn forget_visitor(&self, visitor: &VisitorId) {
        if let Ok(mut visitors) = self.visitors.write() {
            visitors.remove(visitor);
        }
    }
}
