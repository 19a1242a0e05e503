//! Analytics payloads sent alongside impressions.
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{impressions::RenderEpoch, ShortAlias};

/// Event sent after a batch of impressions has been attempted.
pub const IMPRESSIONS_TRACKED_EVENT: &str = "variant_impressions_tracked";
/// Event sent when a product detail page is shown.
pub const PRODUCT_VIEWED_EVENT: &str = "product_viewed";
/// Event sent when a product list (homepage, category, search) is shown.
pub const PRODUCT_LIST_VIEWED_EVENT: &str = "product_list_viewed";
/// Event sent when the visitor overrides the detected currency.
pub const MANUAL_CURRENCY_OVERRIDE_EVENT: &str = "manual_currency_override";

/// Kind of page that displayed personalized content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    /// The storefront homepage.
    Homepage,
    /// A category listing.
    Category,
    /// Search results.
    Search,
    /// The full product listing.
    All,
    /// A single product.
    ProductDetail,
}

impl PageType {
    /// Whether the page lists several products.
    pub fn is_listing(self) -> bool {
        !matches!(self, PageType::ProductDetail)
    }
}

/// Where and when personalized content was displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayContext {
    /// Page that displayed the content.
    pub page: PageType,
    /// Content type of the displayed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Products shown on the page.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<String>,
    /// Epoch of the variant set the content was fetched for.
    pub render_epoch: RenderEpoch,
    /// Additional fields copied verbatim into analytics payloads.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DisplayContext {
    /// Create a context for `page` rendered with the variants of `render_epoch`.
    pub fn new(page: PageType, render_epoch: RenderEpoch) -> DisplayContext {
        DisplayContext {
            page,
            content_type: None,
            product_ids: Vec::new(),
            render_epoch,
            extra: Map::new(),
        }
    }

    /// Set the displayed content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> DisplayContext {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the displayed products.
    pub fn with_products<I, S>(mut self, product_ids: I) -> DisplayContext
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.product_ids = product_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Attach an additional analytics field.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> DisplayContext {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Page the content was displayed on. Listings are identified by their type, product pages
    /// also by their product.
    pub(crate) fn page_key(&self) -> PageKey {
        PageKey {
            page: self.page,
            products: if self.page.is_listing() {
                Vec::new()
            } else {
                self.product_ids.clone()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageKey {
    page: PageType,
    products: Vec<String>,
}

/// Auxiliary audit event describing one impression batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionBatchEvent<'a> {
    /// Every alias in the batch, including ones already reported earlier in the epoch.
    pub short_uids: &'a [ShortAlias],
    /// Number of aliases in the batch.
    pub count: usize,
    /// Display context of the batch.
    #[serde(flatten)]
    pub context: &'a DisplayContext,
    /// When the batch was attempted.
    pub timestamp: DateTime<Utc>,
}

impl ImpressionBatchEvent<'_> {
    /// Serialize into an event payload.
    pub fn to_payload(&self) -> Value {
        // Serializing plain strings, numbers and maps never fails.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Attach a timestamp to an arbitrary event payload. Non-object payloads are wrapped under
/// `"value"`.
pub(crate) fn timestamped(payload: Value) -> Value {
    let mut object = match payload {
        Value::Object(object) => object,
        Value::Null => Map::new(),
        other => {
            let mut object = Map::new();
            object.insert("value".to_owned(), other);
            object
        }
    };
    object.insert(
        "timestamp".to_owned(),
        Value::String(Utc::now().to_rfc3339()),
    );
    Value::Object(object)
}
