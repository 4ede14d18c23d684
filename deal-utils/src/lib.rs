pub mod filters;
pub mod price;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub use filters::{FilterCriteria, matches};

pub type DealId = i64;

/// A single deal as served by the deals backend.
///
/// Deals are immutable once shown, except for the media fields, which may arrive
/// empty and be filled in by a later `image-updated` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: DealId,
    /// Payloads without one are stamped on arrival.
    #[serde(rename = "ts", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    /// Price in centavos.
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub coupons: Vec<Coupon>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
}

impl Deal {
    pub fn has_coupons(&self) -> bool {
        !self.coupons.is_empty()
    }

    /// Whether the deal has everything needed to show its picture.
    pub fn has_media(&self) -> bool {
        self.media_type.is_some() && self.local_path.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Merge the populated fields of `patch` into this deal.
    pub fn apply_media_patch(&mut self, patch: &MediaPatch) {
        if let Some(local_path) = &patch.local_path {
            self.local_path = Some(local_path.clone());
        }
        if let Some(media_type) = &patch.media_type {
            self.media_type = Some(media_type.clone());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One page of the cursor-paginated deals listing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: Vec<Deal>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_stores: Option<Vec<String>>,
}

/// Partial update for the media fields of a deal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaPatch {
    pub local_path: Option<String>,
    pub media_type: Option<String>,
}

impl MediaPatch {
    pub fn local_path(local_path: impl Into<String>) -> Self {
        Self {
            local_path: Some(local_path.into()),
            media_type: None,
        }
    }
}

// The backend sends `null` for empty collections on some rows.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
