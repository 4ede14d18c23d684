//! Payloads of the push events the feed reacts to.

use deal_utils::{Deal, DealId, MediaPatch};
use serde_json::Value;

use crate::error::EventError;

pub const NEW_DEAL_EVENT: &str = "new-deal";
pub const MEDIA_UPDATED_EVENT: &str = "image-updated";

/// An `image-updated` payload: new media fields for an already published deal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaUpdate {
    pub id: DealId,
    pub patch: MediaPatch,
}

fn deal_id(payload: &Value) -> Result<DealId, EventError> {
    match payload.get("id").and_then(Value::as_i64) {
        Some(id) if id != 0 => Ok(id),
        _ => Err(EventError::MissingId),
    }
}

/// A `new-deal` payload is a full deal. The id is checked before anything else so
/// a payload without one is reported as such rather than as a shape mismatch.
pub fn parse_new_deal(data: &str) -> Result<Deal, EventError> {
    let payload: Value = serde_json::from_str(data)?;
    deal_id(&payload)?;
    Ok(serde_json::from_value(payload)?)
}

pub fn parse_media_update(data: &str) -> Result<MediaUpdate, EventError> {
    let payload: Value = serde_json::from_str(data)?;
    let id = deal_id(&payload)?;
    let local_path = payload
        .get("localPath")
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .ok_or(EventError::MissingField("localPath"))?;
    let media_type = payload
        .get("mediaType")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(MediaUpdate {
        id,
        patch: MediaPatch {
            local_path: Some(local_path.to_string()),
            media_type,
        },
    })
}
