//! Job descriptor normalization and validation.
//!
//! The dispatch host hands the worker a raw JSON payload, either as an
//! object or as a JSON-encoded string. [`validate_input`] turns it into a
//! [`JobDescriptor`]: the workflow graph is carried through untouched and
//! the legacy single `image` field is folded into the `images` list.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Key holding the opaque workflow graph.
pub const FIELD_WORKFLOW: &str = "workflow";

/// Legacy key holding a single input image.
pub const FIELD_IMAGE: &str = "image";

/// Key holding the list of input images.
pub const FIELD_IMAGES: &str = "images";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A normalized job ready to be run against the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Workflow graph in the engine's API format. Never inspected.
    pub workflow: serde_json::Value,
    /// Input images in submission order (possibly empty).
    #[serde(default)]
    pub images: Vec<ImagePayload>,
}

/// One input image as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// File name the engine stores the image under.
    pub name: String,
    /// Base64 data, optionally wrapped in a Data URI.
    pub image: String,
}

impl ImagePayload {
    /// Decode the payload into raw bytes.
    ///
    /// Anything up to and including the first `,` is treated as a
    /// Data-URI prefix (`data:image/png;base64,`) and stripped. ASCII
    /// whitespace anywhere in the data is ignored, so line-wrapped
    /// payloads decode.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let encoded = match self.image.split_once(',') {
            Some((_, data)) => data,
            None => self.image.as_str(),
        };
        let compact: String = encoded
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD.decode(compact)
    }
}

/// Reasons a raw job payload is rejected before any engine call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The payload was absent (`null`).
    #[error("Please provide input")]
    MissingInput,

    /// The payload string was not valid JSON, or not a JSON object.
    #[error("Invalid JSON format in input")]
    MalformedInput,

    /// A required field is absent.
    #[error("Missing '{0}' parameter")]
    MissingField(&'static str),

    /// The images field, or one of its entries, has the wrong shape.
    #[error("{0}")]
    InvalidImageShape(&'static str),
}

const MSG_IMAGES_NOT_LIST: &str = "'images' must be a list";
const MSG_IMAGE_ENTRY_SHAPE: &str = "Each image must contain 'name' and 'image' keys";

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate and normalize a raw job payload.
///
/// Accepts an object or a string containing JSON. A non-empty `images`
/// list wins over the legacy `image` field; an empty one falls back to it.
pub fn validate_input(raw: &serde_json::Value) -> Result<JobDescriptor, ValidationError> {
    let parsed;
    let input = match raw {
        serde_json::Value::Null => return Err(ValidationError::MissingInput),
        serde_json::Value::String(text) => {
            parsed = serde_json::from_str::<serde_json::Value>(text)
                .map_err(|_| ValidationError::MalformedInput)?;
            &parsed
        }
        other => other,
    };

    let object = input.as_object().ok_or(ValidationError::MalformedInput)?;

    let workflow = match object.get(FIELD_WORKFLOW) {
        None | Some(serde_json::Value::Null) => {
            return Err(ValidationError::MissingField(FIELD_WORKFLOW))
        }
        Some(workflow) => workflow.clone(),
    };

    let listed = match present(object, FIELD_IMAGES) {
        Some(list) => list
            .as_array()
            .ok_or(ValidationError::InvalidImageShape(MSG_IMAGES_NOT_LIST))?
            .iter()
            .map(parse_image_entry)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let images = match present(object, FIELD_IMAGE) {
        Some(single) if listed.is_empty() => vec![parse_image_entry(single)?],
        _ => listed,
    };

    Ok(JobDescriptor { workflow, images })
}

/// Look up a key, treating `null` as absent.
fn present<'a>(
    object: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<&'a serde_json::Value> {
    object.get(key).filter(|v| !v.is_null())
}

fn parse_image_entry(entry: &serde_json::Value) -> Result<ImagePayload, ValidationError> {
    let shape_err = ValidationError::InvalidImageShape(MSG_IMAGE_ENTRY_SHAPE);
    let object = entry.as_object().ok_or(shape_err.clone())?;

    let field = |key: &str| {
        object
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match (field("name"), field("image")) {
        (Some(name), Some(image)) => Ok(ImagePayload { name, image }),
        _ => Err(shape_err),
    }
}
