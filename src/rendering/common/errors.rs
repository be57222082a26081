use portalview_files::{ObjectId, RecordError};
use thiserror::Error;

/// Everything that can make the preparation of a single object fail. None of these leave the
/// resource manager, they are logged and the object simply isn't rendered.
#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("Required {kind} record {id:#010X} is missing")]
    MissingRecord { kind: &'static str, id: u32 },

    #[error("Object {id} does not resolve to a leaf or a composite")]
    UnknownObject { id: ObjectId },

    #[error("Surface {surface_id:#010X} is invalid: {reason}")]
    InvalidSurface { surface_id: u32, reason: String },

    #[error("Object {id} is invalid: {reason}")]
    InvalidGeometry { id: ObjectId, reason: String },

    #[error("Object {id} is referenced by itself (composite cycle)")]
    CompositeCycle { id: ObjectId },

    #[error("Surface {surface_id:#010X} cannot be decoded")]
    UnsupportedFormat {
        surface_id: u32,
        #[source]
        source: RecordError,
    },

    #[error("Preparation has been cancelled")]
    Cancelled,
}

impl PrepareError {
    pub fn missing(kind: &'static str, id: u32) -> Self {
        PrepareError::MissingRecord { kind, id }
    }
}
