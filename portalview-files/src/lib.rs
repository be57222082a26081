use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Pixel format {raw:#x} is not supported")]
    UnsupportedPixelFormat { raw: u32 },

    #[error("Object id {id} does not classify as {expected:?}")]
    KindMismatch { id: ObjectId, expected: ObjectKind },

    #[error("The record is violating the expected format, because: {reason}")]
    FormatError { reason: &'static str },
}

pub mod object;
pub mod source;
pub mod surface;

pub use object::types::{ObjectId, ObjectKind};
