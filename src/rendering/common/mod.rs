/// Errors raised while turning archive records into the rendering IR.
pub mod errors;
/// basic types (e.g. mesh) to abstract away from both the archive format and the render backend.
pub mod types;
