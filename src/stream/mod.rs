pub mod decoder;
pub mod structured;
pub mod tag_stripper;

pub use decoder::{ChunkDecoder, Framing};
pub use structured::{PropertyKind, StructuredOutput};
pub use tag_stripper::TagStripper;
