pub mod decoder;
pub mod fields;
pub mod line;

pub use decoder::decode;
pub use fields::{decode_fields, quote, FieldValue};
pub use line::LineAssembler;
