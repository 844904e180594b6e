//! Classification proposals produced outside the engine, typically by a language model.
//! Parsing lives here; acceptance is decided by `domain::contract`.

pub mod json;

pub use json::{extract_json, parse_batch, parse_proposal};
