//! Event intake: decoding queue payloads, eligibility filtering and the HTTP
//! client for the parsing service

mod decoder;
pub mod external_parser;
mod filter;

pub use decoder::{decode_event, DecodeError};
pub use external_parser::ExternalParser;
pub use filter::{EventFilter, Ineligible};
