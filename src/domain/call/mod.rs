//! Call bounded context - value objects describing a call's lifecycle

pub mod value_object;

pub use value_object::{CallDirection, CallState};
