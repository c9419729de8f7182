pub mod config;
pub mod entities;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod ports;
pub mod source;
pub mod use_cases;

pub use error::{DeltaError, Error};
