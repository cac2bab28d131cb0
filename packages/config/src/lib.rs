// ABOUTME: Rekindle configuration crate
// ABOUTME: Environment variable names and typed, range-checked settings

pub mod constants;
pub mod settings;

pub use settings::{AiSettings, ConsequenceSettings, RuntimeSettings, SosSettings};
