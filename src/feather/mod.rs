//! Feathers: declarative class definitions and their catalog

pub mod catalog;
pub mod models;
pub mod settings;

pub use catalog::Catalog;
pub use models::*;
pub use settings::{Setting, Settings};
