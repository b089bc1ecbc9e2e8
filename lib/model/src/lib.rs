//! The project model consumed by the convergence engine.
//!
//! A [Project] is the fully resolved output of the external project
//! loader: profiles applied, variables interpolated, paths made
//! absolute. Nothing in this crate reads files other than
//! [Project::from_yaml_file], which deserializes an already
//! interpolated document.

mod project;
mod service;
mod validate;

pub use project::*;
pub use service::*;
pub use validate::ValidationError;
