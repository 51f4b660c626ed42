#![forbid(unsafe_code)]

//! Context configuration: serde structs with spec'd defaults and a TOML
//! loader.

mod loader;
mod root;

pub use loader::load_from_path;
pub use root::Config;
