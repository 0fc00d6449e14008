/// Format backends for the dispatcher.
///
/// Each backend exposes a `parse_<format>` function converting raw text
/// into canonical documents plus the detected file kind.
pub mod yaml;
pub use yaml::parse_yaml;

pub mod json;
pub use json::parse_json;

pub mod terraform;
pub use terraform::parse_terraform;

pub mod dockerfile;
pub use dockerfile::parse_dockerfile;
