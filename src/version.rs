//! Version information for the wssocks library

/// Current version of the wssocks library
pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Platform information (OS/architecture)
pub fn platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}
