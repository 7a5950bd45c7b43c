//! Version information reported over the operator API.

use crate::bridge::protocol::PROTOCOL_VERSION;

/// Crate version from Cargo.toml.
pub const LDR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub ldr: &'static str,
    /// LDR wire protocol version spoken by this build.
    pub protocol: u16,
    /// Renderer program, if local rendering is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renderer: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            ldr: LDR_VERSION,
            protocol: PROTOCOL_VERSION,
            renderer: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renderer(mut self, renderer: impl Into<String>) -> Self {
        self.renderer = Some(renderer.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_crate_and_protocol_version() {
        let info = VersionInfo::new();
        assert_eq!(info.ldr, LDR_VERSION);
        assert_eq!(info.protocol, PROTOCOL_VERSION);
        assert!(info.renderer.is_none());
    }

    #[test]
    fn renderer_omitted_when_absent() {
        let json = serde_json::to_value(VersionInfo::new()).unwrap();
        assert!(json.get("renderer").is_none());

        let json = serde_json::to_value(VersionInfo::new().with_renderer("povray")).unwrap();
        assert_eq!(json["renderer"], "povray");
    }
}
