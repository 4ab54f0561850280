//! Connection information negotiated during a device handshake.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Protocol version this host announces in its connect message.
pub const PROTOCOL_VERSION: u32 = 0x0100_0001;

/// Largest payload this host accepts in a single packet.
pub const MAX_PAYLOAD: u32 = 256 * 1024;

/// How the handshake authenticated the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthOutcome {
    /// The device does not require authentication.
    NotRequired,
    /// A previously stored key was accepted.
    StoredKey,
    /// A newly generated key was accepted (and persisted).
    NewKey,
}

/// Identity properties parsed from the device's connect banner.
///
/// The banner looks like
/// `device::ro.product.name=sdk;ro.product.model=Pixel;ro.product.device=generic;features=shell_v2,cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceBanner {
    /// Connection type reported by the device, usually `device`.
    pub kind: String,
    /// Serial number, when the banner carries one.
    pub serial: Option<String>,
    /// `ro.product.name`
    pub product: Option<String>,
    /// `ro.product.model`
    pub model: Option<String>,
    /// `ro.product.device`
    pub device: Option<String>,
    /// Feature flags advertised by the device.
    pub features: Vec<String>,
}

impl DeviceBanner {
    /// Parses a connect banner.
    pub fn parse(banner: &str) -> Result<Self> {
        let banner = banner.trim_end_matches('\0');
        let mut parts = banner.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        if kind.is_empty() {
            return Err(ProtocolError::MalformedResponse(format!(
                "device banner has no connection type: {banner:?}"
            )));
        }
        let serial = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let properties = parts.next().ok_or_else(|| {
            ProtocolError::MalformedResponse(format!("device banner has no properties: {banner:?}"))
        })?;

        let mut parsed = DeviceBanner {
            kind: kind.to_string(),
            serial,
            ..Default::default()
        };

        for entry in properties.split(';').filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match key {
                "ro.product.name" => parsed.product = Some(value.to_string()),
                "ro.product.model" => parsed.model = Some(value.to_string()),
                "ro.product.device" => parsed.device = Some(value.to_string()),
                "features" => {
                    parsed.features = value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                _ => {}
            }
        }

        Ok(parsed)
    }

    /// Returns true if the device advertised the given feature.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Device identity from the banner.
    pub banner: DeviceBanner,
    /// Protocol version negotiated with the device.
    pub protocol_version: u32,
    /// Largest payload the device accepts.
    pub max_payload: u32,
    /// How the host was authenticated.
    pub auth: AuthOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_banner() {
        let banner = DeviceBanner::parse(
            "device::ro.product.name=sdk_phone;ro.product.model=Pixel 7;ro.product.device=panther;features=shell_v2,cmd,stat_v2",
        )
        .unwrap();

        assert_eq!(banner.kind, "device");
        assert_eq!(banner.serial, None);
        assert_eq!(banner.product.as_deref(), Some("sdk_phone"));
        assert_eq!(banner.model.as_deref(), Some("Pixel 7"));
        assert_eq!(banner.device.as_deref(), Some("panther"));
        assert_eq!(banner.features, vec!["shell_v2", "cmd", "stat_v2"]);
        assert!(banner.has_feature("cmd"));
        assert!(!banner.has_feature("abb"));
    }

    #[test]
    fn test_parse_banner_with_serial_and_trailing_nul() {
        let banner = DeviceBanner::parse("device:emulator-5554:ro.product.model=x;\0").unwrap();
        assert_eq!(banner.serial.as_deref(), Some("emulator-5554"));
        assert_eq!(banner.model.as_deref(), Some("x"));
        assert!(banner.features.is_empty());
    }

    #[test]
    fn test_parse_banner_ignores_unknown_keys() {
        let banner = DeviceBanner::parse("recovery::ro.build.id=abc;junk").unwrap();
        assert_eq!(banner.kind, "recovery");
        assert_eq!(banner.product, None);
    }

    #[test]
    fn test_parse_banner_without_properties_fails() {
        assert!(matches!(
            DeviceBanner::parse("device"),
            Err(ProtocolError::MalformedResponse(_))
        ));
        assert!(DeviceBanner::parse("").is_err());
    }

    #[test]
    fn test_connection_info_serialization() {
        let info = ConnectionInfo {
            banner: DeviceBanner::parse("device::ro.product.model=m;").unwrap(),
            protocol_version: PROTOCOL_VERSION,
            max_payload: MAX_PAYLOAD,
            auth: AuthOutcome::StoredKey,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"stored_key\""));
        let restored: ConnectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, info);
    }
}
