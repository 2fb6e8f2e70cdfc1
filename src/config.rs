//! Configuration document: load, migrate, and validate.
//!
//! The document on disk may be a v1 (flat, single hub, no `version`
//! field), a v2 (`hubs[].lights[]`), or the current v3 shape. `load`
//! always hands back a v3 `Config`, writing a best-effort backup of
//! whatever older shape it found.

use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::ChannelMapping;
use crate::error::{BridgeError, BridgeResult};

const CURRENT_VERSION: u32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtNetSettings {
    pub bind_ip: std::net::IpAddr,
}

impl Default for ArtNetSettings {
    fn default() -> Self {
        Self {
            bind_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub client_key: String,
    #[serde(default)]
    pub entertainment_configuration_id: Option<String>,
    #[serde(default)]
    pub art_net_universe: u16,
    #[serde(default)]
    pub channels: Vec<ChannelMapping>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub artnet: ArtNetSettings,
    #[serde(default)]
    pub hubs: Vec<HubConfig>,
}

/// Reads and, if needed, migrates the configuration document at `path`.
///
/// Only malformed JSON or an unrecognized `version` abort the load
/// itself; per-hub invariant violations (bad PSK shape, overrunning
/// channel mapping, malformed UUID) are left for
/// [`validate_hub_locally`] so the coordinator can skip just the
/// offending hub: configuration and setup errors should abort the
/// affected runner only, not the whole process.
pub async fn load(path: impl AsRef<Path>) -> BridgeResult<Config> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await?;
    let value: Value = serde_json::from_str(&raw)?;

    let (config, old_version) = match value.get("version").and_then(Value::as_u64) {
        None => (migrate_v1(&value)?, 1u32),
        Some(2) => (migrate_v2(&value)?, 2u32),
        Some(3) => (serde_json::from_value(value)?, 3u32),
        Some(other) => {
            return Err(BridgeError::ConfigInvalid(format!(
                "unsupported configuration version {other}"
            )))
        }
    };

    if old_version != CURRENT_VERSION {
        let backup_path = format!("{}.bak-v{old_version}", path.display());
        if let Err(e) = tokio::fs::write(&backup_path, &raw).await {
            warn!("could not write configuration backup {backup_path}: {e}");
        }
    }

    Ok(config)
}

/// v1 is a single hub's fields at the document root, with no `version`
/// key and no `hubs` array.
fn migrate_v1(value: &Value) -> BridgeResult<Config> {
    let hub: HubConfigV1 = serde_json::from_value(value.clone())?;
    let bind_ip = value
        .get("artnetBindIp")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    Ok(Config {
        version: CURRENT_VERSION,
        artnet: ArtNetSettings { bind_ip },
        hubs: vec![HubConfig {
            id: "hub-1".to_string(),
            name: None,
            host: hub.host,
            username: hub.username,
            client_key: hub.client_key,
            entertainment_configuration_id: hub.entertainment_configuration_id,
            art_net_universe: hub.art_net_universe,
            channels: hub.channels,
        }],
    })
}

fn migrate_v2(value: &Value) -> BridgeResult<Config> {
    let doc: ConfigV2 = serde_json::from_value(value.clone())?;
    let hubs = doc
        .hubs
        .into_iter()
        .enumerate()
        .map(|(i, hub)| {
            let channels = hub
                .lights
                .into_iter()
                .filter_map(|light| match light.light_id.parse::<u8>() {
                    Ok(channel_id) => Some(ChannelMapping {
                        channel_id,
                        dmx_start: light.dmx_start,
                        channel_mode: light.channel_mode,
                    }),
                    Err(_) => {
                        warn!(
                            "hub {}: dropping light {:?}, lightId is not a channel number",
                            hub.id.as_deref().unwrap_or("?"),
                            light.light_id
                        );
                        None
                    }
                })
                .collect();

            let entertainment_configuration_id = hub
                .entertainment_room_id
                .filter(|id| is_uuid_shaped(id));

            HubConfig {
                id: hub.id.unwrap_or_else(|| format!("hub-{}", i + 1)),
                name: hub.name,
                host: hub.host,
                username: hub.username,
                client_key: hub.client_key,
                entertainment_configuration_id,
                art_net_universe: hub.art_net_universe,
                channels,
            }
        })
        .collect();

    Ok(Config {
        version: CURRENT_VERSION,
        artnet: ArtNetSettings {
            bind_ip: doc.artnet_bind_ip.unwrap_or(std::net::IpAddr::V4(
                std::net::Ipv4Addr::UNSPECIFIED,
            )),
        },
        hubs,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubConfigV1 {
    host: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    client_key: String,
    #[serde(default)]
    entertainment_configuration_id: Option<String>,
    #[serde(default)]
    art_net_universe: u16,
    #[serde(default)]
    channels: Vec<ChannelMapping>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigV2 {
    #[serde(default)]
    artnet_bind_ip: Option<std::net::IpAddr>,
    #[serde(default)]
    hubs: Vec<HubConfigV2>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubConfigV2 {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    host: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    client_key: String,
    #[serde(default)]
    entertainment_room_id: Option<String>,
    #[serde(default)]
    art_net_universe: u16,
    #[serde(default)]
    lights: Vec<LightConfigV2>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LightConfigV2 {
    light_id: String,
    dmx_start: u16,
    channel_mode: crate::channel::ChannelMode,
}

/// The local-only subset of the data-model invariants: the ones a hub's own
/// document fields can violate without talking to the network. Called
/// once per hub at coordinator startup; a failing hub is skipped, not
/// fatal to the process.
pub fn validate_hub_locally(hub: &HubConfig) -> BridgeResult<()> {
    if hub.host.trim().is_empty() {
        return Err(BridgeError::ConfigInvalid(format!(
            "hub {}: host is required",
            hub.id
        )));
    }
    if hub.channels.is_empty() {
        return Err(BridgeError::ConfigInvalid(format!(
            "hub {}: channels must be non-empty",
            hub.id
        )));
    }
    for mapping in &hub.channels {
        mapping
            .validate()
            .map_err(|e| BridgeError::ConfigInvalid(format!("hub {}: {e}", hub.id)))?;
    }
    if let Some(id) = &hub.entertainment_configuration_id {
        if !is_uuid_shaped(id) {
            return Err(BridgeError::ConfigInvalid(format!(
                "hub {}: entertainmentConfigurationId {id:?} is not UUID-shaped",
                hub.id
            )));
        }
    }
    if !hub.client_key.is_empty() {
        decode_client_key(&hub.client_key)
            .map_err(|e| BridgeError::ConfigInvalid(format!("hub {}: clientKey {e}", hub.id)))?;
    }
    Ok(())
}

/// Decodes the hub's PSK secret from its hex-string `clientKey`: a
/// non-empty byte string decoded from an even-length hexadecimal
/// string.
pub fn decode_client_key(client_key: &str) -> Result<Vec<u8>, String> {
    if client_key.is_empty() || client_key.len() % 2 != 0 {
        return Err("must be a non-empty, even-length hex string".to_string());
    }
    hex::decode(client_key).map_err(|e| format!("is not valid hex: {e}"))
}

/// `8-4-4-4-12` hex groups joined by hyphens, 36 characters total.
fn is_uuid_shaped(s: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    if s.len() != 36 {
        return false;
    }
    let mut idx = 0;
    for (i, &len) in GROUPS.iter().enumerate() {
        let Some(segment) = s.get(idx..idx + len) else {
            return false;
        };
        if !segment.bytes().all(|b| b.is_ascii_hexdigit()) {
            return false;
        }
        idx += len;
        if i < GROUPS.len() - 1 {
            if s.as_bytes().get(idx) != Some(&b'-') {
                return false;
            }
            idx += 1;
        }
    }
    idx == s.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMode;

    fn sample_channel() -> ChannelMapping {
        ChannelMapping {
            channel_id: 0,
            dmx_start: 1,
            channel_mode: ChannelMode::EightBit,
        }
    }

    fn sample_hub() -> HubConfig {
        HubConfig {
            id: "hub-1".to_string(),
            name: None,
            host: "192.168.1.10".to_string(),
            username: "user".to_string(),
            client_key: "00112233445566778899aabbccddeeff".to_string(),
            entertainment_configuration_id: Some("01234567-89ab-cdef-0123-456789abcdef".to_string()),
            art_net_universe: 0,
            channels: vec![sample_channel()],
        }
    }

    #[test]
    fn uuid_shape_accepts_and_rejects() {
        assert!(is_uuid_shaped("01234567-89ab-cdef-0123-456789abcdef"));
        assert!(!is_uuid_shaped("01234567-89ab-cdef-0123-456789abcde")); // too short
        assert!(!is_uuid_shaped("0123456789ab-cdef-0123-456789abcdef")); // wrong grouping
        assert!(!is_uuid_shaped("zzzzzzzz-89ab-cdef-0123-456789abcdef")); // non-hex
    }

    #[test]
    fn decode_client_key_rejects_odd_length() {
        assert!(decode_client_key("abc").is_err());
    }

    #[test]
    fn decode_client_key_rejects_non_hex() {
        assert!(decode_client_key("zz112233445566778899aabbccddeef").is_err());
    }

    #[test]
    fn decode_client_key_accepts_valid_hex() {
        assert_eq!(decode_client_key("0011223344556677").unwrap().len(), 8);
    }

    #[test]
    fn validate_hub_locally_accepts_well_formed_hub() {
        assert!(validate_hub_locally(&sample_hub()).is_ok());
    }

    #[test]
    fn validate_hub_locally_rejects_empty_channels() {
        let mut hub = sample_hub();
        hub.channels.clear();
        assert!(validate_hub_locally(&hub).is_err());
    }

    #[test]
    fn validate_hub_locally_rejects_overrunning_channel() {
        let mut hub = sample_hub();
        hub.channels = vec![ChannelMapping {
            channel_id: 0,
            dmx_start: 511,
            channel_mode: ChannelMode::SixteenBit,
        }];
        assert!(validate_hub_locally(&hub).is_err());
    }

    #[test]
    fn validate_hub_locally_rejects_malformed_uuid() {
        let mut hub = sample_hub();
        hub.entertainment_configuration_id = Some("not-a-uuid".to_string());
        assert!(validate_hub_locally(&hub).is_err());
    }

    #[test]
    fn migrates_v1_flat_document() {
        let raw = serde_json::json!({
            "host": "192.168.1.5",
            "username": "u",
            "clientKey": "0011223344556677",
            "entertainmentConfigurationId": "01234567-89ab-cdef-0123-456789abcdef",
            "artNetUniverse": 2,
            "channels": [{ "channelId": 0, "dmxStart": 1, "channelMode": "8bit" }]
        });
        let config = migrate_v1(&raw).unwrap();
        assert_eq!(config.version, CURRENT_VERSION);
        assert_eq!(config.hubs.len(), 1);
        assert_eq!(config.hubs[0].host, "192.168.1.5");
        assert_eq!(config.hubs[0].channels.len(), 1);
    }

    #[test]
    fn migrates_v2_lights_into_channels() {
        let raw = serde_json::json!({
            "version": 2,
            "hubs": [{
                "id": "hub-a",
                "host": "192.168.1.6",
                "username": "u",
                "clientKey": "0011223344556677",
                "entertainmentRoomId": "01234567-89ab-cdef-0123-456789abcdef",
                "artNetUniverse": 0,
                "lights": [
                    { "lightId": "3", "dmxStart": 1, "channelMode": "8bit" },
                    { "lightId": "not-a-number", "dmxStart": 4, "channelMode": "8bit" }
                ]
            }]
        });
        let config = migrate_v2(&raw).unwrap();
        assert_eq!(config.hubs.len(), 1);
        assert_eq!(config.hubs[0].channels.len(), 1);
        assert_eq!(config.hubs[0].channels[0].channel_id, 3);
        assert_eq!(
            config.hubs[0].entertainment_configuration_id.as_deref(),
            Some("01234567-89ab-cdef-0123-456789abcdef")
        );
    }
}
