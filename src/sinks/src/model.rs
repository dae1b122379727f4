//! Event/reading model exchanged by the export stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod value_type {
    pub const BOOL: &str = "Bool";
    pub const STRING: &str = "String";
    pub const UINT8: &str = "Uint8";
    pub const UINT16: &str = "Uint16";
    pub const UINT32: &str = "Uint32";
    pub const UINT64: &str = "Uint64";
    pub const INT8: &str = "Int8";
    pub const INT16: &str = "Int16";
    pub const INT32: &str = "Int32";
    pub const INT64: &str = "Int64";
    pub const FLOAT32: &str = "Float32";
    pub const FLOAT64: &str = "Float64";
    pub const BINARY: &str = "Binary";
    pub const OBJECT: &str = "Object";
    pub const OBJECT_ARRAY: &str = "ObjectArray";
    pub const BOOL_ARRAY: &str = "BoolArray";
    pub const STRING_ARRAY: &str = "StringArray";
    pub const UINT8_ARRAY: &str = "Uint8Array";
    pub const UINT16_ARRAY: &str = "Uint16Array";
    pub const UINT32_ARRAY: &str = "Uint32Array";
    pub const UINT64_ARRAY: &str = "Uint64Array";
    pub const INT8_ARRAY: &str = "Int8Array";
    pub const INT16_ARRAY: &str = "Int16Array";
    pub const INT32_ARRAY: &str = "Int32Array";
    pub const INT64_ARRAY: &str = "Int64Array";
    pub const FLOAT32_ARRAY: &str = "Float32Array";
    pub const FLOAT64_ARRAY: &str = "Float64Array";
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub id: String,
    pub device_name: String,
    #[serde(default)]
    pub profile_name: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub origin: i64,
    #[serde(default)]
    pub readings: Vec<Reading>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(
        profile_name: impl Into<String>,
        device_name: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: "v3".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            device_name: device_name.into(),
            profile_name: profile_name.into(),
            source_name: source_name.into(),
            origin: now_nanos(),
            readings: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Appends a reading carrying a textual value.
    pub fn add_simple_reading(
        &mut self,
        resource_name: impl Into<String>,
        value_type: impl Into<String>,
        value: impl Into<String>,
    ) {
        let reading = Reading {
            id: uuid::Uuid::new_v4().to_string(),
            origin: self.origin,
            device_name: self.device_name.clone(),
            resource_name: resource_name.into(),
            profile_name: self.profile_name.clone(),
            value_type: value_type.into(),
            value: value.into(),
            ..Reading::default()
        };
        self.readings.push(reading);
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub origin: i64,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub profile_name: String,
    #[serde(default)]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub units: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub binary_value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_value: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Value>,
}

const NANOSECOND_DIGITS: u32 = 19;

/// Right-pads `timestamp` with zeros to nanosecond resolution.
pub fn to_nanoseconds(timestamp: i64) -> i64 {
    let digits = timestamp.unsigned_abs().checked_ilog10().map_or(1, |d| d + 1);
    if timestamp == 0 || digits >= NANOSECOND_DIGITS {
        return timestamp;
    }
    timestamp.saturating_mul(10_i64.pow(NANOSECOND_DIGITS - digits))
}

pub(crate) fn now_nanos() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_reading_is_base64_on_the_wire() {
        let mut event = Event::new("profile", "device", "source");
        event.readings.push(Reading {
            resource_name: "image".to_string(),
            value_type: value_type::BINARY.to_string(),
            binary_value: Some(vec![0xde, 0xad, 0xbe, 0xef]),
            media_type: "application/octet-stream".to_string(),
            ..Reading::default()
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["readings"][0]["binaryValue"], "3q2+7w==");
        assert_eq!(json["deviceName"], "device");

        let decoded: Event = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn object_without_device_name_is_not_an_event() {
        let parsed = serde_json::from_str::<Event>(r#"{"temperature": 21}"#);
        assert!(parsed.is_err());
    }
}
