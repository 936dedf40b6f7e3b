//! Serialize `u64` as a decimal string so browser clients never see values
//! above `Number.MAX_SAFE_INTEGER`. Deserialization accepts either form.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;

pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(raw) => raw.parse::<u64>().map_err(DeError::custom),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| DeError::custom(format!("not a u64: {n}"))),
        other => Err(DeError::custom(format!("expected u64, got {other}"))),
    }
}
