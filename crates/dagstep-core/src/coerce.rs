//! Loose configuration decoding.
//!
//! Workflow authors write executor config by hand, so values arrive loosely
//! typed: `"true"` for a boolean, `"22"` for a port, a single string where a
//! list is expected, `User` instead of `user`. Every backend decodes its typed
//! config through [`decode_layered`], which applies the same coercions:
//!
//! - booleans accept `true/false`, `1/0`, `yes/no`, `on/off` (any case) and numbers
//! - integers and floats accept numeric strings and booleans
//! - strings accept numbers and booleans
//! - sequences accept a lone scalar as a one-element list and `null` as empty
//! - struct keys match field names case-insensitively
//!
//! Layers are applied in order on top of the serialized base value; a `null`
//! in a layer means "not set" and leaves the lower value untouched.

use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{DagstepError, Result};

/// Decode `base` overlaid with each layer in order.
pub fn decode_layered<T>(base: &T, layers: &[&Map<String, Value>]) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = match serde_json::to_value(base)? {
        Value::Object(map) => map,
        other => {
            return Err(DagstepError::config(format!(
                "config base must be an object, got {}",
                kind_of(&other)
            )))
        }
    };
    for layer in layers {
        overlay(&mut merged, layer);
    }
    decode(Value::Object(merged))
}

/// Decode a single value with loose coercion.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    T::deserialize(Loose(value)).map_err(|e| DagstepError::config(e.to_string()))
}

/// Copy every non-null entry of `layer` into `target`, reusing the target's
/// spelling of a key when one matches case-insensitively.
pub fn overlay(target: &mut Map<String, Value>, layer: &Map<String, Value>) {
    for (key, value) in layer {
        if value.is_null() {
            continue;
        }
        let canonical = target
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .cloned()
            .unwrap_or_else(|| key.clone());
        target.insert(canonical, value.clone());
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

fn invalid(v: &Value, expected: &str) -> serde_json::Error {
    de::Error::custom(format!("invalid type: {}, expected {}", kind_of(v), expected))
}

struct Loose(Value);

impl Loose {
    fn as_i64(&self) -> std::result::Result<i64, serde_json::Error> {
        match &self.0 {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(|| invalid(&self.0, "integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| de::Error::custom(format!("cannot parse {s:?} as integer"))),
            Value::Bool(b) => Ok(i64::from(*b)),
            other => Err(invalid(other, "integer")),
        }
    }

    fn as_u64(&self) -> std::result::Result<u64, serde_json::Error> {
        match &self.0 {
            Value::Number(n) if n.as_u64().is_some() => Ok(n.as_u64().unwrap_or_default()),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| de::Error::custom(format!("cannot parse {s:?} as unsigned integer"))),
            _ => {
                let v = self.as_i64()?;
                u64::try_from(v).map_err(|_| de::Error::custom(format!("{v} is negative")))
            }
        }
    }

    fn as_f64(&self) -> std::result::Result<f64, serde_json::Error> {
        match &self.0 {
            Value::Number(n) => n.as_f64().ok_or_else(|| invalid(&self.0, "float")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| de::Error::custom(format!("cannot parse {s:?} as float"))),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            other => Err(invalid(other, "float")),
        }
    }
}

macro_rules! loose_int {
    ($method:ident, $visit:ident, $ty:ty, $source:ident) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
            let raw = self.$source()?;
            let v = <$ty>::try_from(raw)
                .map_err(|_| de::Error::custom(format!("{raw} out of range for {}", stringify!($ty))))?;
            visitor.$visit(v)
        }
    };
}

impl<'de> de::Deserializer<'de> for Loose {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    visitor.visit_u64(u)
                } else if let Some(i) = n.as_i64() {
                    visitor.visit_i64(i)
                } else {
                    visitor.visit_f64(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => visitor.visit_string(s),
            Value::Array(items) => visitor.visit_seq(LooseSeq::new(items)),
            Value::Object(map) => visitor.visit_map(LooseMap::new(map, None)),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match &self.0 {
            Value::Bool(b) => visitor.visit_bool(*b),
            Value::String(s) => match parse_bool(s) {
                Some(b) => visitor.visit_bool(b),
                None => Err(de::Error::custom(format!("cannot parse {s:?} as boolean"))),
            },
            Value::Number(n) => visitor.visit_bool(n.as_f64().is_some_and(|f| f != 0.0)),
            other => Err(invalid(other, "boolean")),
        }
    }

    loose_int!(deserialize_i8, visit_i8, i8, as_i64);
    loose_int!(deserialize_i16, visit_i16, i16, as_i64);
    loose_int!(deserialize_i32, visit_i32, i32, as_i64);
    loose_int!(deserialize_i64, visit_i64, i64, as_i64);
    loose_int!(deserialize_u8, visit_u8, u8, as_u64);
    loose_int!(deserialize_u16, visit_u16, u16, as_u64);
    loose_int!(deserialize_u32, visit_u32, u32, as_u64);
    loose_int!(deserialize_u64, visit_u64, u64, as_u64);

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_f32(self.as_f64()? as f32)
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_f64(self.as_f64()?)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::String(s) => visitor.visit_string(s),
            Value::Number(n) => visitor.visit_string(n.to_string()),
            Value::Bool(b) => visitor.visit_string(b.to_string()),
            other => Err(invalid(&other, "string")),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            other => visitor.visit_some(Loose(other)),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Array(items) => visitor.visit_seq(LooseSeq::new(items)),
            Value::Null => visitor.visit_seq(LooseSeq::new(Vec::new())),
            Value::Object(_) => Err(invalid(&self.0, "sequence")),
            scalar => visitor.visit_seq(LooseSeq::new(vec![scalar])),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => visitor.visit_map(LooseMap::new(map, None)),
            Value::Null => visitor.visit_map(LooseMap::new(Map::new(), None)),
            other => Err(invalid(&other, "map")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => visitor.visit_map(LooseMap::new(map, Some(fields))),
            other => Err(invalid(&other, "struct")),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_enum(name, variants, visitor)
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        self.deserialize_string(visitor)
    }

    forward_to_deserialize_any! {
        char bytes byte_buf unit unit_struct tuple_struct ignored_any
    }
}

struct LooseSeq {
    iter: std::vec::IntoIter<Value>,
}

impl LooseSeq {
    fn new(items: Vec<Value>) -> Self {
        Self {
            iter: items.into_iter(),
        }
    }
}

impl<'de> SeqAccess<'de> for LooseSeq {
    type Error = serde_json::Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> std::result::Result<Option<T::Value>, Self::Error> {
        match self.iter.next() {
            Some(v) => seed.deserialize(Loose(v)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct LooseMap {
    iter: serde_json::map::IntoIter,
    value: Option<Value>,
    fields: Option<&'static [&'static str]>,
}

impl LooseMap {
    fn new(map: Map<String, Value>, fields: Option<&'static [&'static str]>) -> Self {
        Self {
            iter: map.into_iter(),
            value: None,
            fields,
        }
    }

    fn canonical(&self, key: String) -> String {
        match self.fields {
            Some(fields) => fields
                .iter()
                .find(|f| f.eq_ignore_ascii_case(&key))
                .map(|f| (*f).to_string())
                .unwrap_or(key),
            None => key,
        }
    }
}

impl<'de> MapAccess<'de> for LooseMap {
    type Error = serde_json::Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> std::result::Result<Option<K::Value>, Self::Error> {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                let key = self.canonical(key);
                seed.deserialize(IntoDeserializer::<serde_json::Error>::into_deserializer(key))
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        match self.value.take() {
            Some(v) => seed.deserialize(Loose(v)),
            None => Err(de::Error::custom("value requested before key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        #[serde(default)]
        bucket: String,
        #[serde(default)]
        region: String,
        #[serde(default)]
        force_path_style: bool,
        #[serde(default)]
        max_keys: u32,
        #[serde(default)]
        part_size: i64,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
        #[serde(default)]
        endpoint: Option<String>,
    }

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn step_layer_overrides_ambient_layer() {
        let ambient = map(json!({"bucket": "dag-bucket", "region": "us-east-1"}));
        let step = map(json!({"bucket": "step-bucket"}));
        let cfg: Sample = decode_layered(&Sample::default(), &[&ambient, &step]).unwrap();
        assert_eq!(cfg.bucket, "step-bucket");
        assert_eq!(cfg.region, "us-east-1");
    }

    #[test]
    fn null_in_a_layer_means_absent() {
        let ambient = map(json!({"region": "eu-west-1"}));
        let step = map(json!({"region": null}));
        let cfg: Sample = decode_layered(&Sample::default(), &[&ambient, &step]).unwrap();
        assert_eq!(cfg.region, "eu-west-1");
    }

    #[test]
    fn weak_typing_coercions() {
        let step = map(json!({
            "forcePathStyle": "true",
            "maxKeys": "250",
            "partSize": 16.0,
            "tags": "solo",
            "metadata": {"build": 42, "ok": true},
            "endpoint": 9000,
        }));
        let cfg: Sample = decode_layered(&Sample::default(), &[&step]).unwrap();
        assert!(cfg.force_path_style);
        assert_eq!(cfg.max_keys, 250);
        assert_eq!(cfg.part_size, 16);
        assert_eq!(cfg.tags, vec!["solo"]);
        assert_eq!(cfg.metadata["build"], "42");
        assert_eq!(cfg.metadata["ok"], "true");
        assert_eq!(cfg.endpoint.as_deref(), Some("9000"));
    }

    #[test]
    fn keys_match_case_insensitively() {
        let step = map(json!({"Bucket": "b", "FORCEPATHSTYLE": 1}));
        let cfg: Sample = decode_layered(&Sample::default(), &[&step]).unwrap();
        assert_eq!(cfg.bucket, "b");
        assert!(cfg.force_path_style);

        let nested: Sample = decode(json!({"Region": "ap-1", "MaxKeys": "3"})).unwrap();
        assert_eq!(nested.region, "ap-1");
        assert_eq!(nested.max_keys, 3);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let step = map(json!({"maxKeys": "lots"}));
        let err = decode_layered(&Sample::default(), &[&step]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("lots"));

        let step = map(json!({"forcePathStyle": "maybe"}));
        assert!(decode_layered(&Sample::default(), &[&step]).is_err());
    }

    #[test]
    fn negative_into_unsigned_fails() {
        let step = map(json!({"maxKeys": -1}));
        assert!(decode_layered(&Sample::default(), &[&step]).is_err());
    }
}
