//! Content addressing: canonical JSON, truncated SHA-256 digests and spatial buckets.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex characters kept from each digest (128 bits)
pub const HASH_HEX_LEN: usize = 32;

/// Integers beyond this magnitude are not exactly representable as f64
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

/// Serialize with object keys sorted at every level and no whitespace.
///
/// Floats with no fractional part are written as integers so `1.0` and `1`
/// address the same content.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_INT => {
                out.push_str(&(f as i64).to_string());
            }
            _ => out.push_str(&n.to_string()),
        },
        other => out.push_str(&other.to_string()),
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            // unit separator keeps ("ab", "c") distinct from ("a", "bc")
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(HASH_HEX_LEN);
    hex
}

/// Digest of a value's canonical form
pub fn content_hash(value: &Value) -> String {
    digest(&[&canonical_json(value)])
}

/// Keys addressing one model's prediction for one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceKey {
    pub cache_key: String,
    pub input_hash: String,
}

pub fn inference_key(model_id: &str, input: &Value) -> InferenceKey {
    let canonical = canonical_json(input);
    InferenceKey {
        cache_key: digest(&[model_id, &canonical]),
        input_hash: digest(&[&canonical]),
    }
}

/// Stable identifier of a (model type, dataset version) pair
pub fn training_cache_id(model_type: &str, dataset_version: &str) -> String {
    digest(&[model_type, dataset_version])
}

/// A square lat/lon grid cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialBucket {
    pub center_lat: f64,
    pub center_lon: f64,
    pub size_degrees: f64,
}

fn round6(x: f64) -> f64 {
    let r = (x * 1e6).round() / 1e6;
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

impl SpatialBucket {
    /// Snap a point to the cell containing it. Non-positive sizes fall back to one degree.
    pub fn from_point(lat: f64, lon: f64, size_degrees: f64) -> Self {
        let size = if size_degrees > 0.0 { size_degrees } else { 1.0 };
        let lat0 = round6((lat / size).floor() * size);
        let lon0 = round6((lon / size).floor() * size);
        Self {
            center_lat: round6(lat0 + size / 2.0),
            center_lon: round6(lon0 + size / 2.0),
            size_degrees: size,
        }
    }

    /// South-west corner of the cell
    pub fn origin(&self) -> (f64, f64) {
        (
            round6(self.center_lat - self.size_degrees / 2.0),
            round6(self.center_lon - self.size_degrees / 2.0),
        )
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let (lat0, lon0) = self.origin();
        lat >= lat0
            && lat < lat0 + self.size_degrees
            && lon >= lon0
            && lon < lon0 + self.size_degrees
    }

    /// Grid label such as `lat_-12_lon_18`; non-unit cells carry their size
    pub fn label(&self) -> String {
        let (lat0, lon0) = self.origin();
        if self.size_degrees == 1.0 {
            format!("lat_{}_lon_{}", lat0, lon0)
        } else {
            format!("lat_{}_lon_{}_s{}", lat0, lon0, self.size_degrees)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": [1, 2], "y": null}});
        assert_eq!(canonical_json(&a), r#"{"a":{"y":null,"z":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_content_hash_ignores_key_order_and_integral_floats() {
        let a = json!({"sst": 18.5, "depth": 40, "chl": 1.0});
        let b = json!({"chl": 1, "depth": 40.0, "sst": 18.5});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), HASH_HEX_LEN);
    }

    #[test]
    fn test_content_hash_differs_for_different_payloads() {
        assert_ne!(content_hash(&json!([1, 2, 3])), content_hash(&json!([3, 2, 1])));
    }

    #[test]
    fn test_inference_key_depends_on_model() {
        let input = json!({"lat": -12.3, "lon": 18.7});
        let a = inference_key("sdm-v1", &input);
        let b = inference_key("sdm-v2", &input);
        assert_ne!(a.cache_key, b.cache_key);
        assert_eq!(a.input_hash, b.input_hash);
        assert_eq!(a.input_hash, content_hash(&input));
    }

    #[test]
    fn test_training_cache_id_is_unambiguous() {
        assert_ne!(
            training_cache_id("rf_a", "b"),
            training_cache_id("rf", "a_b")
        );
        assert_eq!(training_cache_id("rf", "v1"), training_cache_id("rf", "v1"));
    }

    #[test]
    fn test_spatial_bucket_label() {
        let bucket = SpatialBucket::from_point(-11.4, 18.9, 1.0);
        assert_eq!(bucket.label(), "lat_-12_lon_18");
        assert_eq!(bucket.center_lat, -11.5);
        assert_eq!(bucket.center_lon, 18.5);
        assert!(bucket.contains(-11.4, 18.9));
        assert!(!bucket.contains(-10.9, 18.9));
    }

    #[test]
    fn test_spatial_bucket_fractional_size() {
        let bucket = SpatialBucket::from_point(0.3, 0.7, 0.5);
        assert_eq!(bucket.origin(), (0.0, 0.5));
        assert_eq!(bucket.label(), "lat_0_lon_0.5_s0.5");
    }

    #[test]
    fn test_spatial_bucket_invalid_size_defaults_to_one_degree() {
        let bucket = SpatialBucket::from_point(5.5, 5.5, 0.0);
        assert_eq!(bucket.size_degrees, 1.0);
        assert_eq!(bucket.label(), "lat_5_lon_5");
    }
}
