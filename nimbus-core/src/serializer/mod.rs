//! Binary encoding of computation units and call arguments.
//!
//! The computation unit a job ships to its runtime (the function body and the
//! bundled module files) is encoded with the [`Serializer`] chosen per session
//! in the [`Config`]. The runtime decodes with the same format, which is
//! recorded in the job file.
//!
//! Call arguments are untyped JSON and need a self-describing format, so they
//! are always encoded with [`CALL_DATA_SERIALIZER`].
//!
//! # Examples
//!
//! ```rust
//! use nimbus::serializer::Serializer;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Args {
//!     x: u64,
//! }
//!
//! let bytes = Serializer::Cbor.to_bytes(&Args { x: 3 }).unwrap();
//! let decoded: Args = Serializer::Cbor.from_bytes(&bytes).unwrap();
//! assert_eq!(decoded, Args { x: 3 });
//! ```

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Encodes every per-call argument blob, whatever the session format.
pub const CALL_DATA_SERIALIZER: Serializer = Serializer::Cbor;

/// Shorthand for values that can be shipped to a runtime and moved across
/// tasks.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// Supported binary formats.
///
/// `Postcard` is not self-describing, so values that rely on
/// `deserialize_any` (such as [`serde_json::Value`]) only round-trip through
/// `Cbor`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub enum Serializer {
    #[default]
    Cbor,
    Postcard,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cbor => write!(f, "cbor"),
            Self::Postcard => write!(f, "postcard"),
        }
    }
}

impl Serializer {
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
        }
    }

    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
        }
    }
}

impl From<config::Serializer> for Serializer {
    fn from(serializer: config::Serializer) -> Self {
        match serializer {
            config::Serializer::Cbor => Self::Cbor,
            config::Serializer::Postcard => Self::Postcard,
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        config.serializer.into()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn postcard_round_trips_typed_values() {
        let files: BTreeMap<String, Vec<u8>> =
            [("pkg/__init__.py".to_string(), b"x = 1".to_vec())].into();
        let bytes = Serializer::Postcard.to_bytes(&files).unwrap();
        let decoded: BTreeMap<String, Vec<u8>> = Serializer::Postcard.from_bytes(&bytes).unwrap();
        assert_eq!(decoded, files);
    }

    #[test]
    fn cbor_round_trips_json_values() {
        let value = serde_json::json!({"x": 1, "y": [true, "s"]});
        let bytes = Serializer::Cbor.to_bytes(&value).unwrap();
        let decoded: serde_json::Value = Serializer::Cbor.from_bytes(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn follows_config() {
        let config = Config {
            serializer: config::Serializer::Postcard,
            ..Default::default()
        };
        assert_eq!(Serializer::from(&config), Serializer::Postcard);
    }
}
