//! Value encoding shared by both tiers (MessagePack via `rmp-serde`).

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheResult;

/// Encode a value with named struct fields so payloads survive field reordering.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> CacheResult<T> {
    Ok(rmp_serde::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        age: Option<u8>,
    }

    #[test]
    fn struct_survives_encoding() {
        let user = User {
            name: "Ana".into(),
            age: None,
        };
        let bytes = encode(&user).unwrap();
        assert_eq!(decode::<User>(&bytes).unwrap(), user);
    }

    #[test]
    fn type_mismatch_is_a_serialization_error() {
        let bytes = encode(&"not a user").unwrap();
        let err = decode::<User>(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
