use serde::{de::DeserializeOwned, Serialize};

/// Encode an arbitrary serializable value into a vec.
///
/// This encoding is what gets signed and hashed, so it needs to be
/// deterministic, which msgpack is for our types.
pub fn encode<T: Serialize + ?Sized>(val: &T) -> Vec<u8> {
    rmp_serde::encode::to_vec(val).expect("failed to encode value")
}

/// Decode an arbitrary value from a slice of bytes.
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}
