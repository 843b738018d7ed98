//! Payload decoders.

use crate::error::DecodeError;

/// Turns raw payload bytes into a typed message.
///
/// Any `Fn(&[u8]) -> Result<T, DecodeError>` is a decoder.
pub trait Decoder<T>: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<T, DecodeError>;
}

impl<T, F> Decoder<T> for F
where
    F: Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<T, DecodeError> {
        (self)(payload)
    }
}

/// Decodes JSON payloads with `serde_json`.
#[cfg(feature = "json")]
pub struct JsonDecoder<T> {
    _target: std::marker::PhantomData<fn() -> T>,
}

#[cfg(feature = "json")]
impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self { _target: std::marker::PhantomData }
    }
}

#[cfg(feature = "json")]
impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "json")]
impl<T> Clone for JsonDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

#[cfg(feature = "json")]
impl<T> std::fmt::Debug for JsonDecoder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonDecoder")
    }
}

#[cfg(feature = "json")]
impl<T> Decoder<T> for JsonDecoder<T>
where
    T: serde::de::DeserializeOwned,
{
    fn decode(&self, payload: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(Box::new(e)))
    }
}
