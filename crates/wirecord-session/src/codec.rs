//! Payload decoding
//!
//! A codec turns the front of a byte buffer into one payload and reports how
//! many bytes it used. "Not enough bytes yet" and "these bytes are garbage"
//! are distinct outcomes: the first keeps the buffer, the second discards it.

use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Outcome of a failed decode attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The buffer holds a partial payload; retry after the next read
    #[error("incomplete payload")]
    Incomplete,

    /// The buffer cannot be decoded; the stream cannot be resynced
    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

/// Decodes one payload from the front of a buffer
pub trait Codec: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Decode a payload, returning it with the number of bytes consumed
    fn decode(&self, buf: &[u8]) -> Result<(Self::Item, usize), DecodeError>;
}

/// JSON envelope codec
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn decode(&self, buf: &[u8]) -> Result<(T, usize), DecodeError> {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<T>();
        match stream.next() {
            Some(Ok(item)) => Ok((item, stream.byte_offset())),
            Some(Err(e)) if e.is_eof() => Err(DecodeError::Incomplete),
            Some(Err(e)) => Err(DecodeError::Corrupt(e.to_string())),
            None => Err(DecodeError::Incomplete),
        }
    }
}
