//! The boundary between the typed value a caller works with and the bytes
//! [`crate::storage::KvStorage`] persists. Kept as a trait rather than a
//! single hard-coded format so callers can plug in whatever their value type
//! already speaks (JSON, a length-prefixed binary format, etc.) without this
//! crate taking on a serialization dependency it doesn't otherwise need.

/// Converts a value to and from the bytes written to disk.
///
/// Implementations should be cheap to construct; a [`crate::coordinator::CacheCoordinator`]
/// holds one instance behind an `Arc` and calls it from the worker thread for
/// every save and every disk hit.
pub trait Codec<V>: Send + Sync + 'static {
    fn encode(&self, value: &V) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Option<V>;
}

/// The identity codec for `Vec<u8>` values: no encoding step at all. The
/// right choice when the cache is already storing opaque blobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Vec<u8> {
        value.clone()
    }

    fn decode(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        Some(bytes.to_vec())
    }
}
