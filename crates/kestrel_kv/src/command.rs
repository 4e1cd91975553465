//! Replicated commands.

use kestrel_common::error::{KestrelError, KestrelResult, StorageError};
use serde::{Deserialize, Serialize};

/// A write operation carried through the log. Reads never enter the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Command {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn encode(&self) -> KestrelResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| KestrelError::Storage(StorageError::Codec(e.to_string())))
    }

    pub fn decode(data: &[u8]) -> KestrelResult<Self> {
        bincode::deserialize(data)
            .map_err(|e| KestrelError::Storage(StorageError::Codec(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let put = Command::put(&b"k"[..], &b"v"[..]);
        assert_eq!(Command::decode(&put.encode().unwrap()).unwrap(), put);

        let del = Command::delete(&b"k"[..]);
        assert_eq!(Command::decode(&del.encode().unwrap()).unwrap(), del);
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = Command::decode(&[0xFF, 0xFE, 0xFD]).unwrap_err();
        assert!(matches!(
            err,
            KestrelError::Storage(StorageError::Codec(_))
        ));
    }
}
