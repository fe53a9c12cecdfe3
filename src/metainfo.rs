//! Decoded bencoded torrent metainfo, and the typed [`Descriptor`] the
//! coordinator is actually constructed from.
//!
//! The bencoded decoder itself is an external collaborator (see the design's
//! scope section); this module is the thin, testable seam between its raw
//! output and the coordinator's input.

use crate::{PieceIndex, Sha1Hash};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// A decoded `.torrent` file, as produced by the external bencode decoder.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    /// Decodes a metainfo dictionary from its bencoded representation.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }

    /// Computes the infohash: the SHA-1 digest of the bencoded `info`
    /// dictionary.
    pub fn create_info_hash(&self) -> Result<Sha1Hash, serde_bencode::Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

/// The `info` dictionary of a metainfo file.
///
/// `files` is retained on the decoded type so that a multi-file torrent
/// decodes without error, but [`Descriptor::from_metainfo`] rejects it: the
/// coordinator only supports the single-file payload model.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// The immutable, validated description of the payload to download.
///
/// Everything the coordinator needs to build its initial *unclaimed* queue
/// and to validate completed pieces lives here; it is constructed once, up
/// front, and never mutated.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub total_length: u64,
    pub piece_length: u32,
    pub name: String,
    pub piece_hashes: Vec<Sha1Hash>,
    pub infohash: Sha1Hash,
}

impl Descriptor {
    /// Builds a validated descriptor from decoded metainfo.
    ///
    /// Every field the coordinator depends on must be present and
    /// consistent; any violation is fatal, per the design's error taxonomy.
    pub fn from_metainfo(metainfo: &Metainfo) -> Result<Self, crate::error::Error> {
        use crate::error::Error;

        let total_length = metainfo
            .info
            .length
            .ok_or(Error::InvalidDescriptor("length"))?;
        if metainfo.info.files.is_some() {
            // multi-file torrents are out of scope: the coordinator assumes
            // a single contiguous payload
            return Err(Error::InvalidDescriptor("length"));
        }
        if metainfo.info.name.is_empty() {
            return Err(Error::InvalidDescriptor("name"));
        }
        if metainfo.info.piece_length == 0 {
            return Err(Error::InvalidDescriptor("piece length"));
        }
        if metainfo.info.pieces.is_empty() {
            return Err(Error::InvalidDescriptor("pieces"));
        }

        let piece_hashes = split_piece_hashes(&metainfo.info.pieces)?;
        let infohash = metainfo
            .create_info_hash()
            .map_err(crate::error::Error::Bencode)?;

        Ok(Self {
            total_length,
            piece_length: metainfo.info.piece_length as u32,
            name: metainfo.info.name.clone(),
            piece_hashes,
            infohash,
        })
    }

    /// Returns the number of pieces the payload is split into.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length, in bytes, of the piece at `index`.
    ///
    /// All pieces share `piece_length` except the last, which is whatever
    /// remains of `total_length`.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        let n = self.piece_count();
        if index >= n {
            return None;
        }
        if index == n - 1 {
            let full = self.piece_length as u64 * (n - 1) as u64;
            Some((self.total_length - full) as u32)
        } else {
            Some(self.piece_length)
        }
    }
}

/// Slices a concatenated hash blob into 20-byte SHA-1 hashes.
fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<Sha1Hash>, crate::error::Error> {
    if pieces.len() % 20 != 0 {
        return Err(crate::error::Error::InvalidHashBlobLength(pieces.len()));
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_blob(n: usize) -> Vec<u8> {
        (0..n * 20).map(|i| i as u8).collect()
    }

    #[test]
    fn splits_piece_hashes_into_20_byte_chunks() {
        let blob = hash_blob(3);
        let hashes = split_piece_hashes(&blob).unwrap();
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[1], &blob[20..40]);
    }

    #[test]
    fn rejects_hash_blob_with_bad_length() {
        let blob = vec![0u8; 21];
        assert!(split_piece_hashes(&blob).is_err());
    }

    fn sample_metainfo(total_length: u64, piece_length: u64, n_pieces: usize) -> Metainfo {
        Metainfo {
            info: Info {
                name: "sample.bin".to_string(),
                pieces: hash_blob(n_pieces),
                piece_length,
                length: Some(total_length),
                files: None,
                private: None,
            },
        }
    }

    #[test]
    fn descriptor_computes_last_piece_length() {
        let metainfo = sample_metainfo(32_768, 16_384, 2);
        let descriptor = Descriptor::from_metainfo(&metainfo).unwrap();
        assert_eq!(descriptor.piece_count(), 2);
        assert_eq!(descriptor.piece_len(0), Some(16_384));
        assert_eq!(descriptor.piece_len(1), Some(16_384));
    }

    #[test]
    fn descriptor_last_piece_is_shorter_when_uneven() {
        let metainfo = sample_metainfo(40_000, 16_384, 3);
        let descriptor = Descriptor::from_metainfo(&metainfo).unwrap();
        assert_eq!(descriptor.piece_len(0), Some(16_384));
        assert_eq!(descriptor.piece_len(1), Some(16_384));
        assert_eq!(descriptor.piece_len(2), Some(40_000 - 2 * 16_384));
        assert_eq!(descriptor.piece_len(3), None);
    }

    #[test]
    fn descriptor_rejects_multi_file_torrent() {
        let mut metainfo = sample_metainfo(100, 50, 2);
        metainfo.info.files = Some(vec![File {
            path: vec!["a".into()],
            length: 50,
        }]);
        metainfo.info.length = None;
        assert!(Descriptor::from_metainfo(&metainfo).is_err());
    }

    #[test]
    fn descriptor_rejects_missing_length() {
        let mut metainfo = sample_metainfo(100, 50, 2);
        metainfo.info.length = None;
        assert!(Descriptor::from_metainfo(&metainfo).is_err());
    }
}
