//! Computes the BitTorrent info-hash: the SHA-1 digest over the canonical
//! bencoding of the `info` sub-tree. Because [`crate::bencode::encoder`] is
//! canonical (sorted keys, exact-length strings), this digest matches what
//! trackers and peers expect regardless of the key order the original
//! `.torrent` file happened to use on the wire.
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::torrent::TorrentResult;
use sha1::Digest;
use sha1::Sha1;
use std::collections::HashMap;

/// Calculates the SHA-1 hash of a bencode-encoded info dictionary.
///
/// # Arguments
/// * `info_dict` - A HashMap containing the torrent's info dictionary
///
/// # Returns
/// * `Result<[u8;20]>` - A 20-byte array containing the SHA-1 hash, or an error if encoding fails
pub fn calculate_info_hash(info_dict: &HashMap<Vec<u8>, BencodeValue>) -> TorrentResult<[u8; 20]> {
    let buffer = bencode::encoder::encode_to_vec(&BencodeValue::Dict(info_dict.clone()))?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);

    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_key_order() {
        let mut a = HashMap::new();
        a.insert(b"foo".to_vec(), BencodeValue::Integer(1));
        a.insert(b"bar".to_vec(), BencodeValue::Integer(2));

        let mut b = HashMap::new();
        b.insert(b"bar".to_vec(), BencodeValue::Integer(2));
        b.insert(b"foo".to_vec(), BencodeValue::Integer(1));

        assert_eq!(
            calculate_info_hash(&a).unwrap(),
            calculate_info_hash(&b).unwrap()
        );
    }
}
