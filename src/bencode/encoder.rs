//! Bencode encoding: deterministic, canonical serialisation of a
//! [`BencodeValue`] tree back to bytes.
//!
//! Canonical here means: integers without leading zeros or a `+` sign,
//! byte-strings prefixed with their exact length, lists in given order,
//! and dictionaries with keys sorted bytewise-ascending. Info-hash
//! computation depends on this being bit-exact.
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use std::collections::HashMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a dictionary with keys sorted bytewise-ascending, per the
/// bencode spec's canonical-form requirement.
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &HashMap<Vec<u8>, BencodeValue>) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
    keys.sort_unstable();
    for key in keys {
        encode_string(writer, key)?;
        let value = dict
            .get(key)
            .expect("key came from dict.keys(), must be present");
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a [`BencodeValue`] into the given writer.
#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper returning the encoded bytes directly; used
/// wherever the caller just wants `Vec<u8>` (info-hash digest input,
/// tests) rather than threading a writer through.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder;

    #[test]
    fn encodes_scalars() {
        assert_eq!(encode_to_vec(&BencodeValue::Integer(42)).unwrap(), b"i42e");
        assert_eq!(
            encode_to_vec(&BencodeValue::String(b"spam".to_vec())).unwrap(),
            b"4:spam"
        );
    }

    #[test]
    fn sorts_dict_keys_on_encode() {
        let mut dict = HashMap::new();
        dict.insert(b"foo".to_vec(), BencodeValue::Integer(42));
        dict.insert(b"bar".to_vec(), BencodeValue::String(b"spam".to_vec()));
        let encoded = encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        assert_eq!(encoded, b"d3:bar4:spam3:fooi42ee");
    }

    #[test]
    fn round_trips_through_decode() {
        let input: &[u8] = b"d3:bar4:spam3:fooi42ee";
        let value = decoder::decode(input).unwrap();
        let re_encoded = encode_to_vec(&value).unwrap();
        assert_eq!(re_encoded, input);
    }

    #[test]
    fn info_hash_insensitive_to_source_key_order() {
        // Two inputs differing only in on-the-wire key order must
        // canonicalise to identical bytes once decoded and re-encoded.
        let a = decoder::decode(b"d3:bar4:spam3:fooi42ee").unwrap();
        let b = decoder::decode(b"d3:fooi42e3:bar4:spame").unwrap();
        assert_eq!(encode_to_vec(&a).unwrap(), encode_to_vec(&b).unwrap());
    }
}
