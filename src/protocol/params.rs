//! Name-value pair codec used by `Params`, `GetValues` and `GetValuesResult`
//! content.
//!
//! Each pair is `name length`, `value length`, `name bytes`, `value bytes`.
//! A length below 128 takes one byte; anything longer takes four big-endian
//! bytes with the high bit of the first byte set.
use std::collections::HashMap;

use super::ProtocolError;

/// CGI-style environment of a request.
pub type Params = HashMap<String, String>;

const SHORT_LEN_MAX: usize = 0x7F;
const LONG_LEN_MAX: usize = 0x7FFF_FFFF;
const LONG_LEN_FLAG: u32 = 0x8000_0000;

/// Decodes a buffer of pairs into a map. A name seen twice keeps the last
/// value.
pub fn decode_pairs(buf: &[u8]) -> Result<Params, ProtocolError> {
    Ok(decode_pair_list(buf)?.into_iter().collect())
}

/// Decodes a buffer of pairs preserving their order.
pub fn decode_pair_list(buf: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let name_len = decode_length(buf, &mut pos)?;
        let value_len = decode_length(buf, &mut pos)?;

        let available = buf.len() - pos;
        let needed = name_len
            .checked_add(value_len)
            .ok_or(ProtocolError::TruncatedPair { needed: usize::MAX, available })?;
        if needed > available {
            return Err(ProtocolError::TruncatedPair { needed, available });
        }

        let name = String::from_utf8_lossy(&buf[pos..pos + name_len]).into_owned();
        pos += name_len;
        let value = String::from_utf8_lossy(&buf[pos..pos + value_len]).into_owned();
        pos += value_len;

        pairs.push((name, value));
    }

    Ok(pairs)
}

/// Encodes pairs in iteration order.
pub fn encode_pairs<I, K, V>(pairs: I) -> Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for (name, value) in pairs {
        encode_pair(&mut out, name.as_ref(), value.as_ref())?;
    }
    Ok(out)
}

pub fn encode_pair(out: &mut Vec<u8>, name: &[u8], value: &[u8]) -> Result<(), ProtocolError> {
    encode_length(out, name.len())?;
    encode_length(out, value.len())?;
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    Ok(())
}

fn encode_length(out: &mut Vec<u8>, len: usize) -> Result<(), ProtocolError> {
    if len <= SHORT_LEN_MAX {
        out.push(len as u8);
    } else if len <= LONG_LEN_MAX {
        out.extend_from_slice(&(len as u32 | LONG_LEN_FLAG).to_be_bytes());
    } else {
        return Err(ProtocolError::PairTooLong(len));
    }
    Ok(())
}

fn decode_length(buf: &[u8], pos: &mut usize) -> Result<usize, ProtocolError> {
    let rest = &buf[*pos..];
    let Some(&first) = rest.first() else {
        return Err(ProtocolError::TruncatedPair {
            needed: 1,
            available: 0,
        });
    };

    if first & 0x80 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }

    let Some(bytes) = rest.get(..4) else {
        return Err(ProtocolError::TruncatedPair {
            needed: 4,
            available: rest.len(),
        });
    };
    *pos += 4;
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & !LONG_LEN_FLAG;
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_lengths_round_trip() {
        for len in [0usize, 127, 128, 70_000] {
            let name = "n".repeat(len);
            let value = "v".repeat(len);
            let mut params = Params::new();
            params.insert(name.clone(), value.clone());
            params.insert("SHORT".into(), value.clone());

            let bytes = encode_pairs(&params).unwrap();
            assert_eq!(decode_pairs(&bytes).unwrap(), params, "length {len}");
        }
    }

    #[test]
    fn short_form_iff_at_most_127() {
        let mut out = Vec::new();
        encode_pair(&mut out, &[b'a'; 127], b"").unwrap();
        assert_eq!(out[0], 127);
        assert_eq!(out[1], 0);
        assert_eq!(out.len(), 2 + 127);

        let mut out = Vec::new();
        encode_pair(&mut out, &[b'a'; 128], &[b'b'; 3]).unwrap();
        assert_eq!(&out[..4], &[0x80, 0, 0, 128]);
        assert_eq!(out[4], 3);
        assert_eq!(out.len(), 4 + 1 + 128 + 3);
    }

    #[test]
    fn name_and_value_lengths_branch_independently() {
        let mut out = Vec::new();
        encode_pair(&mut out, b"KEY", &[b'x'; 200]).unwrap();

        assert_eq!(out[0], 3);
        assert_eq!(&out[1..5], &[0x80, 0, 0, 200]);
        let pairs = decode_pair_list(&out).unwrap();
        assert_eq!(pairs, vec![("KEY".to_string(), "x".repeat(200))]);
    }

    #[test]
    fn duplicate_names_keep_last_value() {
        let bytes = encode_pairs([("A", "1"), ("B", "2"), ("A", "3")]).unwrap();
        let params = decode_pairs(&bytes).unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params["A"], "3");
        assert_eq!(params["B"], "2");
    }

    #[test]
    fn truncated_value_is_rejected() {
        let mut bytes = encode_pairs([("NAME", "value")]).unwrap();
        bytes.truncate(bytes.len() - 2);

        let err = decode_pairs(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedPair {
                needed: 9,
                available: 7
            }
        ));
    }

    #[test]
    fn truncated_long_length_is_rejected() {
        let err = decode_pairs(&[0x80, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedPair {
                needed: 4,
                available: 2
            }
        ));
    }

    #[test]
    fn missing_value_length_is_rejected() {
        let err = decode_pairs(&[3]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedPair { needed: 1, .. }));
    }

    #[test]
    fn names_only_query() {
        let bytes = encode_pairs([("FCGI_MAX_CONNS", ""), ("FCGI_MPXS_CONNS", "")]).unwrap();
        let pairs = decode_pair_list(&bytes).unwrap();

        assert_eq!(pairs[0], ("FCGI_MAX_CONNS".to_string(), String::new()));
        assert_eq!(pairs[1], ("FCGI_MPXS_CONNS".to_string(), String::new()));
    }
}
