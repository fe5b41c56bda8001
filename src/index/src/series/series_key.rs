//! Canonical series key encoding.
//!
//! A series key is the identity of a series: measurement name plus its
//! sorted tag set. The wire form is
//!
//! ```text
//! varint(payload size)
//! u16 name length | name
//! varint(tag count)
//! per tag: u16 key length | key | u16 value length | value
//! ```
//!
//! Tags are sorted by key, then value, so two keys are equal exactly when
//! their encodings are byte-equal. All sizes are big-endian.

use std::cmp::Ordering;

use tsidx_common::tag::{Tag, Tags};

use crate::codec::{put_uvarint, read_uvarint};
use crate::error::{IndexError, Result};

/// Encodes `name` + `tags` into canonical form. The tag set is sorted here;
/// callers may pass tags in any order.
pub fn encode_series_key(name: &[u8], tags: &Tags) -> Vec<u8> {
    let mut sorted = tags.clone();
    sorted.sort();

    let mut payload = Vec::with_capacity(2 + name.len() + 4 + sorted.size());
    payload.extend_from_slice(&(name.len() as u16).to_be_bytes());
    payload.extend_from_slice(name);

    put_uvarint(&mut payload, sorted.len() as u64);
    for tag in sorted.iter() {
        payload.extend_from_slice(&(tag.key.len() as u16).to_be_bytes());
        payload.extend_from_slice(&tag.key);
        payload.extend_from_slice(&(tag.value.len() as u16).to_be_bytes());
        payload.extend_from_slice(&tag.value);
    }

    let mut key = Vec::with_capacity(payload.len() + 2);
    put_uvarint(&mut key, payload.len() as u64);
    key.extend_from_slice(&payload);
    key
}

/// Reads one series key from the front of `data`. Returns the key
/// (including its size prefix) and the remaining bytes, or `None` if the
/// data is truncated.
pub fn read_series_key(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (sz, n) = read_uvarint(data)?;
    let total = n + sz as usize;
    if data.len() < total {
        return None;
    }
    Some((&data[..total], &data[total..]))
}

/// Splits a canonical key into its measurement name and owned tag set.
pub fn parse_series_key(key: &[u8]) -> Result<(&[u8], Tags)> {
    decode_series_key(key).ok_or_else(|| IndexError::Corruption {
        path: "series key".to_string(),
        reason: "truncated encoding".to_string(),
    })
}

fn decode_series_key(key: &[u8]) -> Option<(&[u8], Tags)> {
    let (sz, n) = read_uvarint(key)?;
    let mut buf = key.get(n..n + sz as usize)?;

    let name_len = read_u16(&mut buf)? as usize;
    let name = take(&mut buf, name_len)?;

    let (tag_n, m) = read_uvarint(buf)?;
    buf = buf.get(m..)?;

    let mut tags = Vec::with_capacity(tag_n as usize);
    for _ in 0..tag_n {
        let klen = read_u16(&mut buf)? as usize;
        let k = take(&mut buf, klen)?;
        let vlen = read_u16(&mut buf)? as usize;
        let v = take(&mut buf, vlen)?;
        tags.push(Tag::new(k.to_vec(), v.to_vec()));
    }

    Some((name, Tags::new(tags)))
}

fn read_u16(buf: &mut &[u8]) -> Option<u16> {
    let b = take(buf, 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    let out = buf.get(..n)?;
    *buf = &buf[n..];
    Some(out)
}

/// Orders keys by measurement name, then tag-by-tag (key before value),
/// with the shorter tag list first on a shared prefix. This is the sort the
/// series listing uses. Malformed keys fall back to raw byte order.
pub fn compare_series_keys(a: &[u8], b: &[u8]) -> Ordering {
    let (an, at) = match decode_series_key(a) {
        Some(v) => v,
        None => return a.cmp(b),
    };
    let (bn, bt) = match decode_series_key(b) {
        Some(v) => v,
        None => return a.cmp(b),
    };

    match an.cmp(bn) {
        Ordering::Equal => {}
        ord => return ord,
    }

    for i in 0.. {
        match (at.get(i), bt.get(i)) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.key.cmp(&y.key).then_with(|| x.value.cmp(&y.value)) {
                Ordering::Equal => continue,
                ord => return ord,
            },
        }
    }
    Ordering::Equal
}

/// Human-readable rendering, e.g. `cpu,[{region east}]`.
pub fn format_series_key(key: &[u8]) -> Result<String> {
    let (name, tags) = parse_series_key(key)?;
    Ok(format!("{},{}", String::from_utf8_lossy(name), tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let t = tags(&[("region", "east"), ("host", "a")]);
        let key = encode_series_key(b"cpu", &t);

        let (name, parsed) = parse_series_key(&key).unwrap();
        assert_eq!(name, b"cpu");
        // canonical order sorts host before region
        assert_eq!(parsed, tags(&[("host", "a"), ("region", "east")]));
    }

    #[test]
    fn test_encoding_is_canonical() {
        let a = encode_series_key(b"cpu", &tags(&[("b", "2"), ("a", "1")]));
        let b = encode_series_key(b"cpu", &tags(&[("a", "1"), ("b", "2")]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_tag_set() {
        let key = encode_series_key(b"disk", &Tags::default());
        let (name, parsed) = parse_series_key(&key).unwrap();
        assert_eq!(name, b"disk");
        assert!(parsed.is_empty());
        assert_eq!(format_series_key(&key).unwrap(), "disk,[]");
    }

    #[test]
    fn test_read_series_key_consumes_exactly_one() {
        let a = encode_series_key(b"cpu", &tags(&[("region", "east")]));
        let b = encode_series_key(b"mem", &Tags::default());

        let mut data = a.clone();
        data.extend_from_slice(&b);

        let (first, rest) = read_series_key(&data).unwrap();
        assert_eq!(first, a.as_slice());
        let (second, rest) = read_series_key(rest).unwrap();
        assert_eq!(second, b.as_slice());
        assert!(rest.is_empty());

        assert!(read_series_key(&a[..a.len() - 1]).is_none());
    }

    #[test]
    fn test_compare_orders_by_name_then_tags() {
        let cpu_east = encode_series_key(b"cpu", &tags(&[("region", "east")]));
        let cpu_west = encode_series_key(b"cpu", &tags(&[("region", "west")]));
        let cpu_bare = encode_series_key(b"cpu", &Tags::default());
        let mem = encode_series_key(b"mem", &Tags::default());

        assert_eq!(compare_series_keys(&cpu_east, &cpu_west), Ordering::Less);
        assert_eq!(compare_series_keys(&cpu_west, &mem), Ordering::Less);
        assert_eq!(compare_series_keys(&cpu_bare, &cpu_east), Ordering::Less);
        assert_eq!(compare_series_keys(&mem, &mem), Ordering::Equal);
    }

    #[test]
    fn test_format() {
        let key = encode_series_key(b"cpu", &tags(&[("region", "east")]));
        assert_eq!(format_series_key(&key).unwrap(), "cpu,[{region east}]");
    }

    #[test]
    fn test_format_non_utf8_tag_bytes() {
        let t = Tags::new(vec![Tag::new(b"host".to_vec(), vec![0xff, 0xfe])]);
        let key = encode_series_key(b"cpu", &t);

        // invalid bytes render as replacement characters, never raw
        assert_eq!(
            format_series_key(&key).unwrap(),
            "cpu,[{host \u{fffd}\u{fffd}}]"
        );
    }
}
