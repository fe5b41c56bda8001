/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN64: usize = 10;

/// LEB128 variable-length integers, compatible with Go's binary.Uvarint.
pub trait VarInt: Sized + Copy {
    /// Number of bytes this value occupies once encoded.
    fn required_space(self) -> usize;

    /// Decodes a value from the front of `src`. Returns the value and the
    /// number of bytes consumed, or `None` if `src` is truncated.
    fn decode_var(src: &[u8]) -> Option<(Self, usize)>;

    /// Encodes the value into the front of `dst`, returning the number of
    /// bytes written. `dst` must hold at least `required_space` bytes.
    fn encode_var(self, dst: &mut [u8]) -> usize;
}

impl VarInt for u64 {
    fn required_space(self) -> usize {
        let mut v = self;
        let mut n = 1;
        while v >= 0x80 {
            v >>= 7;
            n += 1;
        }
        n
    }

    fn decode_var(src: &[u8]) -> Option<(Self, usize)> {
        let mut result: u64 = 0;
        let mut shift = 0;

        for (i, b) in src.iter().enumerate() {
            if i >= MAX_VARINT_LEN64 {
                return None;
            }

            let low = (b & 0x7f) as u64;
            if shift == 63 && low > 1 {
                // overflow past 64 bits
                return None;
            }
            result |= low << shift;

            if b & 0x80 == 0 {
                return Some((result, i + 1));
            }
            shift += 7;
        }

        None
    }

    fn encode_var(self, dst: &mut [u8]) -> usize {
        let mut v = self;
        let mut n = 0;
        while v >= 0x80 {
            dst[n] = (v as u8) | 0x80;
            v >>= 7;
            n += 1;
        }
        dst[n] = v as u8;
        n + 1
    }
}

/// Appends a varint to a growable buffer.
pub fn put_uvarint(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; MAX_VARINT_LEN64];
    let n = v.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

/// Reads a varint from the front of `src`.
pub fn read_uvarint(src: &[u8]) -> Option<(u64, usize)> {
    u64::decode_var(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = [0u8; MAX_VARINT_LEN64];
            let n = v.encode_var(&mut buf);
            assert_eq!(n, v.required_space());

            let (decoded, consumed) = u64::decode_var(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut buf = [0u8; MAX_VARINT_LEN64];
        let n = u64::MAX.encode_var(&mut buf);
        assert!(u64::decode_var(&buf[..n - 1]).is_none());
        assert!(u64::decode_var(&[]).is_none());
    }

    #[test]
    fn test_put_and_read() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 300);
        put_uvarint(&mut buf, 7);

        let (a, n) = read_uvarint(&buf).unwrap();
        assert_eq!(a, 300);
        let (b, m) = read_uvarint(&buf[n..]).unwrap();
        assert_eq!(b, 7);
        assert_eq!(n + m, buf.len());
    }
}
