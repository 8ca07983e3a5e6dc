//! Delta coding for posting lists.
//!
//! v1 writes each delta as a LEB128 uvarint. v2 writes Elias-γ codes,
//! packed LSB-first through a 64-bit register: a positive x is emitted
//! as floor(log2 x) zero bits, a one bit, then the low floor(log2 x)
//! bits of x. γ cannot represent 0, and a 0 delta terminates every
//! posting list, so the stream reserves one code point: 0 is written as
//! γ(16), and every value >= 16 is written as γ(value+1). The choice of
//! 16 is arbitrary but contractual between writer and reader.

use crate::index::buffer::Buffer;
use crate::index::Version;
use crate::utils::encoding::read_uvarint;

pub(crate) const DELTA_ZERO_ENC: u64 = 16;

/// Reason a delta stream could not be decoded. The index reader maps
/// this into its corruption handling.
pub(crate) type DeltaError = &'static str;

pub(crate) struct DeltaReader<'a> {
    version: Version,
    d: &'a [u8],
    b: u64,
    nb: u32,
}

impl<'a> DeltaReader<'a> {
    pub(crate) fn new(version: Version, data: &'a [u8]) -> DeltaReader<'a> {
        DeltaReader {
            version,
            d: data,
            b: 0,
            nb: 0,
        }
    }

    /// Drop any partially consumed byte. Called between posting lists:
    /// every list starts on a byte boundary.
    pub(crate) fn clear_bits(&mut self) {
        self.b = 0;
        self.nb = 0;
    }

    /// Unconsumed bytes (only meaningful after `clear_bits`).
    pub(crate) fn rest(&self) -> &'a [u8] {
        self.d
    }

    pub(crate) fn set_rest(&mut self, d: &'a [u8]) {
        self.d = d;
    }

    /// Read the next delta value.
    pub(crate) fn next(&mut self) -> Result<u64, DeltaError> {
        match self.version {
            Version::V2 => {
                let i = self.next64()?;
                Ok(if i == DELTA_ZERO_ENC {
                    0
                } else if i > DELTA_ZERO_ENC {
                    i - 1
                } else {
                    i
                })
            }
            Version::V1 => {
                let (delta, n) = read_uvarint(self.d).ok_or("invalid varint delta")?;
                self.d = &self.d[n..];
                Ok(delta)
            }
        }
    }

    /// Read one γ code from the bit stream.
    fn next64(&mut self) -> Result<u64, DeltaError> {
        // count the leading zero bits, refilling the register as needed
        let mut lg = 0u32;
        while self.b == 0 {
            if self.d.is_empty() || lg + self.nb > 65 {
                return Err("invalid gamma code");
            }
            lg += self.nb;
            self.b = self.d[0] as u64;
            self.nb = 8;
            self.d = &self.d[1..];
        }
        let nb = self.b.trailing_zeros();
        lg += nb;
        self.b = shr64(self.b, nb + 1);
        self.nb -= nb + 1;
        if lg > 63 {
            return Err("invalid gamma code");
        }

        // collect the lg explicit low bits
        let mut x = 1u64 << lg;
        let mut nb = 0u32;
        let mut lg = lg;
        while self.nb < lg {
            x |= shl64(self.b, nb);
            nb += self.nb;
            lg -= self.nb;
            if self.d.is_empty() || nb > 64 {
                return Err("invalid gamma code");
            }
            self.b = self.d[0] as u64;
            self.nb = 8;
            self.d = &self.d[1..];
        }
        x |= shl64(self.b & ((1u64 << lg) - 1), nb);
        self.b = shr64(self.b, lg);
        self.nb -= lg;
        Ok(x)
    }
}

#[inline]
fn shl64(x: u64, n: u32) -> u64 {
    if n >= 64 {
        0
    } else {
        x << n
    }
}

#[inline]
fn shr64(x: u64, n: u32) -> u64 {
    if n >= 64 {
        0
    } else {
        x >> n
    }
}

/// Writer half. Holds only the bit register; the output buffer is
/// passed per call so it can be shared with the surrounding posting
/// writer.
pub(crate) struct DeltaWriter {
    b: u64,
    nb: u32,
}

impl DeltaWriter {
    pub(crate) fn new() -> DeltaWriter {
        DeltaWriter { b: 0, nb: 0 }
    }

    pub(crate) fn write(&mut self, out: &mut Buffer, x: u64) -> crate::error::Result<()> {
        if out.version() == Version::V2 {
            let x = if x == 0 {
                DELTA_ZERO_ENC
            } else if x >= DELTA_ZERO_ENC {
                x + 1
            } else {
                x
            };
            return self.write_bits(out, x);
        }
        out.write_uvarint(x)
    }

    fn write_bits(&mut self, out: &mut Buffer, x: u64) -> crate::error::Result<()> {
        debug_assert!(x > 0, "bad gamma write");
        let lg = 63 - x.leading_zeros();
        let mut x = x & ((1u64 << lg) - 1);
        let mut lg = lg;

        self.nb += lg;
        if self.nb >= 8 {
            self.flush_bits(out)?;
        }
        self.b |= 1 << self.nb;
        self.nb += 1;
        if lg > 32 {
            self.b |= ((x as u32) as u64) << self.nb;
            self.nb += 32;
            x >>= 32;
            self.flush_bits(out)?;
            lg -= 32;
        }
        self.b |= x << self.nb;
        self.nb += lg;
        if self.nb >= 8 {
            self.flush_bits(out)?;
        }
        Ok(())
    }

    fn flush_bits(&mut self, out: &mut Buffer) -> crate::error::Result<()> {
        while self.nb >= 8 {
            out.write_byte(self.b as u8)?;
            self.b >>= 8;
            self.nb -= 8;
        }
        Ok(())
    }

    /// Emit the final partial byte, ending the list on a byte boundary.
    pub(crate) fn flush(&mut self, out: &mut Buffer) -> crate::error::Result<()> {
        self.flush_bits(out)?;
        if self.nb > 0 {
            out.write_byte(self.b as u8)?;
        }
        self.b = 0;
        self.nb = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn encode(version: Version, values: &[u64]) -> Vec<u8> {
        let mut out = Buffer::temp(version).unwrap();
        let mut w = DeltaWriter::new();
        for &v in values {
            w.write(&mut out, v).unwrap();
        }
        w.flush(&mut out).unwrap();
        let mut data = Vec::new();
        out.finish().unwrap().read_to_end(&mut data).unwrap();
        data
    }

    fn roundtrip(version: Version, values: &[u64]) {
        let data = encode(version, values);
        let mut r = DeltaReader::new(version, &data);
        for &v in values {
            assert_eq!(r.next().unwrap(), v, "version {:?}", version);
        }
    }

    #[test]
    fn gamma_roundtrip() {
        roundtrip(Version::V2, &[1, 2, 3, 1, 2, 3, 4, 5, 6, 10000, 1, 2, 3]);
    }

    #[test]
    fn gamma_roundtrip_exhaustive_small() {
        let values: Vec<u64> = (0..2000).collect();
        roundtrip(Version::V2, &values);
    }

    #[test]
    fn gamma_roundtrip_large_values() {
        roundtrip(
            Version::V2,
            &[0, 1, 15, 16, 17, 1 << 20, (1 << 32) + 12345, (1 << 40) - 1, 0],
        );
    }

    #[test]
    fn gamma_no_trailing_bytes() {
        // The encoding of [1,2,3,...,3] must decode with nothing left over
        // beyond the final partial byte.
        let values = [1u64, 2, 3, 1, 2, 3, 4, 5, 6, 10000, 1, 2, 3];
        let data = encode(Version::V2, &values);
        let mut r = DeltaReader::new(Version::V2, &data);
        for &v in &values {
            assert_eq!(r.next().unwrap(), v);
        }
        r.clear_bits();
        assert!(r.rest().is_empty());
    }

    #[test]
    fn zero_encodes_as_gamma_sixteen() {
        // 0 and 16 share a code space: 0 -> γ(16), 16 -> γ(17).
        let zero = encode(Version::V2, &[0]);
        let mut r = DeltaReader::new(Version::V2, &zero);
        assert_eq!(r.next64().unwrap(), DELTA_ZERO_ENC);

        let sixteen = encode(Version::V2, &[16]);
        let mut r = DeltaReader::new(Version::V2, &sixteen);
        assert_eq!(r.next64().unwrap(), 17);
    }

    #[test]
    fn varint_roundtrip() {
        roundtrip(Version::V1, &[0, 1, 127, 128, 300, 1 << 30, 0]);
    }

    #[test]
    fn truncated_gamma_is_error() {
        let mut data = encode(Version::V2, &[10000, 10000, 10000]);
        data.truncate(1);
        let mut r = DeltaReader::new(Version::V2, &data);
        let mut ok = 0;
        for _ in 0..4 {
            match r.next() {
                Ok(_) => ok += 1,
                Err(_) => return,
            }
        }
        panic!("decoded {} values from truncated stream", ok);
    }

    #[test]
    fn all_zero_bytes_is_error() {
        // A run of zero bytes never produces a stop bit.
        let data = [0u8; 16];
        let mut r = DeltaReader::new(Version::V2, &data);
        assert!(r.next().is_err());
    }
}
