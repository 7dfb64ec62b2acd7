/*! Bounds-checked, endian-aware reader over a captured buffer.

Every decoder walks packet payloads through a [`ByteCursor`]. The contract
is uniform: a read succeeds iff enough bytes remain before the snap length,
otherwise it returns [`ParseError::Snapped`] and the position is unchanged.
*/

use crate::error::{ParseError, ParseResult};

/// Source encoding for [`ByteCursor::read_str`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StrEncoding {
    Utf8,
    Utf16Le,
}

/// Outcome of a bounded string read.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BoundedStr {
    pub value: String,
    /// The source was longer than the destination cap; callers usually
    /// record this as a `TRUNCATED_STRING` status bit.
    pub truncated: bool,
}

pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> ByteCursor<'a> {
        ByteCursor { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Absolute seek. Seeking past the end is allowed; the next read will
    /// report `Snapped`.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn skip(&mut self, n: usize) -> ParseResult<()> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> ParseResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ParseError::Snapped);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> ParseResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> ParseResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> ParseResult<u64> {
        let b = self.take(8)?;
        let mut tmp = [0; 8];
        tmp.copy_from_slice(b);
        Ok(u64::from_be_bytes(tmp))
    }

    pub fn read_le_u16(&mut self) -> ParseResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_le_u32(&mut self) -> ParseResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_le_u64(&mut self) -> ParseResult<u64> {
        let b = self.take(8)?;
        let mut tmp = [0; 8];
        tmp.copy_from_slice(b);
        Ok(u64::from_le_bytes(tmp))
    }

    /// Copy exactly `dst.len()` bytes into `dst`.
    pub fn read_n(&mut self, dst: &mut [u8]) -> ParseResult<()> {
        let src = self.take(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Borrow the next `n` bytes without copying.
    pub fn read_slice(&mut self, n: usize) -> ParseResult<&'a [u8]> {
        self.take(n)
    }

    /// Read `len` source bytes and convert them into a string bounded by
    /// `cap` bytes. The cursor always advances by `len` (all source bytes
    /// are consumed even when the destination clamps), so a truncated
    /// string never desynchronizes the walk.
    pub fn read_str(
        &mut self,
        cap: usize,
        len: usize,
        enc: StrEncoding,
    ) -> ParseResult<BoundedStr> {
        let src = self.take(len)?;
        let mut value = match enc {
            StrEncoding::Utf8 => String::from_utf8_lossy(src).into_owned(),
            StrEncoding::Utf16Le => {
                let units: Vec<u16> = src
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        };
        // Embedded nuls terminate the value, as in the wire formats.
        if let Some(nul) = value.find('\0') {
            value.truncate(nul);
        }
        let mut truncated = false;
        if value.len() > cap {
            let mut cut = cap;
            while !value.is_char_boundary(cut) {
                cut -= 1;
            }
            value.truncate(cut);
            truncated = true;
        }
        Ok(BoundedStr { value, truncated })
    }

    /// Read `n` raw bytes and render them as 2n lowercase hex characters.
    pub fn read_hex(&mut self, n: usize) -> ParseResult<String> {
        let src = self.take(n)?;
        let mut out = String::with_capacity(2 * n);
        for b in src {
            out.push_str(&format!("{b:02x}"));
        }
        Ok(out)
    }

    /// Locate `needle` from the current position and leave the cursor at
    /// the start of the match. Returns `false` (position unchanged) when
    /// the pattern is absent.
    pub fn memmem(&mut self, needle: &[u8]) -> bool {
        if needle.is_empty() {
            return true;
        }
        let hay = &self.buf[self.pos.min(self.buf.len())..];
        match hay.windows(needle.len()).position(|w| w == needle) {
            Some(off) => {
                self.pos += off;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_read_leaves_position() {
        let mut cur = ByteCursor::new(&[0xde, 0xad]);
        assert_eq!(cur.read_u16().unwrap(), 0xdead);
        assert_eq!(cur.read_u32(), Err(ParseError::Snapped));
        assert_eq!(cur.tell(), 2);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn endianness() {
        let mut cur = ByteCursor::new(&[0x01, 0x02, 0x01, 0x02]);
        assert_eq!(cur.read_u16().unwrap(), 0x0102);
        assert_eq!(cur.read_le_u16().unwrap(), 0x0201);
    }

    #[test]
    fn bounded_string_clamps_and_flags() {
        // Source one byte longer than the cap.
        let mut cur = ByteCursor::new(b"Switch-A!");
        let s = cur.read_str(8, 9, StrEncoding::Utf8).unwrap();
        assert_eq!(s.value, "Switch-A");
        assert!(s.truncated);
        // All 9 source bytes were consumed.
        assert_eq!(cur.tell(), 9);
    }

    #[test]
    fn embedded_nul_terminates() {
        let mut cur = ByteCursor::new(b"eth0\0junk");
        let s = cur.read_str(25, 9, StrEncoding::Utf8).unwrap();
        assert_eq!(s.value, "eth0");
        assert!(!s.truncated);
    }

    #[test]
    fn utf16le_string() {
        let raw: &[u8] = &[b'C', 0, b'O', 0, b'R', 0, b'P', 0];
        let mut cur = ByteCursor::new(raw);
        let s = cur.read_str(64, 8, StrEncoding::Utf16Le).unwrap();
        assert_eq!(s.value, "CORP");
    }

    #[test]
    fn hex_dump() {
        let mut cur = ByteCursor::new(&[0x8b, 0x7f, 0xe3, 0xa9]);
        assert_eq!(cur.read_hex(4).unwrap(), "8b7fe3a9");
    }

    #[test]
    fn memmem_anchors() {
        let mut cur = ByteCursor::new(b"xxNTLMSSP\0yy");
        assert!(cur.memmem(b"NTLMSSP\0"));
        assert_eq!(cur.tell(), 2);
        assert!(!cur.memmem(b"missing"));
        assert_eq!(cur.tell(), 2);
    }

    #[test]
    fn seek_past_end_snaps() {
        let mut cur = ByteCursor::new(&[1, 2, 3]);
        cur.seek(10);
        assert_eq!(cur.read_u8(), Err(ParseError::Snapped));
    }
}
