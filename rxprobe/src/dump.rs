//! Hex dump of raw buffer contents.

use std::fmt;

const BYTES_PER_LINE: usize = 16;

/// Renders `bytes` as offset, hex and printable-ASCII columns under a
/// `desc:` header line.
pub struct HexDump<'a> {
    desc: &'a str,
    bytes: &'a [u8],
}

impl<'a> HexDump<'a> {
    #[must_use]
    pub const fn new(desc: &'a str, bytes: &'a [u8]) -> Self {
        Self { desc, bytes }
    }
}

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.desc)?;
        if self.bytes.is_empty() {
            return writeln!(f, "  ZERO LENGTH");
        }
        for (line, chunk) in self.bytes.chunks(BYTES_PER_LINE).enumerate() {
            write!(f, "  {:04x} ", line * BYTES_PER_LINE)?;
            for byte in chunk {
                write!(f, " {byte:02x}")?;
            }
            for _ in chunk.len()..BYTES_PER_LINE {
                f.write_str("   ")?;
            }
            f.write_str("  ")?;
            for &byte in chunk {
                let c = if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                };
                write!(f, "{c}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
