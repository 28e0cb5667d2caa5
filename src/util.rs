//! Useful helpers that don't really belong anywhere else.

use std::fmt;

/// Formats a byte slice as a classic hex dump: 16 bytes per line, prefixed by the address of the
/// line's first byte and followed by the printable ASCII characters.
pub struct HexDump<'a> {
    addr: u32,
    data: &'a [u8],
}

impl<'a> HexDump<'a> {
    pub fn new(addr: u32, data: &'a [u8]) -> Self {
        Self { addr, data }
    }
}

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LINE: usize = 16;

        for (i, line) in self.data.chunks(LINE).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:08x}: ", self.addr.wrapping_add((i * LINE) as u32))?;

            for byte in line {
                write!(f, "{byte:02x} ")?;
            }
            for _ in line.len()..LINE {
                write!(f, "   ")?;
            }

            write!(f, " ")?;
            for &byte in line {
                let c = if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                };
                write!(f, "{c}")?;
            }
        }

        Ok(())
    }
}

#[test]
fn test_hexdump() {
    let data: Vec<u8> = (0x41..0x41 + 20).collect();
    let text = HexDump::new(0x9D80_0010, &data).to_string();
    let lines: Vec<_> = text.lines().collect();

    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        "9d800010: 41 42 43 44 45 46 47 48 49 4a 4b 4c 4d 4e 4f 50  ABCDEFGHIJKLMNOP"
    );
    assert_eq!(
        lines[1],
        format!("9d800020: 51 52 53 54 {} QRST", "   ".repeat(12))
    );
}

#[test]
fn test_hexdump_unprintable() {
    let text = HexDump::new(0, &[0x00, 0x7F, b'a']).to_string();
    assert!(text.ends_with(" ..a"));
}
