//! Intel HEX images

use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HexError {
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Line {line}: checksum mismatch")]
    Checksum { line: usize },

    #[error("Data at 0x{address:08X} defined twice")]
    Overlap { address: u32 },

    #[error("Missing end-of-file record")]
    MissingEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contiguous bytes starting at `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryArea {
    pub address: u32,
    pub data: Vec<u8>,
}

impl MemoryArea {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First address after the area
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }
}

/// Parsed HEX file with adjacent records merged
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexImage {
    pub areas: Vec<MemoryArea>,
    /// Entry point from a type 03 or 05 record
    pub start_address: Option<u32>,
}

impl HexImage {
    pub fn load(path: &Path) -> Result<Self, HexError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse records 00 to 05, verifying every checksum
    pub fn parse(content: &str) -> Result<Self, HexError> {
        let mut chunks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut base: u32 = 0;
        let mut start_address = None;
        let mut saw_eof = false;

        for (number, raw) in content.lines().enumerate() {
            let line = number + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if saw_eof {
                return Err(syntax(line, "record after end-of-file"));
            }

            let body = raw
                .strip_prefix(':')
                .ok_or_else(|| syntax(line, "missing ':'"))?;
            let bytes = decode(body).ok_or_else(|| syntax(line, "invalid hex digits"))?;
            if bytes.len() < 5 {
                return Err(syntax(line, "record too short"));
            }

            let count = bytes[0] as usize;
            if bytes.len() != count + 5 {
                return Err(syntax(line, "length does not match byte count"));
            }
            let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            if sum != 0 {
                return Err(HexError::Checksum { line });
            }

            let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
            let data = &bytes[4..4 + count];

            match bytes[3] {
                0x00 => {
                    let address = base.wrapping_add(u32::from(offset));
                    if !data.is_empty() {
                        check_free(&chunks, address, data.len())?;
                        chunks.insert(address, data.to_vec());
                    }
                }
                0x01 => saw_eof = true,
                0x02 => {
                    let segment = u16::from_be_bytes(pair(data, line)?);
                    base = u32::from(segment) << 4;
                }
                0x03 => {
                    let words = quad(data, line)?;
                    let cs = u32::from(u16::from_be_bytes([words[0], words[1]]));
                    let ip = u32::from(u16::from_be_bytes([words[2], words[3]]));
                    start_address = Some((cs << 4) + ip);
                }
                0x04 => {
                    let upper = u16::from_be_bytes(pair(data, line)?);
                    base = u32::from(upper) << 16;
                }
                0x05 => start_address = Some(u32::from_be_bytes(quad(data, line)?)),
                other => {
                    return Err(syntax(line, &format!("unknown record type {:02X}", other)));
                }
            }
        }

        if !saw_eof {
            return Err(HexError::MissingEof);
        }

        Ok(Self {
            areas: merge(chunks)?,
            start_address,
        })
    }

    pub fn total_size(&self) -> usize {
        self.areas.iter().map(MemoryArea::len).sum()
    }
}

fn syntax(line: usize, message: &str) -> HexError {
    HexError::Syntax {
        line,
        message: message.to_string(),
    }
}

fn decode(body: &str) -> Option<Vec<u8>> {
    if body.len() % 2 != 0 {
        return None;
    }
    (0..body.len())
        .step_by(2)
        .map(|i| body.get(i..i + 2).and_then(|s| u8::from_str_radix(s, 16).ok()))
        .collect()
}

fn pair(data: &[u8], line: usize) -> Result<[u8; 2], HexError> {
    data.try_into()
        .map_err(|_| syntax(line, "address record needs 2 data bytes"))
}

fn quad(data: &[u8], line: usize) -> Result<[u8; 4], HexError> {
    data.try_into()
        .map_err(|_| syntax(line, "start address record needs 4 data bytes"))
}

/// Reject a record intersecting data already defined by an earlier record
fn check_free(
    chunks: &BTreeMap<u32, Vec<u8>>,
    address: u32,
    len: usize,
) -> Result<(), HexError> {
    let end = u64::from(address) + len as u64;
    if let Some((&start, data)) = chunks.range(..=address).next_back() {
        if u64::from(start) + data.len() as u64 > u64::from(address) {
            return Err(HexError::Overlap { address });
        }
    }
    if let Some((&start, _)) = chunks.range(address..).next() {
        if u64::from(start) < end {
            return Err(HexError::Overlap { address: start });
        }
    }
    Ok(())
}

/// Join sorted chunks into contiguous areas
fn merge(chunks: BTreeMap<u32, Vec<u8>>) -> Result<Vec<MemoryArea>, HexError> {
    let mut areas: Vec<MemoryArea> = Vec::new();

    for (address, data) in chunks {
        match areas.last_mut() {
            Some(last) if u64::from(address) < last.end() => {
                return Err(HexError::Overlap { address });
            }
            Some(last) if u64::from(address) == last.end() => last.data.extend(data),
            _ => areas.push(MemoryArea { address, data }),
        }
    }

    Ok(areas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Build one record with a valid checksum
    fn record(kind: u8, offset: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8];
        bytes.extend_from_slice(&offset.to_be_bytes());
        bytes.push(kind);
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(sum.wrapping_neg());
        let digits: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        format!(":{}\n", digits)
    }

    #[test]
    fn test_parse_known_file() {
        let content = "\
:10010000214601360121470136007EFE09D2190140
:100110002146017E17C20001FF5F16002148011928
:00000001FF
";
        let image = HexImage::parse(content).unwrap();
        assert_eq!(image.areas.len(), 1);
        assert_eq!(image.areas[0].address, 0x0100);
        assert_eq!(image.total_size(), 32);
        assert_eq!(&image.areas[0].data[..3], &[0x21, 0x46, 0x01]);
    }

    #[test]
    fn test_extended_linear_address() {
        let content = record(0x04, 0, &[0x08, 0x00])
            + &record(0x00, 0x0010, &[1, 2, 3, 4])
            + &record(0x05, 0, &[0x08, 0x00, 0x01, 0x00])
            + &record(0x01, 0, &[]);
        let image = HexImage::parse(&content).unwrap();
        assert_eq!(image.areas[0].address, 0x0800_0010);
        assert_eq!(image.start_address, Some(0x0800_0100));
    }

    #[test]
    fn test_extended_segment_address() {
        let content = record(0x02, 0, &[0x12, 0x00])
            + &record(0x00, 0x0004, &[0xAA])
            + &record(0x03, 0, &[0x00, 0x10, 0x00, 0x20])
            + &record(0x01, 0, &[]);
        let image = HexImage::parse(&content).unwrap();
        assert_eq!(image.areas[0].address, 0x12004);
        assert_eq!(image.start_address, Some(0x120));
    }

    #[test]
    fn test_separate_areas() {
        let content = record(0x00, 0x0000, &[1, 2])
            + &record(0x00, 0x0100, &[3])
            + &record(0x00, 0x0002, &[4])
            + &record(0x01, 0, &[]);
        let image = HexImage::parse(&content).unwrap();
        assert_eq!(
            image.areas,
            vec![
                MemoryArea {
                    address: 0,
                    data: vec![1, 2, 4]
                },
                MemoryArea {
                    address: 0x100,
                    data: vec![3]
                },
            ]
        );
    }

    #[test]
    fn test_checksum_error() {
        let content = ":0400000001020304F3\n:00000001FF\n";
        assert!(matches!(
            HexImage::parse(content),
            Err(HexError::Checksum { line: 1 })
        ));
    }

    #[test]
    fn test_overlap() {
        let content = record(0x00, 0x0000, &[1, 2, 3])
            + &record(0x00, 0x0002, &[9])
            + &record(0x01, 0, &[]);
        assert!(matches!(
            HexImage::parse(&content),
            Err(HexError::Overlap { address: 2 })
        ));
    }

    #[test]
    fn test_record_at_same_address() {
        let content = record(0x00, 0x0000, &[1, 2])
            + &record(0x00, 0x0000, &[3, 4])
            + &record(0x01, 0, &[]);
        assert!(matches!(
            HexImage::parse(&content),
            Err(HexError::Overlap { address: 0 })
        ));
    }

    #[test]
    fn test_record_reaching_into_later_data() {
        let content = record(0x00, 0x0010, &[1, 2])
            + &record(0x00, 0x000E, &[3, 4, 5])
            + &record(0x01, 0, &[]);
        assert!(matches!(
            HexImage::parse(&content),
            Err(HexError::Overlap { address: 0x10 })
        ));

        let adjacent = record(0x00, 0x0010, &[1, 2])
            + &record(0x00, 0x000E, &[3, 4])
            + &record(0x01, 0, &[]);
        let image = HexImage::parse(&adjacent).unwrap();
        assert_eq!(image.areas[0].data, vec![3, 4, 1, 2]);
    }

    #[test]
    fn test_missing_eof() {
        let content = record(0x00, 0, &[1]);
        assert!(matches!(HexImage::parse(&content), Err(HexError::MissingEof)));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            HexImage::parse("0400000001020304F2\n"),
            Err(HexError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            HexImage::parse(":04000000010203\n"),
            Err(HexError::Syntax { .. })
        ));
        assert!(matches!(
            HexImage::parse(":00000001FF\n:00000001FF\n"),
            Err(HexError::Syntax { line: 2, .. })
        ));
        let unknown = record(0x07, 0, &[]);
        assert!(matches!(
            HexImage::parse(&unknown),
            Err(HexError::Syntax { .. })
        ));
    }

    proptest! {
        #[test]
        fn test_split_records_merge(
            data in proptest::collection::vec(any::<u8>(), 1..200),
            split in 1usize..16,
        ) {
            let mut content = String::new();
            for (i, chunk) in data.chunks(split).enumerate() {
                content += &record(0x00, (0x200 + i * split) as u16, chunk);
            }
            content += &record(0x01, 0, &[]);

            let image = HexImage::parse(&content).unwrap();
            prop_assert_eq!(image.areas.len(), 1);
            prop_assert_eq!(image.areas[0].address, 0x200);
            prop_assert_eq!(&image.areas[0].data, &data);
        }
    }
}
