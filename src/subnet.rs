/*! Sorted-range subnet tables with binary-search lookup.

A table file is a fixed-size header row followed by data rows sorted by
address. Every range contributes two sentinel rows: the lower sentinel with
the range flag cleared, the upper with it set. Lookup binary-searches for
the smallest sentinel key that is greater than or equal to the query; a hit
returns the upper sentinel's row index, a miss returns 0 — row 0 is the
header, whose metadata reads as "unknown", so callers can use the result
unconditionally.

Tables can be memory-mapped read-only or read into memory; the row layout
is identical either way (little-endian, fixed width).
*/

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::fs::File;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Compiled-in format version; a file with any other version is rejected.
pub const SUBNET_VERSION: u16 = 5;
/// Compiled-in table revision; mismatch is fatal at startup.
pub const SUBNET_REVISION: u32 = 1;

const ROW4_LEN: usize = 65;
const ROW6_LEN: usize = 77;
const ORG_LEN: usize = 32;

// Field offsets relative to the end of the key.
const OFF_NET_VEC: usize = 0;
const OFF_NET_ID: usize = 4;
const OFF_ASN: usize = 8;
const OFF_LAT: usize = 12;
const OFF_LNG: usize = 16;
const OFF_PREC: usize = 20;
const OFF_LOC: usize = 24;
const OFF_ORG: usize = 28;
const OFF_FLAG: usize = 28 + ORG_LEN;

enum TableData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl TableData {
    fn bytes(&self) -> &[u8] {
        match self {
            TableData::Mapped(m) => m,
            TableData::Owned(v) => v,
        }
    }
}

struct RawTable {
    data: TableData,
    key_len: usize,
    row_len: usize,
    rows: usize,
}

impl RawTable {
    fn validate(data: TableData, key_len: usize, row_len: usize) -> Result<RawTable> {
        let bytes = data.bytes();
        if bytes.len() < row_len {
            return Err(Error::SubnetFileTooShort(bytes.len()));
        }
        let header_meta = &bytes[key_len..];
        let net_vec = LittleEndian::read_u32(&header_meta[OFF_NET_VEC..]);
        let version = (net_vec & 0x7fff) as u16;
        if version != SUBNET_VERSION {
            return Err(Error::ConfigMismatch {
                expected: SUBNET_VERSION,
                found: version,
            });
        }
        let revision = LittleEndian::read_u32(&header_meta[OFF_NET_ID..]);
        if revision != SUBNET_REVISION {
            return Err(Error::ConfigMismatch {
                expected: SUBNET_REVISION as u16,
                found: revision as u16,
            });
        }
        let rows = bytes.len() / row_len;
        Ok(RawTable {
            data,
            key_len,
            row_len,
            rows,
        })
    }

    fn row(&self, index: usize) -> &[u8] {
        let off = index * self.row_len;
        &self.data.bytes()[off..off + self.row_len]
    }

    fn meta(&self, index: usize) -> &[u8] {
        &self.row(index)[self.key_len..]
    }

    fn is_upper(&self, index: usize) -> bool {
        self.meta(index)[OFF_FLAG] & 0x01 != 0
    }

    /// Smallest data-row index whose key is >= `query`, by the supplied
    /// key extractor. Returns `rows` when every key is smaller.
    fn partition<K: Ord, F: Fn(&[u8]) -> K>(&self, query: K, key_of: F) -> usize {
        let mut lo = 1; // row 0 is the header
        let mut hi = self.rows;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if key_of(self.row(mid)) < query {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

macro_rules! accessors {
    () => {
        /// Network identifier of a row; 0 for the header row.
        pub fn net_id(&self, row: usize) -> u32 {
            LittleEndian::read_u32(&self.raw.meta(row)[OFF_NET_ID..])
        }

        pub fn net_vec(&self, row: usize) -> u32 {
            LittleEndian::read_u32(&self.raw.meta(row)[OFF_NET_VEC..])
        }

        pub fn asn(&self, row: usize) -> u32 {
            LittleEndian::read_u32(&self.raw.meta(row)[OFF_ASN..])
        }

        pub fn lat(&self, row: usize) -> f32 {
            LittleEndian::read_f32(&self.raw.meta(row)[OFF_LAT..])
        }

        pub fn lng(&self, row: usize) -> f32 {
            LittleEndian::read_f32(&self.raw.meta(row)[OFF_LNG..])
        }

        pub fn precision(&self, row: usize) -> f32 {
            LittleEndian::read_f32(&self.raw.meta(row)[OFF_PREC..])
        }

        /// Two-letter location code (padded to 4 bytes in the file).
        pub fn loc(&self, row: usize) -> &str {
            let raw = &self.raw.meta(row)[OFF_LOC..OFF_LOC + 4];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(4);
            std::str::from_utf8(&raw[..end]).unwrap_or("-")
        }

        pub fn organization(&self, row: usize) -> &str {
            let raw = &self.raw.meta(row)[OFF_ORG..OFF_ORG + ORG_LEN];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(ORG_LEN);
            std::str::from_utf8(&raw[..end]).unwrap_or("-")
        }

        pub fn rows(&self) -> usize {
            self.raw.rows
        }
    };
}

/// IPv4 subnet table.
pub struct SubnetTable4 {
    raw: RawTable,
}

impl SubnetTable4 {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SubnetTable4> {
        let data = std::fs::read(path)?;
        Ok(SubnetTable4 {
            raw: RawTable::validate(TableData::Owned(data), 4, ROW4_LEN)?,
        })
    }

    /// Memory-map the table read-only instead of reading it into memory.
    pub fn open_mmap<P: AsRef<Path>>(path: P) -> Result<SubnetTable4> {
        let file = File::open(path)?;
        // Safety: the table file is opened read-only and treated as
        // immutable for the lifetime of the map.
        let map = unsafe { Mmap::map(&file)? };
        Ok(SubnetTable4 {
            raw: RawTable::validate(TableData::Mapped(map), 4, ROW4_LEN)?,
        })
    }

    fn key(row: &[u8]) -> u32 {
        LittleEndian::read_u32(row)
    }

    fn find(&self, query: u32) -> usize {
        let idx = self.raw.partition(query, Self::key);
        if idx >= self.raw.rows {
            return 0;
        }
        if self.raw.is_upper(idx) {
            return idx;
        }
        // Lower sentinel: a hit only when the query is exactly the range
        // start, in which case the matching upper sentinel follows.
        if Self::key(self.raw.row(idx)) == query && idx + 1 < self.raw.rows {
            return idx + 1;
        }
        0
    }

    /// Row index covering `ip`, or 0 when the address is in no range.
    pub fn lookup(&self, ip: Ipv4Addr) -> usize {
        self.find(u32::from(ip))
    }

    /// Secondary search for ethertype-qualified keys (MAC-label tables):
    /// the low 16 bits of the ethertype are folded into the query.
    pub fn lookup_qualified(&self, ip: Ipv4Addr, ethertype: u16) -> usize {
        let hit = self.find(u32::from(ip));
        if hit != 0 {
            return hit;
        }
        self.find(u32::from(ip) | u32::from(ethertype))
    }

    accessors!();
}

/// IPv6 subnet table; identical layout with 16-byte big-endian keys.
pub struct SubnetTable6 {
    raw: RawTable,
}

impl SubnetTable6 {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SubnetTable6> {
        let data = std::fs::read(path)?;
        Ok(SubnetTable6 {
            raw: RawTable::validate(TableData::Owned(data), 16, ROW6_LEN)?,
        })
    }

    pub fn open_mmap<P: AsRef<Path>>(path: P) -> Result<SubnetTable6> {
        let file = File::open(path)?;
        // Safety: read-only map of an immutable table file.
        let map = unsafe { Mmap::map(&file)? };
        Ok(SubnetTable6 {
            raw: RawTable::validate(TableData::Mapped(map), 16, ROW6_LEN)?,
        })
    }

    fn key(row: &[u8]) -> u128 {
        let mut oct = [0u8; 16];
        oct.copy_from_slice(&row[..16]);
        u128::from_be_bytes(oct)
    }

    pub fn lookup(&self, ip: Ipv6Addr) -> usize {
        let query = u128::from_be_bytes(ip.octets());
        let idx = self.raw.partition(query, Self::key);
        if idx >= self.raw.rows {
            return 0;
        }
        if self.raw.is_upper(idx) {
            return idx;
        }
        if Self::key(self.raw.row(idx)) == query && idx + 1 < self.raw.rows {
            return idx + 1;
        }
        0
    }

    accessors!();
}

/// Metadata shared by both sentinel rows of a range.
#[derive(Clone, Debug, Default)]
pub struct SubnetMeta {
    pub net_vec: u32,
    pub net_id: u32,
    pub asn: u32,
    pub lat: f32,
    pub lng: f32,
    pub precision: f32,
    pub loc: String,
    pub organization: String,
}

/// Builds table files in the on-disk format; ranges may be added in any
/// order and are sorted before writing.
#[derive(Default)]
pub struct SubnetTableBuilder {
    ranges4: Vec<(u32, u32, SubnetMeta)>,
    ranges6: Vec<(u128, u128, SubnetMeta)>,
}

impl SubnetTableBuilder {
    pub fn new() -> SubnetTableBuilder {
        SubnetTableBuilder::default()
    }

    pub fn add_range4(&mut self, start: Ipv4Addr, end: Ipv4Addr, meta: SubnetMeta) {
        self.ranges4.push((u32::from(start), u32::from(end), meta));
    }

    pub fn add_range6(&mut self, start: Ipv6Addr, end: Ipv6Addr, meta: SubnetMeta) {
        self.ranges6.push((
            u128::from_be_bytes(start.octets()),
            u128::from_be_bytes(end.octets()),
            meta,
        ));
    }

    fn put_meta(out: &mut Vec<u8>, meta: &SubnetMeta, flag: u8) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, meta.net_vec);
        out.extend_from_slice(&buf);
        LittleEndian::write_u32(&mut buf, meta.net_id);
        out.extend_from_slice(&buf);
        LittleEndian::write_u32(&mut buf, meta.asn);
        out.extend_from_slice(&buf);
        LittleEndian::write_f32(&mut buf, meta.lat);
        out.extend_from_slice(&buf);
        LittleEndian::write_f32(&mut buf, meta.lng);
        out.extend_from_slice(&buf);
        LittleEndian::write_f32(&mut buf, meta.precision);
        out.extend_from_slice(&buf);
        let mut loc = [0u8; 4];
        let n = meta.loc.len().min(4);
        loc[..n].copy_from_slice(&meta.loc.as_bytes()[..n]);
        out.extend_from_slice(&loc);
        let mut org = [0u8; ORG_LEN];
        let n = meta.organization.len().min(ORG_LEN);
        org[..n].copy_from_slice(&meta.organization.as_bytes()[..n]);
        out.extend_from_slice(&org);
        out.push(flag);
    }

    pub fn build4(&mut self) -> Vec<u8> {
        self.ranges4.sort_by_key(|(start, _, _)| *start);
        let mut out = Vec::new();
        let header = SubnetMeta {
            net_vec: u32::from(SUBNET_VERSION) | 0x8000_0000,
            net_id: SUBNET_REVISION,
            loc: "unknown".into(),
            organization: "unknown".into(),
            ..SubnetMeta::default()
        };
        let mut key = [0u8; 4];
        LittleEndian::write_u32(&mut key, self.ranges4.len() as u32 * 2);
        out.extend_from_slice(&key);
        Self::put_meta(&mut out, &header, 0);
        for (start, end, meta) in &self.ranges4 {
            LittleEndian::write_u32(&mut key, *start);
            out.extend_from_slice(&key);
            Self::put_meta(&mut out, meta, 0);
            LittleEndian::write_u32(&mut key, *end);
            out.extend_from_slice(&key);
            Self::put_meta(&mut out, meta, 1);
        }
        out
    }

    pub fn build6(&mut self) -> Vec<u8> {
        self.ranges6.sort_by_key(|(start, _, _)| *start);
        let mut out = Vec::new();
        let header = SubnetMeta {
            net_vec: u32::from(SUBNET_VERSION) | 0x8000_0000,
            net_id: SUBNET_REVISION,
            loc: "unknown".into(),
            organization: "unknown".into(),
            ..SubnetMeta::default()
        };
        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, self.ranges6.len() as u32 * 2);
        out.extend_from_slice(&count);
        out.extend_from_slice(&[0u8; 12]);
        Self::put_meta(&mut out, &header, 0);
        for (start, end, meta) in &self.ranges6 {
            out.extend_from_slice(&start.to_be_bytes());
            Self::put_meta(&mut out, meta, 0);
            out.extend_from_slice(&end.to_be_bytes());
            Self::put_meta(&mut out, meta, 1);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table_with(ranges: &[(&str, &str, u32, &str)]) -> SubnetTable4 {
        let mut builder = SubnetTableBuilder::new();
        for (start, end, net_id, loc) in ranges {
            builder.add_range4(
                start.parse().unwrap(),
                end.parse().unwrap(),
                SubnetMeta {
                    net_id: *net_id,
                    loc: (*loc).into(),
                    organization: "Test Org".into(),
                    ..SubnetMeta::default()
                },
            );
        }
        let bytes = builder.build4();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        SubnetTable4::open(file.path()).unwrap()
    }

    #[test]
    fn single_range_boundaries() {
        let table = table_with(&[("10.0.0.0", "10.0.0.255", 42, "CH")]);

        let hit = table.lookup("10.0.0.0".parse().unwrap());
        assert_ne!(hit, 0);
        assert_eq!(table.net_id(hit), 42);
        assert_eq!(table.loc(hit), "CH");

        let hit = table.lookup("10.0.0.255".parse().unwrap());
        assert_ne!(hit, 0);
        assert_eq!(table.net_id(hit), 42);

        assert_eq!(table.lookup("10.0.1.0".parse().unwrap()), 0);
        assert_eq!(table.lookup("9.255.255.255".parse().unwrap()), 0);
        // Row 0 reads as unknown.
        assert_eq!(table.net_id(0), SUBNET_REVISION);
        assert_eq!(table.organization(0), "unknown");
    }

    #[test]
    fn multiple_ranges_any_order() {
        let table = table_with(&[
            ("192.168.0.0", "192.168.255.255", 7, "DE"),
            ("10.0.0.0", "10.255.255.255", 3, "CH"),
        ]);
        let hit = table.lookup("10.20.30.40".parse().unwrap());
        assert_eq!(table.net_id(hit), 3);
        let hit = table.lookup("192.168.1.1".parse().unwrap());
        assert_eq!(table.net_id(hit), 7);
        assert_eq!(table.lookup("172.16.0.1".parse().unwrap()), 0);
    }

    #[test]
    fn mmap_matches_read() {
        let mut builder = SubnetTableBuilder::new();
        builder.add_range4(
            "10.0.0.0".parse().unwrap(),
            "10.0.0.255".parse().unwrap(),
            SubnetMeta {
                net_id: 42,
                ..SubnetMeta::default()
            },
        );
        let bytes = builder.build4();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let mapped = SubnetTable4::open_mmap(file.path()).unwrap();
        let owned = SubnetTable4::open(file.path()).unwrap();
        let ip = "10.0.0.7".parse().unwrap();
        assert_eq!(mapped.lookup(ip), owned.lookup(ip));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut builder = SubnetTableBuilder::new();
        let mut bytes = builder.build4();
        // Corrupt the version field in the header row.
        bytes[4] = 0xff;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        assert!(matches!(
            SubnetTable4::open(file.path()),
            Err(Error::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn ipv6_lookup() {
        let mut builder = SubnetTableBuilder::new();
        builder.add_range6(
            "2001:db8::".parse().unwrap(),
            "2001:db8::ffff".parse().unwrap(),
            SubnetMeta {
                net_id: 11,
                ..SubnetMeta::default()
            },
        );
        let bytes = builder.build6();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let table = SubnetTable6::open(file.path()).unwrap();
        let hit = table.lookup("2001:db8::42".parse().unwrap());
        assert_eq!(table.net_id(hit), 11);
        assert_eq!(table.lookup("2001:db9::1".parse().unwrap()), 0);
    }
}
