//! The magnetic surface: 84 halftracks of cyclic bit streams, plus the
//! GCR codec between sector data and flux patterns.
//!
//! GCR maps each nibble to a 5-bit code with at most two consecutive
//! zeros. On disk a sector is:
//!
//!   sync (5 x $FF = 40 one-bits)
//!   header block  (8 raw -> 10 GCR bytes: $08, checksum, sector, track,
//!                  id2, id1, $0F, $0F)
//!   header gap    (9 x $55)
//!   sync
//!   data block    (260 raw -> 325 GCR bytes: $07, 256 data, checksum,
//!                  2 x $00)
//!   tail gap      (9 x $55)
//!
//! Whole tracks live on odd halftracks (halftrack = 2*track - 1); the
//! even halftracks between them are unformatted.

use crate::d64::D64;
use crate::error::{Error, Result};
use crate::snapshot::{Reader, Writer};

/// Halftracks a 1541 head can reach.
pub const HALFTRACK_COUNT: usize = 84;

/// Nibble -> 5-bit GCR code.
const GCR_ENCODE: [u8; 16] = [
    0x0A, 0x0B, 0x12, 0x13, 0x0E, 0x0F, 0x16, 0x17, 0x09, 0x19, 0x1A, 0x1B, 0x0D, 0x1D, 0x1E,
    0x15,
];

/// 5-bit code -> nibble; $FF marks invalid codes.
const GCR_DECODE: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x08, 0x00, 0x01, 0xFF, 0x0C, 0x04,
    0x05, 0xFF, 0xFF, 0x02, 0x03, 0xFF, 0x0F, 0x06, 0x07, 0xFF, 0x09, 0x0A, 0x0B, 0xFF, 0x0D,
    0x0E, 0xFF,
];

/// Speed zone of a (whole) track: 3 is the outermost/fastest.
#[must_use]
pub fn speed_zone(track: u8) -> u8 {
    match track {
        1..=17 => 3,
        18..=24 => 2,
        25..=30 => 1,
        _ => 0,
    }
}

/// Unformatted halftrack capacity in bytes, by zone.
fn zone_capacity_bytes(zone: u8) -> usize {
    match zone {
        3 => 7692,
        2 => 7142,
        1 => 6666,
        _ => 6250,
    }
}

/// One side of one disk.
pub struct Disk {
    /// Byte-packed bit streams, index 1..=84 (index 0 unused).
    halftracks: Vec<Vec<u8>>,
    /// Stream length in bits per halftrack.
    lengths: [u32; HALFTRACK_COUNT + 1],
    /// Tracks encoded on the surface (35, 40 or 42).
    tracks: u8,
    modified: bool,
    write_protected: bool,
}

impl Disk {
    /// An unformatted disk.
    #[must_use]
    pub fn new() -> Self {
        let mut disk = Self {
            halftracks: vec![Vec::new(); HALFTRACK_COUNT + 1],
            lengths: [0; HALFTRACK_COUNT + 1],
            tracks: 35,
            modified: false,
            write_protected: false,
        };
        disk.clear();
        disk
    }

    /// Wipe the surface back to unformatted noise-free zeros.
    pub fn clear(&mut self) {
        for ht in 1..=HALFTRACK_COUNT {
            let zone = speed_zone(((ht + 1) / 2) as u8);
            let bytes = zone_capacity_bytes(zone);
            self.halftracks[ht] = vec![0; bytes];
            self.lengths[ht] = (bytes * 8) as u32;
        }
        self.modified = false;
    }

    #[must_use]
    pub fn tracks(&self) -> u8 {
        self.tracks
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    #[must_use]
    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    /// Bit length of a halftrack's cyclic stream.
    #[must_use]
    pub fn length_of_halftrack(&self, halftrack: u8) -> u32 {
        let ht = usize::from(halftrack);
        if (1..=HALFTRACK_COUNT).contains(&ht) {
            self.lengths[ht].max(8)
        } else {
            8
        }
    }

    /// Read one bit at (halftrack, bit offset).
    #[must_use]
    pub fn read_bit(&self, halftrack: u8, offset: u32) -> u8 {
        let ht = usize::from(halftrack);
        if !(1..=HALFTRACK_COUNT).contains(&ht) || self.lengths[ht] == 0 {
            return 0;
        }
        let offset = offset % self.lengths[ht];
        let byte = self.halftracks[ht][(offset / 8) as usize];
        (byte >> (7 - (offset % 8))) & 1
    }

    /// Write one bit at (halftrack, bit offset).
    pub fn write_bit(&mut self, halftrack: u8, offset: u32, bit: bool) {
        let ht = usize::from(halftrack);
        if !(1..=HALFTRACK_COUNT).contains(&ht) || self.lengths[ht] == 0 {
            return;
        }
        let offset = offset % self.lengths[ht];
        let mask = 0x80 >> (offset % 8);
        let byte = &mut self.halftracks[ht][(offset / 8) as usize];
        if bit {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        self.modified = true;
    }

    /// Install an externally decoded bit stream (G64/NIB front-ends).
    pub fn set_halftrack(&mut self, halftrack: u8, data: Vec<u8>, bits: u32) -> Result<()> {
        let ht = usize::from(halftrack);
        if !(1..=HALFTRACK_COUNT).contains(&ht) {
            return Err(Error::image("G64", format!("halftrack {halftrack}")));
        }
        if bits as usize > data.len() * 8 || bits == 0 {
            return Err(Error::image("G64", "bit count does not fit the data"));
        }
        self.halftracks[ht] = data;
        self.lengths[ht] = bits;
        Ok(())
    }

    /// Encode a complete D64 onto the surface.
    pub fn encode_d64(&mut self, d64: &D64) {
        self.clear();
        self.tracks = d64.tracks();
        let disk_id = d64.disk_id();
        for track in 1..=d64.tracks() {
            let mut stream = Vec::with_capacity(8000);
            for sector in 0..D64::sectors_per_track(track) {
                let data = d64
                    .read_sector(track, sector)
                    .expect("geometry-checked sector");
                encode_sector_into(&mut stream, track, sector, data, disk_id);
            }
            let ht = usize::from(track) * 2 - 1;
            self.lengths[ht] = (stream.len() * 8) as u32;
            self.halftracks[ht] = stream;
        }
        self.modified = false;
    }

    /// Decode the surface back into a D64.
    ///
    /// A full validation pass runs first; any missing or corrupt sector
    /// fails the whole conversion without producing a partial image.
    pub fn decode_to_d64(&self) -> Result<D64> {
        // Dry run: every track must decode completely.
        for track in 1..=self.tracks {
            let sectors = self.decode_track(track)?;
            let expected = usize::from(D64::sectors_per_track(track));
            if sectors.len() != expected {
                return Err(Error::DiskDecode(format!(
                    "track {track}: found {} of {expected} sectors",
                    sectors.len()
                )));
            }
        }

        let mut d64 = D64::blank(self.tracks)?;
        for track in 1..=self.tracks {
            for (sector, data) in self.decode_track(track)? {
                if !d64.write_sector(track, sector, &data) {
                    return Err(Error::DiskDecode(format!(
                        "track {track} sector {sector} out of geometry"
                    )));
                }
            }
        }
        Ok(d64)
    }

    /// Decode one track: scan for sync marks, read the header behind
    /// each, then the matching data block.
    fn decode_track(&self, track: u8) -> Result<Vec<(u8, Vec<u8>)>> {
        let ht = track * 2 - 1;
        let length = self.length_of_halftrack(ht);
        let mut sectors: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut seen = [false; 21];

        let mut pos = 0u32;
        let mut scanned = 0u64;
        let limit = u64::from(length) * 2;

        while scanned < limit {
            let Some(header_pos) = self.find_sync_end(ht, pos, &mut scanned, limit) else {
                break;
            };
            let header = self.read_gcr_bytes::<10>(ht, header_pos);
            let Some(decoded) = decode_gcr_block(&header) else {
                pos = header_pos + 8;
                continue;
            };
            if decoded[0] != 0x08 {
                // A data block without a preceding header read; skip it.
                pos = header_pos + 8;
                continue;
            }
            let sector = decoded[2];
            if decoded[3] != track || sector >= D64::sectors_per_track(track) {
                return Err(Error::DiskDecode(format!(
                    "track {track}: header names track {} sector {sector}",
                    decoded[3]
                )));
            }

            // The data block follows behind the header gap's next sync.
            let Some(data_pos) =
                self.find_sync_end(ht, header_pos + 10 * 8, &mut scanned, limit)
            else {
                break;
            };
            let gcr = self.read_gcr_vec(ht, data_pos, 325);
            let data = decode_data_block(&gcr).ok_or_else(|| {
                Error::DiskDecode(format!("track {track} sector {sector}: bad data block"))
            })?;
            if !seen[usize::from(sector)] {
                seen[usize::from(sector)] = true;
                sectors.push((sector, data));
            }
            pos = data_pos + 325 * 8;
            if sectors.len() == usize::from(D64::sectors_per_track(track)) {
                break;
            }
        }
        Ok(sectors)
    }

    /// Find the first bit after a sync run (>= 10 one-bits), starting at
    /// `pos`. Advances `scanned` and gives up at `limit`.
    fn find_sync_end(&self, ht: u8, mut pos: u32, scanned: &mut u64, limit: u64) -> Option<u32> {
        let length = self.length_of_halftrack(ht);
        let mut ones = 0u32;
        while *scanned < limit {
            let bit = self.read_bit(ht, pos);
            pos = (pos + 1) % length;
            *scanned += 1;
            if bit == 1 {
                ones += 1;
            } else {
                if ones >= 10 {
                    // The zero we just consumed is the first data bit.
                    return Some((pos + length - 1) % length);
                }
                ones = 0;
            }
        }
        None
    }

    fn read_gcr_bytes<const N: usize>(&self, ht: u8, pos: u32) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read_byte_at(ht, pos + (i as u32) * 8);
        }
        out
    }

    fn read_gcr_vec(&self, ht: u8, pos: u32, count: u32) -> Vec<u8> {
        (0..count)
            .map(|i| self.read_byte_at(ht, pos + i * 8))
            .collect()
    }

    fn read_byte_at(&self, ht: u8, pos: u32) -> u8 {
        let mut value = 0u8;
        for i in 0..8 {
            value = (value << 1) | self.read_bit(ht, pos + i);
        }
        value
    }

    // --- Snapshot ---------------------------------------------------------

    pub(crate) fn serialize(&self, w: &mut Writer) {
        w.u8(self.tracks);
        w.bool(self.modified);
        w.bool(self.write_protected);
        for ht in 1..=HALFTRACK_COUNT {
            w.u32(self.lengths[ht]);
            w.blob(&self.halftracks[ht]);
        }
    }

    pub(crate) fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.tracks = r.u8()?;
        self.modified = r.bool()?;
        self.write_protected = r.bool()?;
        for ht in 1..=HALFTRACK_COUNT {
            self.lengths[ht] = r.u32()?;
            self.halftracks[ht] = r.blob(0x4000)?;
        }
        Ok(())
    }
}

impl Default for Disk {
    fn default() -> Self {
        Self::new()
    }
}

// --- GCR codec -------------------------------------------------------------

/// Encode 4 raw bytes into 5 GCR bytes.
fn encode_gcr_group(input: [u8; 4]) -> [u8; 5] {
    let n: [u8; 8] = [
        GCR_ENCODE[(input[0] >> 4) as usize],
        GCR_ENCODE[(input[0] & 0x0F) as usize],
        GCR_ENCODE[(input[1] >> 4) as usize],
        GCR_ENCODE[(input[1] & 0x0F) as usize],
        GCR_ENCODE[(input[2] >> 4) as usize],
        GCR_ENCODE[(input[2] & 0x0F) as usize],
        GCR_ENCODE[(input[3] >> 4) as usize],
        GCR_ENCODE[(input[3] & 0x0F) as usize],
    ];
    [
        (n[0] << 3) | (n[1] >> 2),
        (n[1] << 6) | (n[2] << 1) | (n[3] >> 4),
        (n[3] << 4) | (n[4] >> 1),
        (n[4] << 7) | (n[5] << 2) | (n[6] >> 3),
        (n[6] << 5) | n[7],
    ]
}

/// Decode 5 GCR bytes into 4 raw bytes; `None` on an invalid code.
fn decode_gcr_group(input: &[u8]) -> Option<[u8; 4]> {
    let codes = [
        (input[0] >> 3) & 0x1F,
        ((input[0] << 2) | (input[1] >> 6)) & 0x1F,
        (input[1] >> 1) & 0x1F,
        ((input[1] << 4) | (input[2] >> 4)) & 0x1F,
        ((input[2] << 1) | (input[3] >> 7)) & 0x1F,
        (input[3] >> 2) & 0x1F,
        ((input[3] << 3) | (input[4] >> 5)) & 0x1F,
        input[4] & 0x1F,
    ];
    let mut nibbles = [0u8; 8];
    for (nibble, code) in nibbles.iter_mut().zip(codes) {
        let value = GCR_DECODE[code as usize];
        if value == 0xFF {
            return None;
        }
        *nibble = value;
    }
    Some([
        (nibbles[0] << 4) | nibbles[1],
        (nibbles[2] << 4) | nibbles[3],
        (nibbles[4] << 4) | nibbles[5],
        (nibbles[6] << 4) | nibbles[7],
    ])
}

/// Decode an 8-raw-byte block (header-sized).
fn decode_gcr_block(gcr: &[u8; 10]) -> Option<[u8; 8]> {
    let first = decode_gcr_group(&gcr[0..5])?;
    let second = decode_gcr_group(&gcr[5..10])?;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&first);
    out[4..].copy_from_slice(&second);
    Some(out)
}

/// Decode a 325-byte GCR data block into its 256 data bytes, verifying
/// the marker and checksum.
pub fn decode_data_block(gcr: &[u8]) -> Option<Vec<u8>> {
    if gcr.len() < 325 {
        return None;
    }
    let mut raw = Vec::with_capacity(260);
    for chunk in gcr[..325].chunks_exact(5) {
        raw.extend_from_slice(&decode_gcr_group(chunk)?);
    }
    if raw[0] != 0x07 {
        return None;
    }
    let data = &raw[1..257];
    let checksum = data.iter().fold(0u8, |acc, &b| acc ^ b);
    if checksum != raw[257] {
        return None;
    }
    Some(data.to_vec())
}

fn encode_header_into(out: &mut Vec<u8>, track: u8, sector: u8, disk_id: [u8; 2]) {
    let checksum = sector ^ track ^ disk_id[0] ^ disk_id[1];
    let raw = [
        0x08, checksum, sector, track, disk_id[1], disk_id[0], 0x0F, 0x0F,
    ];
    out.extend_from_slice(&encode_gcr_group([raw[0], raw[1], raw[2], raw[3]]));
    out.extend_from_slice(&encode_gcr_group([raw[4], raw[5], raw[6], raw[7]]));
}

fn encode_sector_into(out: &mut Vec<u8>, track: u8, sector: u8, data: &[u8], disk_id: [u8; 2]) {
    debug_assert_eq!(data.len(), 256);

    // Header sync + header + gap.
    out.extend_from_slice(&[0xFF; 5]);
    encode_header_into(out, track, sector, disk_id);
    out.extend_from_slice(&[0x55; 9]);

    // Data sync + 260 raw bytes as 65 GCR groups + tail gap.
    out.extend_from_slice(&[0xFF; 5]);
    let checksum = data.iter().fold(0u8, |acc, &b| acc ^ b);
    let mut raw = Vec::with_capacity(260);
    raw.push(0x07);
    raw.extend_from_slice(data);
    raw.push(checksum);
    raw.push(0x00);
    raw.push(0x00);
    for chunk in raw.chunks_exact(4) {
        out.extend_from_slice(&encode_gcr_group([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    out.extend_from_slice(&[0x55; 9]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcr_group_roundtrip() {
        for pattern in [[0u8; 4], [0xFF; 4], [0x12, 0x34, 0x56, 0x78]] {
            let encoded = encode_gcr_group(pattern);
            assert_eq!(decode_gcr_group(&encoded), Some(pattern));
        }
    }

    #[test]
    fn gcr_known_values() {
        // GCR(0) = 01010 repeated.
        assert_eq!(
            encode_gcr_group([0, 0, 0, 0]),
            [0x52, 0x94, 0xA5, 0x29, 0x4A]
        );
        // GCR(F) = 10101 repeated.
        assert_eq!(
            encode_gcr_group([0xFF; 4]),
            [0xAD, 0x6B, 0x5A, 0xD6, 0xB5]
        );
    }

    #[test]
    fn invalid_codes_rejected() {
        assert_eq!(decode_gcr_group(&[0u8; 5]), None);
    }

    #[test]
    fn sector_frame_layout() {
        let mut out = Vec::new();
        encode_sector_into(&mut out, 1, 0, &[0u8; 256], [0x41, 0x42]);
        assert_eq!(&out[0..5], &[0xFF; 5]);
        assert_eq!(&out[15..24], &[0x55; 9]);
        assert_eq!(&out[24..29], &[0xFF; 5]);
        assert_eq!(out.len(), 5 + 10 + 9 + 5 + 325 + 9);
    }

    #[test]
    fn zone_geometry() {
        assert_eq!(speed_zone(1), 3);
        assert_eq!(speed_zone(17), 3);
        assert_eq!(speed_zone(18), 2);
        assert_eq!(speed_zone(25), 1);
        assert_eq!(speed_zone(31), 0);
        assert_eq!(speed_zone(42), 0);
    }

    #[test]
    fn bit_level_read_write() {
        let mut disk = Disk::new();
        assert_eq!(disk.read_bit(1, 0), 0);
        disk.write_bit(1, 17, true);
        assert_eq!(disk.read_bit(1, 17), 1);
        assert!(disk.is_modified());
        // Offsets wrap around the cyclic stream.
        let len = disk.length_of_halftrack(1);
        assert_eq!(disk.read_bit(1, 17 + len), 1);
    }

    #[test]
    fn encode_decode_d64_roundtrip() {
        let mut d64 = D64::blank(35).unwrap();
        let mut bam = [0u8; 256];
        bam[0xA2] = 0x56;
        bam[0xA3] = 0x43;
        d64.write_sector(18, 0, &bam);
        let mut marker = [0u8; 256];
        for (i, byte) in marker.iter_mut().enumerate() {
            *byte = i as u8;
        }
        d64.write_sector(1, 0, &marker);
        d64.write_sector(35, 16, &marker);

        let mut disk = Disk::new();
        disk.encode_d64(&d64);
        let decoded = disk.decode_to_d64().unwrap();
        assert_eq!(decoded.to_bytes(), d64.to_bytes());
    }

    #[test]
    fn unformatted_surface_fails_decode() {
        let disk = Disk::new();
        assert!(disk.decode_to_d64().is_err());
    }

    #[test]
    fn corrupt_sector_fails_decode_atomically() {
        let d64 = D64::blank(35).unwrap();
        let mut disk = Disk::new();
        disk.encode_d64(&d64);
        // Erase the first half of track 3's stream; its sectors vanish.
        let len = disk.length_of_halftrack(5);
        for bit in 0..len / 2 {
            disk.write_bit(5, bit, false);
        }
        assert!(disk.decode_to_d64().is_err());
    }

    #[test]
    fn half_tracks_are_unformatted() {
        let mut d64 = D64::blank(35).unwrap();
        d64.write_sector(18, 0, &[0x11; 256]);
        let mut disk = Disk::new();
        disk.encode_d64(&d64);
        // Halftrack 35 (track 18) carries data, halftrack 36 does not.
        let formatted = disk.length_of_halftrack(35);
        let mut ones = 0;
        for bit in 0..disk.length_of_halftrack(36) {
            ones += u32::from(disk.read_bit(36, bit));
        }
        assert!(formatted > 0);
        assert_eq!(ones, 0);
    }

    #[test]
    fn external_halftrack_install() {
        let mut disk = Disk::new();
        assert!(disk.set_halftrack(3, vec![0xAA; 100], 800).is_ok());
        assert_eq!(disk.length_of_halftrack(3), 800);
        assert_eq!(disk.read_bit(3, 0), 1);
        assert_eq!(disk.read_bit(3, 1), 0);
        assert!(disk.set_halftrack(0, vec![0; 10], 80).is_err());
        assert!(disk.set_halftrack(3, vec![0; 10], 81).is_err());
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut d64 = D64::blank(35).unwrap();
        d64.write_sector(1, 2, &[0x77; 256]);
        let mut disk = Disk::new();
        disk.encode_d64(&d64);
        let mut w = Writer::new();
        disk.serialize(&mut w);
        let bytes = w.into_bytes();
        let mut other = Disk::new();
        other.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(other.decode_to_d64().unwrap().to_bytes(), d64.to_bytes());
    }
}
