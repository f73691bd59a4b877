//! D64 disk images.
//!
//! The flat sector dump of a 1541 disk: 35 tracks (683 sectors), with
//! the 40- and 42-track extensions also accepted. Sectors per track
//! follow the drive's four speed zones:
//!
//!   Tracks  1-17: 21 sectors
//!   Tracks 18-24: 19 sectors
//!   Tracks 25-30: 18 sectors
//!   Tracks 31+  : 17 sectors
//!
//! Images may carry one trailing error-info byte per sector; they are
//! kept so a rewritten image round-trips, but otherwise ignored.

use crate::error::{Error, Result};

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 256;

/// Sector counts for the supported track counts.
const SECTORS_35: usize = 683;
const SECTORS_40: usize = 768;
const SECTORS_42: usize = 802;

/// A parsed disk image.
pub struct D64 {
    data: Vec<u8>,
    tracks: u8,
    /// Per-sector error bytes, when the image carries them.
    error_info: Option<Vec<u8>>,
}

impl D64 {
    /// Parse an image; the size determines the track count and whether
    /// error info is attached.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (tracks, sectors) = match data.len() {
            x if x == SECTORS_35 * SECTOR_SIZE || x == SECTORS_35 * 257 => (35u8, SECTORS_35),
            x if x == SECTORS_40 * SECTOR_SIZE || x == SECTORS_40 * 257 => (40, SECTORS_40),
            x if x == SECTORS_42 * SECTOR_SIZE || x == SECTORS_42 * 257 => (42, SECTORS_42),
            other => {
                return Err(Error::image("D64", format!("unexpected size {other} bytes")));
            }
        };
        let body = sectors * SECTOR_SIZE;
        let error_info = if data.len() > body {
            Some(data[body..].to_vec())
        } else {
            None
        };
        Ok(Self {
            data: data[..body].to_vec(),
            tracks,
            error_info,
        })
    }

    /// A blank formatted-looking image with the given track count.
    pub fn blank(tracks: u8) -> Result<Self> {
        let sectors = match tracks {
            35 => SECTORS_35,
            40 => SECTORS_40,
            42 => SECTORS_42,
            other => return Err(Error::image("D64", format!("{other} tracks"))),
        };
        Ok(Self {
            data: vec![0; sectors * SECTOR_SIZE],
            tracks,
            error_info: None,
        })
    }

    #[must_use]
    pub fn tracks(&self) -> u8 {
        self.tracks
    }

    /// Sectors on a track (1-based); 0 for invalid tracks.
    #[must_use]
    pub fn sectors_per_track(track: u8) -> u8 {
        match track {
            1..=17 => 21,
            18..=24 => 19,
            25..=30 => 18,
            31..=42 => 17,
            _ => 0,
        }
    }

    /// Byte offset of a sector within the image.
    #[must_use]
    pub fn sector_offset(&self, track: u8, sector: u8) -> Option<usize> {
        if track == 0 || track > self.tracks || sector >= Self::sectors_per_track(track) {
            return None;
        }
        let mut offset = 0usize;
        for t in 1..track {
            offset += usize::from(Self::sectors_per_track(t)) * SECTOR_SIZE;
        }
        Some(offset + usize::from(sector) * SECTOR_SIZE)
    }

    #[must_use]
    pub fn read_sector(&self, track: u8, sector: u8) -> Option<&[u8]> {
        let offset = self.sector_offset(track, sector)?;
        Some(&self.data[offset..offset + SECTOR_SIZE])
    }

    /// Returns `false` for out-of-range positions or wrong-sized data.
    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> bool {
        if data.len() != SECTOR_SIZE {
            return false;
        }
        let Some(offset) = self.sector_offset(track, sector) else {
            return false;
        };
        self.data[offset..offset + SECTOR_SIZE].copy_from_slice(data);
        true
    }

    /// Disk ID from the BAM (track 18 sector 0, bytes $A2/$A3).
    #[must_use]
    pub fn disk_id(&self) -> [u8; 2] {
        match self.read_sector(18, 0) {
            Some(bam) => [bam[0xA2], bam[0xA3]],
            None => [0, 0],
        }
    }

    /// The full image, error info re-attached.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        if let Some(errors) = &self.error_info {
            out.extend_from_slice(errors);
        }
        out
    }
}
