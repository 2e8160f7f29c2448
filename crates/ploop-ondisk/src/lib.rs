#![forbid(unsafe_code)]
//! On-disk format of a ploop image delta.
//!
//! Layout: one header cluster at byte 0, then the BAT region in 4096-byte
//! pages (each with an embedded generation stamp), then data clusters.
//! Physical cluster index `n >= 1` lives at file bytes
//! `[n * cluster_size, (n + 1) * cluster_size)`; index 0 is the header
//! cluster and doubles as the hole sentinel.

use ploop_types::{
    BAT_ENTRIES_PER_PAGE, BAT_PAGE_HEADER_SIZE, BAT_PAGE_SIZE, ByteOffset, ClusterShift,
    FORMAT_VERSION, Generation, ParseError, PLOOP_MAGIC, PhysCluster, ensure_slice, read_fixed,
    read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Size of the fixed header fields covered by `header_crc`.
pub const HEADER_CRC_SPAN: usize = 48;
/// Total encoded header size including the CRC field.
pub const HEADER_ENCODED_SIZE: usize = 52;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 16;
const CLUSTER_SHIFT_OFFSET: usize = 20;
const VIRTUAL_SIZE_OFFSET: usize = 24;
const GENERATION_OFFSET: usize = 32;
const BAT_ENTRIES_OFFSET: usize = 40;
const FLAGS_OFFSET: usize = 44;
const CRC_OFFSET: usize = 48;

/// Parsed image delta header.
///
/// `version` is carried raw; callers decide whether a foreign version is
/// acceptable. Everything else is validated at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaHeader {
    pub version: u32,
    pub cluster_shift: ClusterShift,
    pub virtual_size_clusters: u64,
    pub generation: Generation,
    pub bat_entries: u32,
    pub flags: u32,
}

impl DeltaHeader {
    /// Fresh header for a new image with no allocated clusters.
    #[must_use]
    pub fn new(cluster_shift: ClusterShift, virtual_size_clusters: u64) -> Self {
        let bat_entries = u32::try_from(virtual_size_clusters).unwrap_or(u32::MAX);
        Self {
            version: FORMAT_VERSION,
            cluster_shift,
            virtual_size_clusters,
            generation: Generation(0),
            bat_entries,
            flags: 0,
        }
    }

    /// Parse and validate a header from the start of an image file.
    ///
    /// `region` must hold at least `HEADER_ENCODED_SIZE` bytes. Magic and
    /// CRC failures are corruption; an out-of-range cluster shift is a
    /// malformed field.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let magic: [u8; 16] = read_fixed(region, MAGIC_OFFSET)?;
        if magic != PLOOP_MAGIC {
            return Err(ParseError::InvalidMagic);
        }

        let stored_crc = read_le_u32(region, CRC_OFFSET)?;
        let span = ensure_slice(region, 0, HEADER_CRC_SPAN)?;
        let computed = crc32c::crc32c(span);
        if computed != stored_crc {
            return Err(ParseError::ChecksumMismatch {
                field: "header_crc",
                expected: stored_crc,
                actual: computed,
            });
        }

        let version = read_le_u32(region, VERSION_OFFSET)?;
        let cluster_shift = ClusterShift::new(read_le_u32(region, CLUSTER_SHIFT_OFFSET)?)?;
        let virtual_size_clusters = read_le_u64(region, VIRTUAL_SIZE_OFFSET)?;
        let generation = Generation(read_le_u64(region, GENERATION_OFFSET)?);
        let bat_entries = read_le_u32(region, BAT_ENTRIES_OFFSET)?;
        let flags = read_le_u32(region, FLAGS_OFFSET)?;

        if u64::from(bat_entries) < virtual_size_clusters {
            return Err(ParseError::InvalidField {
                field: "bat_entries",
                reason: "fewer BAT entries than virtual clusters",
            });
        }

        Ok(Self {
            version,
            cluster_shift,
            virtual_size_clusters,
            generation,
            bat_entries,
            flags,
        })
    }

    /// Encode into the first `HEADER_ENCODED_SIZE` bytes of `out`,
    /// computing `header_crc`. The remainder of the header cluster is the
    /// caller's (zeroed) padding.
    pub fn encode(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < HEADER_ENCODED_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_ENCODED_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }
        out[MAGIC_OFFSET..MAGIC_OFFSET + 16].copy_from_slice(&PLOOP_MAGIC);
        out[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&self.version.to_le_bytes());
        out[CLUSTER_SHIFT_OFFSET..CLUSTER_SHIFT_OFFSET + 4]
            .copy_from_slice(&self.cluster_shift.get().to_le_bytes());
        out[VIRTUAL_SIZE_OFFSET..VIRTUAL_SIZE_OFFSET + 8]
            .copy_from_slice(&self.virtual_size_clusters.to_le_bytes());
        out[GENERATION_OFFSET..GENERATION_OFFSET + 8]
            .copy_from_slice(&self.generation.0.to_le_bytes());
        out[BAT_ENTRIES_OFFSET..BAT_ENTRIES_OFFSET + 4]
            .copy_from_slice(&self.bat_entries.to_le_bytes());
        out[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&self.flags.to_le_bytes());
        let crc = crc32c::crc32c(&out[..HEADER_CRC_SPAN]);
        out[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Encode a full header cluster (fixed fields + zero padding).
    #[must_use]
    pub fn encode_cluster(&self) -> Vec<u8> {
        let mut cluster = vec![0_u8; usize::try_from(self.cluster_shift.bytes()).unwrap_or(4096)];
        self.encode(&mut cluster)
            .expect("header cluster is at least HEADER_ENCODED_SIZE");
        cluster
    }

    /// Geometry derived from this header.
    #[must_use]
    pub fn geometry(&self) -> BatGeometry {
        BatGeometry::new(self.cluster_shift, self.bat_entries)
    }
}

/// Placement of the BAT region and the first allocatable data cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatGeometry {
    pub cluster_shift: ClusterShift,
    pub bat_entries: u32,
    pub bat_pages: u32,
    pub bat_clusters: u32,
    /// First physical cluster index usable for data.
    pub data_start: PhysCluster,
}

impl BatGeometry {
    #[must_use]
    pub fn new(cluster_shift: ClusterShift, bat_entries: u32) -> Self {
        let entries_per_page = u32::try_from(BAT_ENTRIES_PER_PAGE).unwrap_or(1020);
        let bat_pages = bat_entries.div_ceil(entries_per_page);
        let bat_bytes = u64::from(bat_pages) * BAT_PAGE_SIZE as u64;
        let bat_clusters =
            u32::try_from(bat_bytes.div_ceil(cluster_shift.bytes())).unwrap_or(u32::MAX);
        Self {
            cluster_shift,
            bat_entries,
            bat_pages,
            bat_clusters,
            data_start: PhysCluster(1 + bat_clusters),
        }
    }

    /// Byte offset of BAT page `page` within the image file.
    #[must_use]
    pub fn page_byte_offset(&self, page: u32) -> ByteOffset {
        ByteOffset(self.cluster_shift.bytes() + u64::from(page) * BAT_PAGE_SIZE as u64)
    }

    /// (page index, entry slot within page) for a BAT entry index.
    #[must_use]
    pub fn locate(&self, entry: u32) -> (u32, usize) {
        let per_page = u32::try_from(BAT_ENTRIES_PER_PAGE).unwrap_or(1020);
        (entry / per_page, (entry % per_page) as usize)
    }

    /// Number of entries carried by `page` (the last page may be partial).
    #[must_use]
    pub fn entries_in_page(&self, page: u32) -> usize {
        let per_page = u32::try_from(BAT_ENTRIES_PER_PAGE).unwrap_or(1020);
        let start = page * per_page;
        if start >= self.bat_entries {
            return 0;
        }
        (self.bat_entries - start).min(per_page) as usize
    }
}

/// Outcome of validating one BAT page image at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageVerdict {
    Valid,
    /// Stamp is newer than the header generation: the page belongs to a
    /// commit whose header bump never landed.
    StaleHeader,
    BadCrc,
}

/// One decoded BAT page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatPageImage {
    pub stamp: Generation,
    pub entries: Vec<u32>,
    pub verdict: PageVerdict,
}

/// Encode a BAT page: stamp, entry CRC, entries.
///
/// `entries.len()` must not exceed `BAT_ENTRIES_PER_PAGE`; missing tail
/// entries encode as holes.
pub fn encode_bat_page(stamp: Generation, entries: &[u32]) -> Result<Vec<u8>, ParseError> {
    if entries.len() > BAT_ENTRIES_PER_PAGE {
        return Err(ParseError::InvalidField {
            field: "entries",
            reason: "more entries than a BAT page holds",
        });
    }
    let mut page = vec![0_u8; BAT_PAGE_SIZE];
    for (slot, entry) in entries.iter().enumerate() {
        let at = BAT_PAGE_HEADER_SIZE + slot * 4;
        page[at..at + 4].copy_from_slice(&entry.to_le_bytes());
    }
    page[0..8].copy_from_slice(&stamp.0.to_le_bytes());
    let crc = crc32c::crc32c(&page[BAT_PAGE_HEADER_SIZE..]);
    page[8..12].copy_from_slice(&crc.to_le_bytes());
    Ok(page)
}

/// Decode a BAT page read from disk, applying the recovery rule.
///
/// A page whose CRC fails or whose stamp exceeds `header_generation`
/// decodes as all-hole; the verdict says which rule fired so the caller
/// can log it.
pub fn decode_bat_page(
    raw: &[u8],
    header_generation: Generation,
) -> Result<BatPageImage, ParseError> {
    if raw.len() != BAT_PAGE_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BAT_PAGE_SIZE,
            offset: 0,
            actual: raw.len(),
        });
    }
    let stamp = Generation(read_le_u64(raw, 0)?);
    let stored_crc = read_le_u32(raw, 8)?;
    let computed = crc32c::crc32c(&raw[BAT_PAGE_HEADER_SIZE..]);

    let verdict = if computed != stored_crc {
        PageVerdict::BadCrc
    } else if stamp > header_generation {
        PageVerdict::StaleHeader
    } else {
        PageVerdict::Valid
    };

    let entries = match verdict {
        PageVerdict::Valid => raw[BAT_PAGE_HEADER_SIZE..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        PageVerdict::StaleHeader | PageVerdict::BadCrc => vec![0_u32; BAT_ENTRIES_PER_PAGE],
    };

    Ok(BatPageImage {
        stamp,
        entries,
        verdict,
    })
}
