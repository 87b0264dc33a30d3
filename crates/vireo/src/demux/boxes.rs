//! Box-level parsing primitives for the ISO base media container.
//!
//! Only the structural layer lives here: box headers, the top-level walk,
//! and the fast-start `moov` locator. Sample-table internals are in
//! [`super::sample_table`].

use crate::error::DemuxError;

// Box fourcc constants.
pub const FTYP: u32 = 0x6674_7970;
pub const MOOV: u32 = 0x6D6F_6F76;
pub const MVHD: u32 = 0x6D76_6864;
pub const TRAK: u32 = 0x7472_616B;
pub const TKHD: u32 = 0x746B_6864;
pub const MDIA: u32 = 0x6D64_6961;
pub const MDHD: u32 = 0x6D64_6864;
pub const HDLR: u32 = 0x6864_6C72;
pub const MINF: u32 = 0x6D69_6E66;
pub const STBL: u32 = 0x7374_626C;
pub const STSD: u32 = 0x7374_7364;
pub const STTS: u32 = 0x7374_7473;
pub const CTTS: u32 = 0x6374_7473;
pub const STSC: u32 = 0x7374_7363;
pub const STSZ: u32 = 0x7374_737A;
pub const STCO: u32 = 0x7374_636F;
pub const CO64: u32 = 0x636F_3634;
pub const STSS: u32 = 0x7374_7373;
pub const MDAT: u32 = 0x6D64_6174;

// Sample entry fourccs.
pub const AVC1: u32 = 0x6176_6331;
pub const AVC3: u32 = 0x6176_6333;
pub const HVC1: u32 = 0x6876_6331;
pub const HEV1: u32 = 0x6865_7631;
pub const MP4A: u32 = 0x6D70_3461;

// Codec configuration child boxes.
pub const AVCC: u32 = 0x6176_6343;
pub const HVCC: u32 = 0x6876_6343;
pub const ESDS: u32 = 0x6573_6473;

// Handler types.
pub const HDLR_VIDE: u32 = 0x7669_6465;
pub const HDLR_SOUN: u32 = 0x736F_756E;

/// Sanity bound for the structural metadata box. A `moov` larger than this
/// is treated as a corrupt size field rather than buffered indefinitely.
pub const MAX_MOOV_SIZE: u64 = 256 * 1024 * 1024;

/// A parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Box fourcc.
    pub kind: u32,
    /// Total box size including the header. Zero means "extends to the end
    /// of the file" (legal only for a trailing `mdat`).
    pub size: u64,
    /// Header length: 8, or 16 for 64-bit sizes.
    pub header_len: u8,
}

impl BoxHeader {
    /// Payload size, when the box is bounded.
    pub fn payload_len(&self) -> Option<u64> {
        if self.size == 0 {
            None
        } else {
            Some(self.size - self.header_len as u64)
        }
    }
}

/// Parses a box header from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` is too short to decide (more bytes
/// needed), `Err` when the size field is structurally impossible.
pub fn parse_box_header(buf: &[u8]) -> Result<Option<BoxHeader>, DemuxError> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    match size32 {
        0 => Ok(Some(BoxHeader {
            kind,
            size: 0,
            header_len: 8,
        })),
        1 => {
            if buf.len() < 16 {
                return Ok(None);
            }
            let size64 = u64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]);
            if size64 < 16 {
                return Err(DemuxError::Malformed(format!(
                    "64-bit box size {size64} smaller than its header"
                )));
            }
            Ok(Some(BoxHeader {
                kind,
                size: size64,
                header_len: 16,
            }))
        }
        2..=7 => Err(DemuxError::Malformed(format!(
            "box size {size32} smaller than its header"
        ))),
        _ => Ok(Some(BoxHeader {
            kind,
            size: size32 as u64,
            header_len: 8,
        })),
    }
}

/// Location of the structural metadata box within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoovLocation {
    /// Absolute offset of the `moov` box header.
    pub offset: u64,
    /// Total box size including the header.
    pub size: u64,
    /// Header length.
    pub header_len: u8,
}

/// Walks top-level boxes over the resident prefix `[scan_from, ..]` looking
/// for `moov`.
///
/// `read` resolves `(absolute_offset, len)` to resident bytes and returns
/// `None` when the range is not buffered yet. The walk stops — without
/// error — at the first box whose header is not yet resident; the caller
/// retries on later appends. `end_offset` is the exclusive end of buffered
/// data, used to bound size-zero boxes.
///
/// Returns `(next_scan_offset, Option<MoovLocation>)`.
pub fn walk_for_moov<'a, F>(
    mut scan_from: u64,
    end_offset: u64,
    read: F,
) -> Result<(u64, Option<MoovLocation>), DemuxError>
where
    F: Fn(u64, usize) -> Option<&'a [u8]>,
{
    loop {
        let header_bytes = match read(scan_from, 16).or_else(|| read(scan_from, 8)) {
            Some(b) => b,
            None => return Ok((scan_from, None)),
        };
        let header = match parse_box_header(header_bytes)? {
            Some(h) => h,
            None => return Ok((scan_from, None)),
        };

        if header.kind == MOOV {
            if header.size == 0 || header.size > MAX_MOOV_SIZE {
                return Err(DemuxError::Malformed(format!(
                    "implausible moov size {}",
                    header.size
                )));
            }
            return Ok((
                scan_from,
                Some(MoovLocation {
                    offset: scan_from,
                    size: header.size,
                    header_len: header.header_len,
                }),
            ));
        }

        if header.size == 0 {
            // Extends to the end of the file; only ever a trailing mdat.
            // Nothing structural can follow, so the walk is done until more
            // context (a known file length) says otherwise.
            return Ok((scan_from, None));
        }

        let next = scan_from
            .checked_add(header.size)
            .ok_or_else(|| DemuxError::Malformed("box size overflows file offset".into()))?;
        if next <= scan_from {
            return Err(DemuxError::Malformed("box size does not advance".into()));
        }
        scan_from = next;
        if scan_from >= end_offset {
            return Ok((scan_from, None));
        }
    }
}

/// Best-effort fast-start heuristic: scans the priority window for the
/// `moov` fourcc at a plausible box boundary.
///
/// This is a raw signature scan, not a box-tree proof — a `moov` string in
/// unrelated payload with a plausible preceding size field can match. The
/// demuxer validates the candidate by actually parsing the box, so a false
/// positive costs a retry, never a wrong parse.
pub fn scan_window_for_moov(window: &[u8], base_offset: u64) -> Option<MoovLocation> {
    if window.len() < 8 {
        return None;
    }
    for i in 0..window.len() - 7 {
        if &window[i + 4..i + 8] != b"moov" {
            continue;
        }
        let size = u32::from_be_bytes([window[i], window[i + 1], window[i + 2], window[i + 3]]);
        if size as u64 >= 8 && (size as u64) <= MAX_MOOV_SIZE {
            return Some(MoovLocation {
                offset: base_offset + i as u64,
                size: size as u64,
                header_len: 8,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_bytes(kind: &[u8; 4], payload_len: u32) -> Vec<u8> {
        let mut v = (payload_len + 8).to_be_bytes().to_vec();
        v.extend_from_slice(kind);
        v.extend(std::iter::repeat(0u8).take(payload_len as usize));
        v
    }

    #[test]
    fn parses_plain_header() {
        let b = box_bytes(b"ftyp", 16);
        let h = parse_box_header(&b).unwrap().unwrap();
        assert_eq!(h.kind, FTYP);
        assert_eq!(h.size, 24);
        assert_eq!(h.payload_len(), Some(16));
    }

    #[test]
    fn parses_largesize_header() {
        let mut b = 1u32.to_be_bytes().to_vec();
        b.extend_from_slice(b"mdat");
        b.extend_from_slice(&32u64.to_be_bytes());
        let h = parse_box_header(&b).unwrap().unwrap();
        assert_eq!(h.kind, MDAT);
        assert_eq!(h.size, 32);
        assert_eq!(h.header_len, 16);
    }

    #[test]
    fn rejects_undersized_box() {
        let mut b = 4u32.to_be_bytes().to_vec();
        b.extend_from_slice(b"free");
        assert!(parse_box_header(&b).is_err());
    }

    #[test]
    fn short_buffer_asks_for_more() {
        assert!(parse_box_header(&[0, 0]).unwrap().is_none());
    }

    #[test]
    fn walk_finds_moov_after_ftyp() {
        let mut file = box_bytes(b"ftyp", 16);
        let moov_at = file.len() as u64;
        file.extend(box_bytes(b"moov", 100));

        let (_, loc) = walk_for_moov(0, file.len() as u64, |off, len| {
            let off = off as usize;
            file.get(off..off + len)
        })
        .unwrap();
        let loc = loc.unwrap();
        assert_eq!(loc.offset, moov_at);
        assert_eq!(loc.size, 108);
    }

    #[test]
    fn walk_stops_at_unbuffered_header() {
        let file = box_bytes(b"ftyp", 16);
        let (next, loc) = walk_for_moov(0, 1000, |off, len| {
            let off = off as usize;
            file.get(off..off + len)
        })
        .unwrap();
        assert!(loc.is_none());
        assert_eq!(next, file.len() as u64);
    }

    #[test]
    fn signature_scan_finds_moov() {
        let mut window = vec![0u8; 64];
        let moov = box_bytes(b"moov", 4);
        window.extend_from_slice(&moov);
        let loc = scan_window_for_moov(&window, 0).unwrap();
        assert_eq!(loc.offset, 64);
        assert_eq!(loc.size, 12);
    }

    #[test]
    fn signature_scan_honors_base_offset() {
        let moov = box_bytes(b"moov", 0);
        let loc = scan_window_for_moov(&moov, 4096).unwrap();
        assert_eq!(loc.offset, 4096);
    }
}
