//! Structural metadata parsing: the movie box and per-track sample tables.
//!
//! The parser consumes a fully-resident `moov` payload and resolves the
//! compact container tables (stts/ctts/stsc/stsz/stco/co64/stss) into one
//! flat per-sample index per track. The flat index is what makes
//! progressive extraction cheap: each track keeps a cursor and emits
//! samples as their byte ranges become resident.

use std::time::Duration;

use crate::demux::boxes::{self, parse_box_header, BoxHeader};
use crate::error::DemuxError;
use crate::media::{CodecId, TrackInfo, TrackKind};

/// One resolved sample: everything needed to slice it out of the file and
/// hand it to a decoder.
#[derive(Debug, Clone, Copy)]
pub struct SampleEntry {
    /// Absolute file offset of the sample payload.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Presentation timestamp.
    pub pts: Duration,
    /// Sample duration.
    pub duration: Duration,
    /// True for sync samples.
    pub keyframe: bool,
}

/// A parsed track: public metadata plus the flat sample index in decode
/// order.
#[derive(Debug, Clone)]
pub struct ParsedTrack {
    pub info: TrackInfo,
    pub samples: Vec<SampleEntry>,
}

impl ParsedTrack {
    /// Index of the nearest sync sample at or before `time`, by
    /// presentation timestamp. Falls back to the first sample.
    pub fn sync_sample_before(&self, time: Duration) -> usize {
        let mut best = 0;
        for (i, s) in self.samples.iter().enumerate() {
            if s.pts > time {
                break;
            }
            if s.keyframe {
                best = i;
            }
        }
        best
    }

    /// Exclusive end offset of the last sample (for watermark math).
    pub fn data_end(&self) -> u64 {
        self.samples
            .iter()
            .map(|s| s.offset + s.size as u64)
            .max()
            .unwrap_or(0)
    }
}

/// The parsed movie: global timing plus all playable tracks.
#[derive(Debug, Clone)]
pub struct Movie {
    pub timescale: u32,
    pub duration: Duration,
    pub tracks: Vec<ParsedTrack>,
}

/// Parses a complete `moov` payload (header already stripped).
pub fn parse_moov(payload: &[u8]) -> Result<Movie, DemuxError> {
    let mut timescale = 1000u32;
    let mut duration_ticks = 0u64;
    let mut tracks = Vec::new();

    let mut walker = BoxWalker::new(payload);
    while let Some((header, body)) = walker.next()? {
        match header.kind {
            boxes::MVHD => {
                let (ts, dur) = parse_mvhd(body)?;
                timescale = ts;
                duration_ticks = dur;
            }
            boxes::TRAK => {
                if let Some(track) = parse_trak(body)? {
                    tracks.push(track);
                }
            }
            _ => {}
        }
    }

    if tracks.is_empty() {
        return Err(DemuxError::Malformed(
            "movie box carries no playable track".into(),
        ));
    }

    let duration = ticks_to_duration(duration_ticks, timescale);
    Ok(Movie {
        timescale,
        duration,
        tracks,
    })
}

fn ticks_to_duration(ticks: u64, timescale: u32) -> Duration {
    if timescale == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(ticks.saturating_mul(1_000_000) / timescale as u64)
}

// ============================================================================
// Child box iteration over an in-memory payload
// ============================================================================

struct BoxWalker<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BoxWalker<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Yields `(header, payload)` for each child box, validating sizes
    /// against the enclosing payload.
    fn next(&mut self) -> Result<Option<(BoxHeader, &'a [u8])>, DemuxError> {
        if self.pos + 8 > self.data.len() {
            return Ok(None);
        }
        let header = parse_box_header(&self.data[self.pos..])?.ok_or_else(|| {
            DemuxError::Malformed("truncated box header inside movie box".into())
        })?;
        if header.size == 0 {
            return Err(DemuxError::Malformed(
                "size-zero box inside movie box".into(),
            ));
        }
        let end = self.pos + header.size as usize;
        if end > self.data.len() || header.size < header.header_len as u64 {
            return Err(DemuxError::Malformed(format!(
                "declared box length {} exceeds remaining buffer {}",
                header.size,
                self.data.len() - self.pos
            )));
        }
        let body = &self.data[self.pos + header.header_len as usize..end];
        self.pos = end;
        Ok(Some((header, body)))
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DemuxError> {
        if self.remaining() < n {
            return Err(DemuxError::Malformed(
                "table data shorter than its entry count".into(),
            ));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), DemuxError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DemuxError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DemuxError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DemuxError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DemuxError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

// ============================================================================
// mvhd / trak
// ============================================================================

fn parse_mvhd(body: &[u8]) -> Result<(u32, u64), DemuxError> {
    let mut r = ByteReader::new(body);
    let version = r.u8()?;
    r.skip(3)?; // flags
    if version == 1 {
        r.skip(16)?; // creation + modification
        let timescale = r.u32()?;
        let duration = r.u64()?;
        Ok((timescale, duration))
    } else {
        r.skip(8)?;
        let timescale = r.u32()?;
        let duration = r.u32()? as u64;
        Ok((timescale, duration))
    }
}

#[derive(Default)]
struct RawTables {
    /// (sample_count, delta) runs
    stts: Vec<(u32, u32)>,
    /// (sample_count, composition offset) runs
    ctts: Vec<(u32, i32)>,
    /// (first_chunk, samples_per_chunk) — description index dropped
    stsc: Vec<(u32, u32)>,
    /// per-sample sizes
    stsz: Vec<u32>,
    /// chunk offsets
    chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers; empty table means all-sync
    stss: Option<Vec<u32>>,
}

struct TrackDescription {
    kind: Option<TrackKind>,
    codec: CodecId,
    width: u32,
    height: u32,
    sample_rate: u32,
    channels: u16,
    timescale: u32,
    init_data: Option<Vec<u8>>,
}

impl Default for TrackDescription {
    fn default() -> Self {
        Self {
            kind: None,
            codec: CodecId::Unknown(0),
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            timescale: 1000,
            init_data: None,
        }
    }
}

fn parse_trak(body: &[u8]) -> Result<Option<ParsedTrack>, DemuxError> {
    let mut track_id = 0u32;
    let mut desc = TrackDescription::default();
    let mut tables = RawTables::default();

    let mut walker = BoxWalker::new(body);
    while let Some((header, child)) = walker.next()? {
        match header.kind {
            boxes::TKHD => track_id = parse_tkhd(child)?,
            boxes::MDIA => parse_mdia(child, &mut desc, &mut tables)?,
            _ => {}
        }
    }

    let Some(kind) = desc.kind else {
        // Hint tracks, timed metadata, anything this engine does not play.
        return Ok(None);
    };

    let samples = resolve_samples(&tables, desc.timescale)?;
    let codec_string = desc.codec.codec_string(desc.init_data.as_deref());

    Ok(Some(ParsedTrack {
        info: TrackInfo {
            id: track_id,
            kind,
            codec: desc.codec,
            codec_string,
            width: desc.width,
            height: desc.height,
            sample_rate: desc.sample_rate,
            channels: desc.channels,
            timescale: desc.timescale,
            init_data: desc.init_data,
        },
        samples,
    }))
}

fn parse_tkhd(body: &[u8]) -> Result<u32, DemuxError> {
    let mut r = ByteReader::new(body);
    let version = r.u8()?;
    r.skip(3)?;
    if version == 1 {
        r.skip(16)?;
    } else {
        r.skip(8)?;
    }
    r.u32()
}

fn parse_mdia(
    body: &[u8],
    desc: &mut TrackDescription,
    tables: &mut RawTables,
) -> Result<(), DemuxError> {
    let mut walker = BoxWalker::new(body);
    while let Some((header, child)) = walker.next()? {
        match header.kind {
            boxes::MDHD => desc.timescale = parse_mdhd(child)?,
            boxes::HDLR => {
                let mut r = ByteReader::new(child);
                r.skip(8)?; // version/flags + pre_defined
                desc.kind = match r.u32()? {
                    boxes::HDLR_VIDE => Some(TrackKind::Video),
                    boxes::HDLR_SOUN => Some(TrackKind::Audio),
                    _ => None,
                };
            }
            boxes::MINF => parse_minf(child, desc, tables)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_mdhd(body: &[u8]) -> Result<u32, DemuxError> {
    let mut r = ByteReader::new(body);
    let version = r.u8()?;
    r.skip(3)?;
    if version == 1 {
        r.skip(16)?;
    } else {
        r.skip(8)?;
    }
    r.u32()
}

fn parse_minf(
    body: &[u8],
    desc: &mut TrackDescription,
    tables: &mut RawTables,
) -> Result<(), DemuxError> {
    let mut walker = BoxWalker::new(body);
    while let Some((header, child)) = walker.next()? {
        if header.kind == boxes::STBL {
            parse_stbl(child, desc, tables)?;
        }
    }
    Ok(())
}

fn parse_stbl(
    body: &[u8],
    desc: &mut TrackDescription,
    tables: &mut RawTables,
) -> Result<(), DemuxError> {
    let mut walker = BoxWalker::new(body);
    while let Some((header, child)) = walker.next()? {
        match header.kind {
            boxes::STSD => parse_stsd(child, desc)?,
            boxes::STTS => {
                let mut r = ByteReader::new(child);
                r.skip(4)?;
                let n = r.u32()?;
                for _ in 0..n {
                    tables.stts.push((r.u32()?, r.u32()?));
                }
            }
            boxes::CTTS => {
                let mut r = ByteReader::new(child);
                r.skip(4)?;
                let n = r.u32()?;
                for _ in 0..n {
                    let count = r.u32()?;
                    let offset = r.u32()? as i32;
                    tables.ctts.push((count, offset));
                }
            }
            boxes::STSC => {
                let mut r = ByteReader::new(child);
                r.skip(4)?;
                let n = r.u32()?;
                for _ in 0..n {
                    let first_chunk = r.u32()?;
                    let per_chunk = r.u32()?;
                    r.skip(4)?; // sample description index
                    tables.stsc.push((first_chunk, per_chunk));
                }
            }
            boxes::STSZ => {
                let mut r = ByteReader::new(child);
                r.skip(4)?;
                let uniform = r.u32()?;
                let count = r.u32()?;
                if uniform == 0 {
                    for _ in 0..count {
                        tables.stsz.push(r.u32()?);
                    }
                } else {
                    tables.stsz = vec![uniform; count as usize];
                }
            }
            boxes::STCO => {
                let mut r = ByteReader::new(child);
                r.skip(4)?;
                let n = r.u32()?;
                for _ in 0..n {
                    tables.chunk_offsets.push(r.u32()? as u64);
                }
            }
            boxes::CO64 => {
                let mut r = ByteReader::new(child);
                r.skip(4)?;
                let n = r.u32()?;
                for _ in 0..n {
                    tables.chunk_offsets.push(r.u64()?);
                }
            }
            boxes::STSS => {
                let mut r = ByteReader::new(child);
                r.skip(4)?;
                let n = r.u32()?;
                let mut syncs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    syncs.push(r.u32()?);
                }
                tables.stss = Some(syncs);
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stsd(body: &[u8], desc: &mut TrackDescription) -> Result<(), DemuxError> {
    let mut r = ByteReader::new(body);
    r.skip(4)?; // version/flags
    let entry_count = r.u32()?;
    if entry_count == 0 {
        return Ok(());
    }

    // Only the first sample description is used; multi-description tracks
    // are rare and out of scope.
    let rest = &body[8..];
    let mut walker = BoxWalker::new(rest);
    let Some((entry_header, entry_body)) = walker.next()? else {
        return Ok(());
    };

    desc.codec = match entry_header.kind {
        boxes::AVC1 | boxes::AVC3 => CodecId::H264,
        boxes::HVC1 | boxes::HEV1 => CodecId::H265,
        boxes::MP4A => CodecId::Aac,
        other => CodecId::Unknown(other),
    };

    match desc.kind {
        Some(TrackKind::Video) => parse_visual_entry(entry_body, desc)?,
        Some(TrackKind::Audio) => parse_audio_entry(entry_body, desc)?,
        None => {}
    }
    Ok(())
}

fn parse_visual_entry(body: &[u8], desc: &mut TrackDescription) -> Result<(), DemuxError> {
    let mut r = ByteReader::new(body);
    r.skip(6)?; // reserved
    r.skip(2)?; // data reference index
    r.skip(16)?; // pre_defined + reserved
    desc.width = r.u16()? as u32;
    desc.height = r.u16()? as u32;
    r.skip(50)?; // resolution, frame count, compressor name, depth, pre_defined

    // Child boxes after the fixed visual entry: avcC / hvcC.
    let children = &body[78..];
    let mut walker = BoxWalker::new(children);
    while let Some((header, child)) = walker.next()? {
        if header.kind == boxes::AVCC || header.kind == boxes::HVCC {
            desc.init_data = Some(child.to_vec());
        }
    }
    Ok(())
}

fn parse_audio_entry(body: &[u8], desc: &mut TrackDescription) -> Result<(), DemuxError> {
    let mut r = ByteReader::new(body);
    r.skip(6)?; // reserved
    r.skip(2)?; // data reference index
    r.skip(8)?; // version + revision + vendor
    desc.channels = r.u16()?;
    r.skip(2)?; // sample size
    r.skip(4)?; // pre_defined + reserved
    desc.sample_rate = r.u32()? >> 16; // 16.16 fixed point

    // Child boxes after the fixed audio entry: esds.
    let children = &body[28..];
    let mut walker = BoxWalker::new(children);
    while let Some((header, child)) = walker.next()? {
        if header.kind == boxes::ESDS {
            if let Some(asc) = extract_audio_specific_config(child) {
                desc.init_data = Some(asc);
            }
        }
    }
    Ok(())
}

/// Extracts the DecoderSpecificInfo (AudioSpecificConfig) from an esds
/// payload. Descriptor lengths use the 7-bit continuation encoding.
fn extract_audio_specific_config(esds: &[u8]) -> Option<Vec<u8>> {
    // Skip version/flags.
    let mut pos = 4usize;

    fn read_descriptor(data: &[u8], pos: &mut usize) -> Option<(u8, usize)> {
        let tag = *data.get(*pos)?;
        *pos += 1;
        let mut len = 0usize;
        for _ in 0..4 {
            let b = *data.get(*pos)?;
            *pos += 1;
            len = (len << 7) | (b & 0x7f) as usize;
            if b & 0x80 == 0 {
                break;
            }
        }
        Some((tag, len))
    }

    // ES_Descriptor (0x03)
    let (tag, _) = read_descriptor(esds, &mut pos)?;
    if tag != 0x03 {
        return None;
    }
    pos += 2; // ES_ID
    let flags = *esds.get(pos)?;
    pos += 1;
    if flags & 0x80 != 0 {
        pos += 2; // dependsOn_ES_ID
    }
    if flags & 0x40 != 0 {
        let url_len = *esds.get(pos)? as usize;
        pos += 1 + url_len;
    }
    if flags & 0x20 != 0 {
        pos += 2; // OCR_ES_ID
    }

    // DecoderConfigDescriptor (0x04)
    let (tag, _) = read_descriptor(esds, &mut pos)?;
    if tag != 0x04 {
        return None;
    }
    pos += 13; // objectTypeIndication, streamType, bufferSize, bitrates

    // DecoderSpecificInfo (0x05)
    let (tag, len) = read_descriptor(esds, &mut pos)?;
    if tag != 0x05 {
        return None;
    }
    esds.get(pos..pos + len).map(|s| s.to_vec())
}

// ============================================================================
// Flat sample resolution
// ============================================================================

/// Resolves the compact tables into a flat, decode-ordered sample index.
fn resolve_samples(tables: &RawTables, timescale: u32) -> Result<Vec<SampleEntry>, DemuxError> {
    let count = tables.stsz.len();
    if count == 0 {
        return Ok(Vec::new());
    }
    if tables.chunk_offsets.is_empty() || tables.stsc.is_empty() {
        return Err(DemuxError::Malformed(
            "sample sizes present without chunk layout".into(),
        ));
    }

    // Per-sample file offsets from the chunk map.
    let mut offsets = Vec::with_capacity(count);
    let chunk_count = tables.chunk_offsets.len();
    let mut sample_idx = 0usize;
    'outer: for (run_idx, &(first_chunk, per_chunk)) in tables.stsc.iter().enumerate() {
        let first = first_chunk.saturating_sub(1) as usize;
        let next_first = tables
            .stsc
            .get(run_idx + 1)
            .map(|&(fc, _)| fc.saturating_sub(1) as usize)
            .unwrap_or(chunk_count);
        for chunk in first..next_first.min(chunk_count) {
            let mut offset = tables.chunk_offsets[chunk];
            for _ in 0..per_chunk {
                if sample_idx >= count {
                    break 'outer;
                }
                offsets.push(offset);
                offset += tables.stsz[sample_idx] as u64;
                sample_idx += 1;
            }
        }
    }
    if offsets.len() != count {
        return Err(DemuxError::Malformed(format!(
            "chunk map resolves {} samples, size table has {}",
            offsets.len(),
            count
        )));
    }

    // Decode timestamps and durations from the stts runs.
    let mut dts_ticks = Vec::with_capacity(count);
    let mut durations = Vec::with_capacity(count);
    let mut t = 0u64;
    for &(run_count, delta) in &tables.stts {
        for _ in 0..run_count {
            if dts_ticks.len() >= count {
                break;
            }
            dts_ticks.push(t);
            durations.push(delta);
            t += delta as u64;
        }
    }
    // Tolerate a short stts by extending the last delta; a missing table
    // entirely is structural corruption.
    if dts_ticks.is_empty() {
        return Err(DemuxError::Malformed("missing time-to-sample table".into()));
    }
    while dts_ticks.len() < count {
        let delta = *durations.last().unwrap_or(&0);
        dts_ticks.push(t);
        durations.push(delta);
        t += delta as u64;
    }

    // Composition offsets (presentation reordering).
    let mut cts_offset = vec![0i64; count];
    let mut idx = 0usize;
    for &(run_count, offset) in &tables.ctts {
        for _ in 0..run_count {
            if idx >= count {
                break;
            }
            cts_offset[idx] = offset as i64;
            idx += 1;
        }
    }

    // Sync samples: 1-based sample numbers; no table means all-sync.
    let is_sync = |i: usize| -> bool {
        match &tables.stss {
            Some(syncs) => syncs.binary_search(&(i as u32 + 1)).is_ok(),
            None => true,
        }
    };

    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let pts_ticks = (dts_ticks[i] as i64 + cts_offset[i]).max(0) as u64;
        samples.push(SampleEntry {
            offset: offsets[i],
            size: tables.stsz[i],
            pts: ticks_to_duration(pts_ticks, timescale),
            duration: ticks_to_duration(durations[i] as u64, timescale),
            keyframe: is_sync(i),
        });
    }
    Ok(samples)
}
