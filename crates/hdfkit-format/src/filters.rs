//! Chunk filters: deflate, shuffle, fletcher32 and LZF.
//!
//! Writing runs the pipeline front to back and reports which optional
//! filters were skipped as a per-chunk filter mask. Reading runs it back
//! to front, leaving out the masked filters.

use tracing::trace;

use crate::error::{Feature, FormatError};
use crate::filter_pipeline::{
    FilterDescription, FilterPipeline, FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_LZF,
    FILTER_SHUFFLE,
};

type FilterFn = fn(&FilterDescription, &[u8], usize) -> Result<Vec<u8>, FormatError>;

struct Codec {
    id: u16,
    name: &'static str,
    encode: FilterFn,
    decode: FilterFn,
}

const CODECS: &[Codec] = &[
    Codec {
        id: FILTER_DEFLATE,
        name: "deflate",
        encode: deflate_encode,
        decode: deflate_decode,
    },
    Codec {
        id: FILTER_SHUFFLE,
        name: "shuffle",
        encode: shuffle_encode,
        decode: shuffle_decode,
    },
    Codec {
        id: FILTER_FLETCHER32,
        name: "fletcher32",
        encode: fletcher32_encode,
        decode: fletcher32_decode,
    },
    Codec {
        id: FILTER_LZF,
        name: "lzf",
        encode: lzf_encode,
        decode: lzf_decode,
    },
];

fn codec(id: u16) -> Result<&'static Codec, FormatError> {
    CODECS
        .iter()
        .find(|c| c.id == id)
        .filter(|c| c.id != FILTER_DEFLATE || cfg!(feature = "deflate"))
        .ok_or(FormatError::UnsupportedFeature(Feature::Filter(id)))
}

/// Fails when any filter in the pipeline has no implementation.
pub fn check_supported(pipeline: &FilterPipeline) -> Result<(), FormatError> {
    for f in &pipeline.filters {
        codec(f.filter_id)?;
    }
    Ok(())
}

/// Run the pipeline forward over one chunk.
///
/// Returns the stored bytes and the filter mask. An optional filter that
/// fails or does not shrink its input is skipped and its mask bit set.
pub fn apply_forward(
    pipeline: &FilterPipeline,
    data: Vec<u8>,
    element_size: usize,
) -> Result<(Vec<u8>, u32), FormatError> {
    let mut data = data;
    let mut mask = 0u32;
    for (i, f) in pipeline.filters.iter().enumerate() {
        let c = codec(f.filter_id)?;
        match (c.encode)(f, &data, element_size) {
            Ok(out) if f.is_optional() && out.len() >= data.len() => {
                trace!(filter = c.name, "optional filter skipped, no size gain");
                mask |= 1 << i;
            }
            Ok(out) => {
                trace!(filter = c.name, before = data.len(), after = out.len(), "filter applied");
                data = out;
            }
            Err(e) if f.is_optional() => {
                trace!(filter = c.name, error = %e, "optional filter skipped");
                mask |= 1 << i;
            }
            Err(e) => return Err(e),
        }
    }
    Ok((data, mask))
}

/// Undo the pipeline for one stored chunk, honouring its filter mask.
pub fn apply_reverse(
    pipeline: &FilterPipeline,
    data: Vec<u8>,
    element_size: usize,
    mask: u32,
) -> Result<Vec<u8>, FormatError> {
    let mut data = data;
    for (i, f) in pipeline.filters.iter().enumerate().rev() {
        if i < 32 && mask & (1 << i) != 0 {
            continue;
        }
        let c = codec(f.filter_id)?;
        data = (c.decode)(f, &data, element_size)?;
        trace!(filter = c.name, len = data.len(), "filter reversed");
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// deflate
// ---------------------------------------------------------------------------

#[cfg(feature = "deflate")]
fn deflate_encode(f: &FilterDescription, data: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    use std::io::Write;
    let level = f.client_data.first().copied().unwrap_or(6).min(9);
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| FormatError::Decompression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| FormatError::Decompression(e.to_string()))
}

#[cfg(feature = "deflate")]
fn deflate_decode(_: &FilterDescription, data: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FormatError::Decompression(format!("deflate: {e}")))?;
    Ok(out)
}

#[cfg(not(feature = "deflate"))]
fn deflate_encode(_: &FilterDescription, _: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    Err(FormatError::UnsupportedFeature(Feature::Filter(FILTER_DEFLATE)))
}

#[cfg(not(feature = "deflate"))]
fn deflate_decode(_: &FilterDescription, _: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    Err(FormatError::UnsupportedFeature(Feature::Filter(FILTER_DEFLATE)))
}

// ---------------------------------------------------------------------------
// shuffle
// ---------------------------------------------------------------------------

fn shuffle_width(f: &FilterDescription, element_size: usize) -> usize {
    f.client_data
        .first()
        .map(|&w| w as usize)
        .filter(|&w| w > 0)
        .unwrap_or(element_size)
}

/// Group byte 0 of every element, then byte 1, and so on.
/// A trailing partial element is copied unchanged.
fn shuffle_encode(f: &FilterDescription, data: &[u8], es: usize) -> Result<Vec<u8>, FormatError> {
    let width = shuffle_width(f, es);
    if width <= 1 {
        return Ok(data.to_vec());
    }
    let n = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for j in 0..width {
            out[j * n + i] = data[i * width + j];
        }
    }
    out[n * width..].copy_from_slice(&data[n * width..]);
    Ok(out)
}

fn shuffle_decode(f: &FilterDescription, data: &[u8], es: usize) -> Result<Vec<u8>, FormatError> {
    let width = shuffle_width(f, es);
    if width <= 1 {
        return Ok(data.to_vec());
    }
    let n = data.len() / width;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for j in 0..width {
            out[i * width + j] = data[j * n + i];
        }
    }
    out[n * width..].copy_from_slice(&data[n * width..]);
    Ok(out)
}

// ---------------------------------------------------------------------------
// fletcher32
// ---------------------------------------------------------------------------

/// Fletcher-32 over big-endian 16-bit words, reduced the way the C library does.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut words = data.chunks_exact(2);

    loop {
        let mut taken = 0;
        for w in words.by_ref().take(360) {
            sum1 += u32::from(w[0]) << 8 | u32::from(w[1]);
            sum2 += sum1;
            taken += 1;
        }
        if taken == 0 {
            break;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    if let [last] = words.remainder() {
        sum1 += u32::from(*last) << 8;
        sum2 += sum1;
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

fn fletcher32_encode(_: &FilterDescription, data: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.extend_from_slice(data);
    out.extend_from_slice(&fletcher32(data).to_le_bytes());
    Ok(out)
}

fn fletcher32_decode(_: &FilterDescription, data: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    if data.len() < 4 {
        return Err(FormatError::Decompression(
            "fletcher32: chunk shorter than its checksum".into(),
        ));
    }
    let (payload, tail) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = fletcher32(payload);
    if stored != computed {
        return Err(FormatError::Fletcher32Mismatch { stored, computed });
    }
    Ok(payload.to_vec())
}

// ---------------------------------------------------------------------------
// LZF
// ---------------------------------------------------------------------------

const LZF_HASH_LOG: u32 = 14;
const LZF_MAX_OFFSET: usize = 1 << 13;
const LZF_MAX_LITERAL: usize = 32;
const LZF_MAX_MATCH: usize = 264;

fn lzf_flush_literals(out: &mut Vec<u8>, lit: &[u8]) {
    for run in lit.chunks(LZF_MAX_LITERAL) {
        out.push((run.len() - 1) as u8);
        out.extend_from_slice(run);
    }
}

fn lzf_hash(b: &[u8]) -> usize {
    let v = u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]);
    (v.wrapping_mul(2_654_435_761) >> (32 - LZF_HASH_LOG)) as usize
}

fn lzf_encode(_: &FilterDescription, input: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    Ok(lzf_compress(input))
}

fn lzf_decode(_: &FilterDescription, input: &[u8], _: usize) -> Result<Vec<u8>, FormatError> {
    lzf_decompress(input)
}

/// Compress in the liblzf block format.
pub fn lzf_compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 16 + 4);
    let mut table = vec![0usize; 1 << LZF_HASH_LOG];
    let mut lit_start = 0;
    let mut i = 0;

    while i + 2 < input.len() {
        let h = lzf_hash(&input[i..]);
        let cand = table[h];
        table[h] = i + 1;

        if cand > 0 {
            let r = cand - 1;
            let off = i - r - 1;
            if off < LZF_MAX_OFFSET && input[r..r + 3] == input[i..i + 3] {
                let max = (input.len() - i).min(LZF_MAX_MATCH);
                let mut len = 3;
                while len < max && input[r + len] == input[i + len] {
                    len += 1;
                }
                lzf_flush_literals(&mut out, &input[lit_start..i]);
                let code = len - 2;
                if code < 7 {
                    out.push(((code << 5) | (off >> 8)) as u8);
                } else {
                    out.push(((7 << 5) | (off >> 8)) as u8);
                    out.push((code - 7) as u8);
                }
                out.push(off as u8);
                i += len;
                lit_start = i;
                continue;
            }
        }
        i += 1;
    }
    lzf_flush_literals(&mut out, &input[lit_start..]);
    out
}

/// Decompress a liblzf block.
pub fn lzf_decompress(input: &[u8]) -> Result<Vec<u8>, FormatError> {
    let corrupt = |what: &str| FormatError::Decompression(format!("lzf: {what}"));
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut ip = 0;

    while ip < input.len() {
        let ctrl = input[ip] as usize;
        ip += 1;
        if ctrl < 32 {
            let n = ctrl + 1;
            let run = input.get(ip..ip + n).ok_or_else(|| corrupt("literal overruns input"))?;
            out.extend_from_slice(run);
            ip += n;
            continue;
        }

        let mut len = ctrl >> 5;
        if len == 7 {
            len += *input.get(ip).ok_or_else(|| corrupt("truncated match length"))? as usize;
            ip += 1;
        }
        let low = *input.get(ip).ok_or_else(|| corrupt("truncated match offset"))? as usize;
        ip += 1;
        let back = ((ctrl & 0x1f) << 8 | low) + 1;
        if back > out.len() {
            return Err(corrupt("back reference before start of output"));
        }
        let start = out.len() - back;
        for k in 0..len + 2 {
            let b = out[start + k];
            out.push(b);
        }
    }
    Ok(out)
}
