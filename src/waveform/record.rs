//! Fixed-length binary records for the on-disk trace cache.
//!
//! One file per fingerprint. The payload is padded to a power-of-two
//! record length derived from the sample data size (`samples · 8 + 64`),
//! clamped to `[128, 1_048_576]` bytes; a trace whose data exceeds the
//! maximum record length is not cached.

use std::fs;
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use camino::Utf8Path;

use crate::relodd_errors::{ReloddError, ReloddResult};
use crate::time::{parse_iso, to_iso_string};
use crate::waveform::Trace;

const MAGIC: &[u8; 4] = b"RWF1";
const MIN_RECLEN: usize = 128;
const MAX_RECLEN: usize = 1_048_576;

/// Smallest power of two in `[min, max]` not below `value`.
fn next_power_of_two(value: usize, min: usize, max: usize) -> Option<usize> {
    let mut b = min;
    while b < value {
        b <<= 1;
        if b > max {
            return None;
        }
    }
    Some(b)
}

pub fn write_trace(trace: &Trace, file: &Utf8Path) -> ReloddResult<()> {
    let data_bytes = trace.sample_count() * 8;

    let mut buf = Vec::with_capacity(data_bytes + 128);
    buf.extend_from_slice(MAGIC);
    for code in [
        &trace.network_code,
        &trace.station_code,
        &trace.location_code,
        &trace.channel_code,
    ] {
        write_string(&mut buf, code)?;
    }
    write_string(&mut buf, &to_iso_string(trace.start_time()))?;
    buf.write_f64::<BigEndian>(trace.sampling_frequency())?;
    buf.write_u32::<BigEndian>(trace.sample_count() as u32)?;
    for sample in trace.samples() {
        buf.write_f64::<BigEndian>(*sample)?;
    }

    let reclen = next_power_of_two(buf.len().max(data_bytes + 64), MIN_RECLEN, MAX_RECLEN)
        .ok_or(ReloddError::RecordTooLong(data_bytes))?;
    buf.resize(reclen, 0);

    let mut out = fs::File::create(file)?;
    out.write_all(&buf)?;
    Ok(())
}

pub fn read_trace(file: &Utf8Path) -> ReloddResult<Trace> {
    let content = fs::read(file)?;
    let corrupted = |what: &str| ReloddError::CorruptedRecord(format!("{}: {}", file, what));

    let mut cursor = Cursor::new(content);
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic).map_err(|_| corrupted("truncated header"))?;
    if &magic != MAGIC {
        return Err(corrupted("bad magic"));
    }

    let network = read_string(&mut cursor).map_err(|_| corrupted("network code"))?;
    let station = read_string(&mut cursor).map_err(|_| corrupted("station code"))?;
    let location = read_string(&mut cursor).map_err(|_| corrupted("location code"))?;
    let channel = read_string(&mut cursor).map_err(|_| corrupted("channel code"))?;
    let start_iso = read_string(&mut cursor).map_err(|_| corrupted("start time"))?;
    let start_time = parse_iso(&start_iso)?;

    let sampling_frequency = cursor
        .read_f64::<BigEndian>()
        .map_err(|_| corrupted("sampling frequency"))?;
    if !(sampling_frequency.is_finite() && sampling_frequency > 0.0) {
        return Err(corrupted("sampling frequency"));
    }

    let count = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| corrupted("sample count"))? as usize;
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(
            cursor
                .read_f64::<BigEndian>()
                .map_err(|_| corrupted("sample data"))?,
        );
    }

    Ok(Trace::new(
        &network,
        &station,
        &location,
        &channel,
        start_time,
        sampling_frequency,
        samples,
    ))
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> ReloddResult<()> {
    buf.write_u16::<BigEndian>(s.len() as u16)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_string(cursor: &mut Cursor<Vec<u8>>) -> std::io::Result<String> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "not utf-8"))
}
