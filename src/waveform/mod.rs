//! Waveform traces and the numeric operations of the processing pipeline.
//!
//! A [`Trace`] is a gap-free run of samples for one stream. Raw data
//! arrives as several record fragments from a [`WaveformSource`] and is
//! merged, trimmed, demeaned, optionally resampled and filtered before the
//! cross-correlator sees it.

pub mod filter;
pub mod pipeline;
pub mod projection;
pub mod record;

use hifitime::{Duration, Epoch};
use log::{debug, error};

use crate::relodd_errors::ReloddResult;
use crate::time::TimeWindow;

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub network_code: String,
    pub station_code: String,
    pub location_code: String,
    pub channel_code: String,
    start_time: Epoch,
    sampling_frequency: f64,
    samples: Vec<f64>,
}

impl Trace {
    pub fn new(
        network_code: &str,
        station_code: &str,
        location_code: &str,
        channel_code: &str,
        start_time: Epoch,
        sampling_frequency: f64,
        samples: Vec<f64>,
    ) -> Self {
        Trace {
            network_code: network_code.to_string(),
            station_code: station_code.to_string(),
            location_code: location_code.to_string(),
            channel_code: channel_code.to_string(),
            start_time,
            sampling_frequency,
            samples,
        }
    }

    pub fn start_time(&self) -> Epoch {
        self.start_time
    }

    pub fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f64] {
        &mut self.samples
    }

    pub fn end_time(&self) -> Epoch {
        self.start_time
            + Duration::from_seconds(self.samples.len() as f64 / self.sampling_frequency)
    }

    pub fn time_window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time())
    }

    pub fn stream_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network_code, self.station_code, self.location_code, self.channel_code
        )
    }

    /// Cut the trace down to `tw` using sample-offset arithmetic in the
    /// trace's own time base. Returns `None` when the window starts before
    /// the trace or ends past its last sample; the result holds exactly
    /// `⌊tw.length · fs⌋` samples.
    pub fn slice(&self, tw: &TimeWindow) -> Option<Trace> {
        let ofs = ((tw.start() - self.start_time).to_seconds() * self.sampling_frequency) as i64;
        let samples = (tw.length_secs() * self.sampling_frequency) as i64;

        if ofs < 0 {
            debug!("{}: need {} more samples in past", self.stream_id(), -ofs);
            return None;
        }
        if (ofs + samples) as usize > self.samples.len() {
            debug!(
                "{}: need {} more samples past the end",
                self.stream_id(),
                (ofs + samples) as usize - self.samples.len()
            );
            return None;
        }

        let mut sliced = self.clone();
        sliced.start_time = tw.start();
        sliced.samples = self.samples[ofs as usize..(ofs + samples) as usize].to_vec();
        Some(sliced)
    }

    pub fn demean(&mut self) {
        if self.samples.is_empty() {
            return;
        }
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        for s in &mut self.samples {
            *s -= mean;
        }
    }
}

/// External time-bounded waveform service.
///
/// An implementation opens its stream (usually by URL), restricts it to
/// the requested window and single channel, and drains the records. Each
/// returned fragment carries its own start time and sampling frequency;
/// the caller merges them with [`merge`].
pub trait WaveformSource {
    fn query(
        &self,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        tw: &TimeWindow,
    ) -> ReloddResult<Vec<Trace>>;
}

/// Concatenate consecutive record fragments into a single trace.
///
/// All fragments must share the sampling frequency and line up within half
/// a sample: a gap or overlap larger than `0.5/fs` seconds aborts the
/// merge. Returns `None` on an empty input or any violation.
pub fn merge(fragments: &[Trace]) -> Option<Trace> {
    let first = fragments.first()?;
    let fs = first.sampling_frequency;
    let max_allowed = 0.5 / fs;

    let mut merged = first.clone();
    for fragment in &fragments[1..] {
        if fragment.sampling_frequency != fs {
            debug!(
                "{}: record sampling frequencies are not consistent: {} != {}",
                merged.stream_id(),
                fs,
                fragment.sampling_frequency
            );
            return None;
        }

        let diff = (fragment.start_time - merged.end_time()).to_seconds();
        if diff > max_allowed {
            debug!("{}: gap detected of {:.6}s", merged.stream_id(), diff);
            return None;
        }
        if diff < -max_allowed {
            debug!("{}: overlap detected of {:.6}s", merged.stream_id(), -diff);
            return None;
        }

        merged.samples.extend_from_slice(&fragment.samples);
    }

    Some(merged)
}

/// Change the sampling rate by index stepping.
///
/// Upsampling duplicates samples; downsampling takes every `step`-th
/// sample, optionally averaged over a window of `⌊step·0.5 + 0.5⌋`
/// neighbours on each side.
pub fn resample(trace: &mut Trace, sampling_frequency: f64, average: bool) {
    if sampling_frequency <= 0.0 || trace.sampling_frequency == sampling_frequency {
        return;
    }

    let step = trace.sampling_frequency / sampling_frequency;
    let data = &mut trace.samples;

    if step < 1.0 {
        // upsampling
        let new_len = (data.len() as f64 / step) as usize;
        let mut fi = (data.len() - 1) as f64;
        let mut out = vec![0.0; new_len];
        for i in (0..new_len).rev() {
            out[i] = data[fi as usize];
            fi -= step;
        }
        *data = out;
    } else {
        // downsampling
        let window = if average { (step * 0.5 + 0.5) as usize } else { 0 };
        let cnt = data.len();
        let mut out = Vec::with_capacity((cnt as f64 / step) as usize + 1);
        let mut fi = 0.0_f64;

        while (fi as usize) < cnt {
            let ci = fi as usize;
            if window == 0 {
                out.push(data[ci]);
            } else {
                let mut value = data[ci];
                let mut scale = 1.0;
                for g in 1..window {
                    if ci >= g {
                        value += data[ci - g];
                        scale += 1.0;
                    }
                    if ci + g < cnt {
                        value += data[ci + g];
                        scale += 1.0;
                    }
                }
                out.push(value / scale);
            }
            fi += step;
        }
        *data = out;
    }

    trace.sampling_frequency = sampling_frequency;
}

/// Peak-amplitude signal to noise ratio around a pick.
///
/// The four offsets are seconds relative to `pick_time`. Returns -1 when
/// any of the windows falls outside the trace.
pub fn compute_snr(
    trace: &Trace,
    pick_time: Epoch,
    noise_offset_start: f64,
    noise_offset_end: f64,
    signal_offset_start: f64,
    signal_offset_end: f64,
) -> f64 {
    let fs = trace.sampling_frequency;
    let size = trace.samples.len() as i64;
    let pick_offset = (pick_time - trace.start_time).to_seconds();

    let sec_to_sample = |sec: f64| ((sec + pick_offset) * fs).round() as i64;
    let noise_start = sec_to_sample(noise_offset_start);
    let noise_end = sec_to_sample(noise_offset_end);
    let signal_start = sec_to_sample(signal_offset_start);
    let signal_end = sec_to_sample(signal_offset_end);

    let low = noise_start.min(noise_end).min(signal_start).min(signal_end);
    let high = noise_start.max(noise_end).max(signal_start).max(signal_end);
    if low < 0 || high >= size {
        error!("Cannot compute S2N ratio: noise/signal windows exceed waveform boundaries");
        return -1.0;
    }

    let peak = |start: i64, end: i64| {
        trace.samples[start as usize..end as usize]
            .iter()
            .fold(-1.0_f64, |max, s| max.max(s.abs()))
    };

    peak(signal_start, signal_end) / peak(noise_start, noise_end)
}
