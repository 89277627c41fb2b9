//! String-configured digital filtering.
//!
//! The filter applied to every trace is described by a compact descriptor
//! in the configuration, e.g. `BP(3,1,20)` for a band-pass of order 3
//! between 1 and 20 Hz. Supported kinds:
//!
//! * `BP(order, locut, hicut)`: high-pass at `locut` cascaded with a
//!   low-pass at `hicut`
//! * `HP(order, cut)`
//! * `LP(order, cut)`
//!
//! Sections are Butterworth biquads; an odd order is rounded up to the
//! next even one.

use log::warn;
use regex::Regex;

use crate::relodd_errors::{ReloddError, ReloddResult};

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterKind {
    BandPass,
    HighPass,
    LowPass,
}

#[derive(Debug, Clone)]
pub struct DigitalFilter {
    kind: FilterKind,
    order: usize,
    freq1: f64,
    freq2: f64,
}

impl DigitalFilter {
    /// Parse a filter descriptor; an empty string means "no filtering".
    pub fn parse(descriptor: &str) -> ReloddResult<Option<DigitalFilter>> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Ok(None);
        }

        let invalid = || ReloddError::InvalidFilterDescriptor(descriptor.to_string());

        let re = Regex::new(r"^(BP|HP|LP)\(([^)]*)\)$").expect("static regex");
        let caps = re.captures(descriptor).ok_or_else(invalid)?;

        let params: Vec<f64> = caps[2]
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| invalid())?;

        let (kind, expected) = match &caps[1] {
            "BP" => (FilterKind::BandPass, 3),
            "HP" => (FilterKind::HighPass, 2),
            _ => (FilterKind::LowPass, 2),
        };
        if params.len() != expected || params[0] < 1.0 {
            return Err(invalid());
        }
        let order = params[0] as usize;
        let freq1 = params[1];
        let freq2 = params.get(2).copied().unwrap_or(0.0);
        if freq1 <= 0.0
            || (kind == FilterKind::BandPass && freq2 <= freq1)
        {
            return Err(invalid());
        }

        Ok(Some(DigitalFilter {
            kind,
            order,
            freq1,
            freq2,
        }))
    }

    /// Filter the samples in place. Corner frequencies at or above the
    /// Nyquist frequency are clamped just below it.
    pub fn apply(&self, sampling_frequency: f64, samples: &mut [f64]) {
        let clamp = |freq: f64| {
            let nyquist_guard = 0.49 * sampling_frequency;
            if freq >= nyquist_guard {
                warn!(
                    "Filter corner {:.2} Hz above Nyquist for fs {:.2} Hz, clamping",
                    freq, sampling_frequency
                );
                nyquist_guard
            } else {
                freq
            }
        };

        match self.kind {
            FilterKind::HighPass => {
                apply_cascade(samples, self.order, clamp(self.freq1), sampling_frequency, true)
            }
            FilterKind::LowPass => {
                apply_cascade(samples, self.order, clamp(self.freq1), sampling_frequency, false)
            }
            FilterKind::BandPass => {
                apply_cascade(samples, self.order, clamp(self.freq1), sampling_frequency, true);
                apply_cascade(samples, self.order, clamp(self.freq2), sampling_frequency, false);
            }
        }
    }
}

/// Butterworth cascade of second-order sections (order rounded up to even).
fn apply_cascade(samples: &mut [f64], order: usize, freq: f64, fs: f64, highpass: bool) {
    let sections = order.div_ceil(2);
    let effective_order = 2 * sections;

    for k in 0..sections {
        let theta = std::f64::consts::PI * (2 * k + 1) as f64 / (2.0 * effective_order as f64);
        let q = 1.0 / (2.0 * theta.sin());
        let biquad = Biquad::new(freq, fs, q, highpass);
        biquad.apply(samples);
    }
}

/// One second-order section with the classic audio-cookbook coefficients.
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn new(freq: f64, fs: f64, q: f64, highpass: bool) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * freq / fs;
        let alpha = w0.sin() / (2.0 * q);
        let cos_w0 = w0.cos();

        let (b0, b1, b2) = if highpass {
            ((1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0)
        } else {
            ((1.0 - cos_w0) / 2.0, 1.0 - cos_w0, (1.0 - cos_w0) / 2.0)
        };
        let a0 = 1.0 + alpha;

        Biquad {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn apply(&self, samples: &mut [f64]) {
        let (mut x1, mut x2, mut y1, mut y2) = (0.0, 0.0, 0.0, 0.0);
        for sample in samples.iter_mut() {
            let x0 = *sample;
            let y0 = self.b0 * x0 + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x0;
            y2 = y1;
            y1 = y0;
            *sample = y0;
        }
    }
}

#[cfg(test)]
mod filter_test {
    use super::*;

    #[test]
    fn test_parse_descriptors() {
        assert!(DigitalFilter::parse("").unwrap().is_none());
        assert!(DigitalFilter::parse("BP(3,1,20)").unwrap().is_some());
        assert!(DigitalFilter::parse("HP(2, 0.5)").unwrap().is_some());
        assert!(DigitalFilter::parse("LP(4,30)").unwrap().is_some());

        assert!(DigitalFilter::parse("BW(3,1,20)").is_err());
        assert!(DigitalFilter::parse("BP(3,1)").is_err());
        assert!(DigitalFilter::parse("BP(3,20,1)").is_err());
        assert!(DigitalFilter::parse("HP(0,1)").is_err());
        assert!(DigitalFilter::parse("HP(2,abc)").is_err());
    }

    #[test]
    fn test_highpass_removes_offset() {
        let filter = DigitalFilter::parse("HP(2,1)").unwrap().unwrap();
        let mut samples = vec![5.0; 2000];
        filter.apply(100.0, &mut samples);
        // after the transient the constant offset is gone
        assert!(samples[1999].abs() < 0.05);
    }

    #[test]
    fn test_lowpass_keeps_offset() {
        let filter = DigitalFilter::parse("LP(2,10)").unwrap().unwrap();
        let mut samples = vec![5.0; 2000];
        filter.apply(100.0, &mut samples);
        assert!((samples[1999] - 5.0).abs() < 0.05);
    }

    #[test]
    fn test_bandpass_attenuates_out_of_band() {
        let filter = DigitalFilter::parse("BP(3,5,15)").unwrap().unwrap();
        let fs = 100.0;

        // 10 Hz tone inside the band survives
        let mut in_band: Vec<f64> = (0..2000)
            .map(|i| (2.0 * std::f64::consts::PI * 10.0 * i as f64 / fs).sin())
            .collect();
        filter.apply(fs, &mut in_band);
        let tail_peak = in_band[1500..].iter().fold(0.0_f64, |m, s| m.max(s.abs()));
        assert!(tail_peak > 0.5);

        // 0.2 Hz drift outside the band is suppressed
        let mut drift: Vec<f64> = (0..2000)
            .map(|i| (2.0 * std::f64::consts::PI * 0.2 * i as f64 / fs).sin())
            .collect();
        filter.apply(fs, &mut drift);
        let drift_peak = drift[1500..].iter().fold(0.0_f64, |m, s| m.max(s.abs()));
        assert!(drift_peak < 0.1);
    }
}
