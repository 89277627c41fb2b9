//! Normalized time-domain cross-correlation with cycle-skip rejection.
//!
//! A short window around one pick slides inside a longer window around the
//! other; the delay of the best normalized coefficient becomes the
//! cross-correlation correction of the differential travel time. Side-lobe
//! maxima close to the global one indicate the correlator may have locked
//! onto the wrong cycle of a periodic arrival, in which case the
//! measurement is discarded (Diehl et al. 2017).

use hifitime::Duration;
use log::{debug, info};

use crate::catalog::{Event, Phase};
use crate::config::XcorrConfig;
use crate::time::TimeWindow;
use crate::waveform::pipeline::{TraceCache, TraceLoader};
use crate::waveform::Trace;

/// Raw correlation outcome; `coeff` is NaN after a cycle-skip rejection.
#[derive(Debug, Clone, Copy)]
pub struct CrossCorrelation {
    pub delay: f64,
    pub coeff: f64,
}

/// Accepted differential-time observation for one station phase pair.
#[derive(Debug, Clone, Copy)]
pub struct XcorrObservation {
    pub dtcc: f64,
    /// Squared correlation coefficient.
    pub weight: f64,
}

/// Short window: the signal of interest around the pick.
pub fn time_window_short(cfg: &XcorrConfig, phase: &Phase) -> TimeWindow {
    let duration = cfg.end_offset - cfg.start_offset;
    let start = phase.time + Duration::from_seconds(cfg.start_offset);
    TimeWindow::from_start_length(start, duration)
}

/// Long window: the short window extended by the maximum delay on both
/// sides, so every candidate alignment stays in bounds.
pub fn time_window_long(cfg: &XcorrConfig, phase: &Phase) -> TimeWindow {
    let duration = (cfg.end_offset - cfg.start_offset) + cfg.max_delay * 2.0;
    let start = phase.time + Duration::from_seconds(cfg.start_offset - cfg.max_delay);
    TimeWindow::from_start_length(start, duration)
}

/// Correlate two demeaned traces over delays up to `max_delay` seconds.
///
/// The shorter trace slides inside the longer one, centered, summing
/// products only where both are in bounds. Returns `None` when the
/// sampling frequencies differ. With `quality_check`, a second side-lobe
/// maximum within `(1 - CCmax)/2` of the best coefficient marks a
/// cycle-skip candidate and sets the coefficient to NaN.
pub fn xcorr_traces(
    tr1: &Trace,
    tr2: &Trace,
    max_delay: f64,
    quality_check: bool,
) -> Option<CrossCorrelation> {
    if tr1.sampling_frequency() != tr2.sampling_frequency() {
        info!(
            "Cannot cross correlate traces with different sampling freq ({}!={})",
            tr1.sampling_frequency(),
            tr2.sampling_frequency()
        );
        return None;
    }

    let freq = tr1.sampling_frequency();
    let max_delay_smps = (max_delay * freq) as i64;

    let swap = tr1.sample_count() > tr2.sample_count();
    let (shorter, longer) = if swap { (tr2, tr1) } else { (tr1, tr2) };
    let smps_s = shorter.samples();
    let smps_l = longer.samples();
    let size_s = smps_s.len() as i64;
    let size_l = smps_l.len() as i64;

    let mut delay_out = 0.0;
    let mut coeff_out = f64::NAN;

    // local maxima of the correlation function, kept for the quality check
    let mut local_maxs: Vec<f64> = Vec::new();
    let mut not_decreasing = false;
    let mut prev_coeff = -1.0;

    for delay in -max_delay_smps..max_delay_smps {
        let mut numer = 0.0;
        let mut denom_l = 0.0;
        let mut denom_s = 0.0;
        for idx_s in 0..size_s {
            let idx_l = idx_s + (size_l - size_s) / 2 + delay;
            if idx_l < 0 || idx_l >= size_l {
                continue;
            }
            let (s, l) = (smps_s[idx_s as usize], smps_l[idx_l as usize]);
            numer += s * l;
            denom_l += l * l;
            denom_s += s * s;
        }
        let coeff = numer / (denom_s * denom_l).sqrt();
        if coeff > coeff_out || !coeff_out.is_finite() {
            coeff_out = coeff;
            delay_out = delay as f64 / freq;
        }

        if coeff < prev_coeff && not_decreasing {
            local_maxs.push(prev_coeff);
        }
        not_decreasing = coeff >= prev_coeff;
        prev_coeff = coeff;
    }

    if swap {
        delay_out = -delay_out;
    }

    if quality_check && coeff_out.is_finite() {
        let threshold = coeff_out - (1.0 - coeff_out) / 2.0;
        let num_max = local_maxs
            .iter()
            .filter(|cc| cc.is_finite() && **cc >= threshold)
            .count();
        if num_max > 1 {
            debug!("Cycle skipping detected when cross correlating traces");
            coeff_out = f64::NAN;
        }
    }

    Some(CrossCorrelation {
        delay: delay_out,
        coeff: coeff_out,
    })
}

/// Cross-correlate the waveforms of two picks of the same type at the same
/// station and derive the differential-time observation.
///
/// The pairing rule decides the direction(s): a manual pick is trusted as
/// the short reference window against the other pick's long window; when
/// both picks are manual, or both automatic, both directions run and the
/// higher coefficient wins, which removes the asymmetry bias of a single
/// pass.
#[allow(clippy::too_many_arguments)]
pub fn xcorr_phase_pair(
    loader: &mut TraceLoader,
    cfg: &XcorrConfig,
    event1: &Event,
    phase1: &Phase,
    event2: &Event,
    phase2: &Phase,
    cache: &mut TraceCache,
    use_disk_cache: bool,
) -> Option<XcorrObservation> {
    loader.counters.xcorr_tot += 1;

    debug!(
        "Calculating cross correlation for phase pair phase1='{}', phase2='{}'",
        phase1, phase2
    );

    let tw1 = time_window_long(cfg, phase1);
    let tw2 = time_window_long(cfg, phase2);

    // the long versions get cached; the short windows are cut from them
    let tr1 = loader.get_waveform(&tw1, event1, phase1, cache, use_disk_cache, true)?;
    let tr2 = loader.get_waveform(&tw2, event2, phase2, cache, use_disk_cache, true)?;

    let both_automatic = !phase1.is_manual && !phase2.is_manual;

    let mut result1: Option<CrossCorrelation> = None;
    if phase2.is_manual || both_automatic {
        let Some(tr2_short) = tr2.slice(&time_window_short(cfg, phase2)) else {
            debug!(
                "Cannot trim phase2 waveform, skipping cross correlation \
                 for phase pair phase1='{}', phase2='{}'",
                phase1, phase2
            );
            return None;
        };
        result1 = Some(xcorr_traces(&tr1, &tr2_short, cfg.max_delay, true)?);
    }

    let mut result2: Option<CrossCorrelation> = None;
    if phase1.is_manual || both_automatic {
        let Some(tr1_short) = tr1.slice(&time_window_short(cfg, phase1)) else {
            debug!(
                "Cannot trim phase1 waveform, skipping cross correlation \
                 for phase pair phase1='{}', phase2='{}'",
                phase1, phase2
            );
            return None;
        };
        result2 = Some(xcorr_traces(&tr1_short, &tr2, cfg.max_delay, true)?);
    }

    loader.counters.xcorr_performed += 1;

    let (mut coeff, mut delay) = match result1 {
        Some(r) => (r.coeff, r.delay),
        None => (f64::NAN, 0.0),
    };
    if let Some(r2) = result2 {
        if !coeff.is_finite() || (r2.coeff.is_finite() && r2.coeff > coeff) {
            coeff = r2.coeff;
            delay = r2.delay;
        }
    }

    if !coeff.is_finite() || coeff < cfg.min_coef {
        loader.counters.xcorr_cc_low += 1;
        return None;
    }

    let travel_time1 = phase1.travel_time(event1);
    let travel_time2 = phase2.travel_time(event2);

    loader.counters.xcorr_cc_good += 1;
    Some(XcorrObservation {
        dtcc: travel_time1 - travel_time2 - delay,
        weight: coeff * coeff,
    })
}
