//! Trace acquisition pipeline.
//!
//! [`TraceLoader::get_waveform`] turns a `(channel, window)` request into a
//! fully processed trace: optional 3-component projection, demeaning,
//! resampling, filtering and SNR gating, memoized per fingerprint in a
//! memory cache and optionally in the on-disk record cache.
//!
//! Failures here are request-scoped: the fingerprint joins the excluded
//! set, a counter is bumped and the caller gets `None`. Only a broken
//! filter descriptor is fatal, and that is caught once at construction.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};

use crate::catalog::{Event, Phase};
use crate::config::{SnrConfig, WfFilterConfig};
use crate::engine::Counters;
use crate::geodesy::delazi;
use crate::inventory::{Inventory, SensorLocation, ThreeComponents};
use crate::relodd_errors::{ReloddError, ReloddResult};
use crate::time::{to_iso_string, TimeWindow};
use crate::waveform::{self, filter::DigitalFilter, projection, record, Trace, WaveformSource};

/// Memory cache of processed traces, keyed by fingerprint.
pub type TraceCache = AHashMap<String, Arc<Trace>>;

/// Deterministic fingerprint of a processed trace request:
/// `net.sta.loc.chan.startISO.endISO`.
pub fn waveform_id(
    network: &str,
    station: &str,
    location: &str,
    channel: &str,
    tw: &TimeWindow,
) -> String {
    format!(
        "{}.{}.{}.{}.{}.{}",
        network,
        station,
        location,
        channel,
        to_iso_string(tw.start()),
        to_iso_string(tw.end())
    )
}

pub fn waveform_id_for_phase(phase: &Phase, tw: &TimeWindow) -> String {
    waveform_id(
        &phase.network_code,
        &phase.station_code,
        &phase.location_code,
        &phase.channel_code,
        tw,
    )
}

pub struct TraceLoader {
    filter: Option<DigitalFilter>,
    filter_cfg: WfFilterConfig,
    snr: SnrConfig,
    cache_dir: Utf8PathBuf,
    inventory: Arc<dyn Inventory>,
    source: Arc<dyn WaveformSource>,
    excluded: AHashSet<String>,
    pub counters: Counters,
}

impl TraceLoader {
    pub fn new(
        filter_cfg: WfFilterConfig,
        snr: SnrConfig,
        cache_dir: Utf8PathBuf,
        inventory: Arc<dyn Inventory>,
        source: Arc<dyn WaveformSource>,
    ) -> ReloddResult<Self> {
        // a broken filter descriptor fails construction
        let filter = DigitalFilter::parse(&filter_cfg.filter_string)?;
        Ok(TraceLoader {
            filter,
            filter_cfg,
            snr,
            cache_dir,
            inventory,
            source,
            excluded: AHashSet::new(),
            counters: Counters::default(),
        })
    }

    pub fn cache_dir(&self) -> &Utf8Path {
        &self.cache_dir
    }

    pub fn cache_filename(&self, waveform_id: &str) -> Utf8PathBuf {
        self.cache_dir.join(format!("{}.mseed", waveform_id))
    }

    /// Drop excluded fingerprints so a new relocation pass retries them.
    pub fn clear_excluded(&mut self) {
        self.excluded.clear();
    }

    /// Fetch, process and memoize the trace for `tw` on the stream the
    /// phase was picked on. `None` means the request is excluded: the
    /// waveform is unavailable, unmergeable, incomplete or below the SNR
    /// threshold.
    pub fn get_waveform(
        &mut self,
        tw: &TimeWindow,
        event: &Event,
        phase: &Phase,
        mem_cache: &mut TraceCache,
        use_disk_cache: bool,
        check_snr: bool,
    ) -> Option<Arc<Trace>> {
        let wf_id = waveform_id_for_phase(phase, tw);

        if let Some(cached) = mem_cache.get(&wf_id) {
            return Some(cached.clone());
        }
        if self.excluded.contains(&wf_id) {
            return None;
        }

        let wf_desc = format!(
            "{} time slice from {} length {:.2} sec",
            phase,
            to_iso_string(tw.start()),
            tw.length_secs()
        );

        // decide whether the pick's channel is a native component or has
        // to be synthesized from the three-component set
        let mut projection_required = true;
        let mut sensor: Option<SensorLocation> = None;
        let mut components: Option<ThreeComponents> = None;

        match self.inventory.sensor_location(
            &phase.network_code,
            &phase.station_code,
            &phase.location_code,
            tw.start(),
        ) {
            None => {
                // try to load the waveform anyway, just without projection
                debug!("Unable to fetch sensor location information ({})", wf_desc);
                projection_required = false;
            }
            Some(loc) => {
                let root_len = phase.channel_code.len().saturating_sub(1);
                components = loc.three_components(&phase.channel_code[..root_len]);
                if let Some(tc) = &components {
                    if tc.component_codes().contains(&phase.channel_code.as_str()) {
                        projection_required = false;
                    }
                }
                sensor = Some(loc);
            }
        }

        let snr_gate = check_snr && self.snr.min_snr > 0.0;
        let tw_to_load = if snr_gate {
            self.time_window_to_load(phase, tw)
        } else {
            *tw
        };

        let loaded = if !projection_required {
            self.load_waveform(
                &tw_to_load,
                &phase.network_code,
                &phase.station_code,
                &phase.location_code,
                &phase.channel_code,
                use_disk_cache,
            )
        } else {
            match (&components, &sensor) {
                (Some(tc), Some(loc)) => self.load_projected_waveform(
                    &tw_to_load,
                    event,
                    phase,
                    tc,
                    loc,
                    use_disk_cache,
                ),
                _ => {
                    debug!("Unable to fetch orientation information ({})", wf_desc);
                    self.excluded.insert(wf_id);
                    self.counters.wf_no_avail += 1;
                    return None;
                }
            }
        };

        let mut trace = match loaded {
            Ok(trace) => trace,
            Err(err) => {
                debug!("{} ({})", err, wf_desc);
                self.excluded.insert(wf_id);
                self.counters.wf_no_avail += 1;
                return None;
            }
        };

        self.process(&mut trace);

        if self.filter_cfg.dump {
            self.dump_trace(&trace, &wf_id, ".processed");
        }

        if snr_gate {
            let snr = waveform::compute_snr(
                &trace,
                phase.time,
                self.snr.noise_start,
                self.snr.noise_end,
                self.snr.signal_start,
                self.snr.signal_end,
            );
            if snr < self.snr.min_snr {
                debug!("Trace has too low SNR ({:.2}), discard it ({})", snr, wf_desc);
                if self.filter_cfg.dump {
                    self.dump_trace(&trace, &wf_id, ".snr-rejected");
                }
                self.excluded.insert(wf_id);
                self.counters.snr_low += 1;
                return None;
            }
        }

        // cut away the extra data loaded for the SNR windows
        if tw_to_load != *tw {
            trace = match trace.slice(tw) {
                Some(trimmed) => trimmed,
                None => {
                    debug!("Incomplete trace, not enough data ({})", wf_desc);
                    self.excluded.insert(wf_id);
                    return None;
                }
            };
        }

        let trace = Arc::new(trace);
        mem_cache.insert(wf_id, trace.clone());
        Some(trace)
    }

    /// Expand the load window so it also covers the SNR noise and signal
    /// sub-windows around the pick.
    fn time_window_to_load(&self, phase: &Phase, needed: &TimeWindow) -> TimeWindow {
        let mut start = needed.start();
        let mut end = needed.end();
        for offset in [self.snr.noise_start, self.snr.signal_start] {
            let t = phase.time + hifitime::Duration::from_seconds(offset);
            if t < start {
                start = t;
            }
        }
        for offset in [self.snr.noise_end, self.snr.signal_end] {
            let t = phase.time + hifitime::Duration::from_seconds(offset);
            if t > end {
                end = t;
            }
        }
        TimeWindow::new(start, end)
    }

    /// Read one channel from the disk cache or the waveform source.
    fn load_waveform(
        &self,
        tw: &TimeWindow,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        use_disk_cache: bool,
    ) -> ReloddResult<Trace> {
        let wf_id = waveform_id(network, station, location, channel, tw);
        let cache_file = self.cache_filename(&wf_id);

        if use_disk_cache && cache_file.exists() {
            match record::read_trace(&cache_file) {
                Ok(trace) => return Ok(trace),
                Err(err) => warn!(
                    "Couldn't load cached waveform {} ({}), reading it from the stream",
                    cache_file, err
                ),
            }
        }

        let stream_desc = format!(
            "stream {}.{}.{}.{} from {} length {:.2} sec",
            network,
            station,
            location,
            channel,
            to_iso_string(tw.start()),
            tw.length_secs()
        );

        let fragments = self.source.query(network, station, location, channel, tw)?;
        if fragments.is_empty() {
            return Err(ReloddError::WaveformUnavailable(stream_desc));
        }
        let merged =
            waveform::merge(&fragments).ok_or(ReloddError::TraceMergeFailed(stream_desc.clone()))?;
        let trimmed = merged
            .slice(tw)
            .ok_or(ReloddError::IncompleteTrace(stream_desc))?;

        if use_disk_cache {
            if let Err(err) = record::write_trace(&trimmed, &cache_file) {
                warn!("Couldn't write waveform cache to disk {}: {}", cache_file, err);
            }
        }

        Ok(trimmed)
    }

    /// Load the three native components and rotate them into the channel
    /// the phase was picked on (ZNE or ZRT frame by channel suffix).
    fn load_projected_waveform(
        &self,
        tw: &TimeWindow,
        event: &Event,
        phase: &Phase,
        tc: &ThreeComponents,
        sensor: &SensorLocation,
        use_disk_cache: bool,
    ) -> ReloddResult<Trace> {
        let suffix = phase
            .channel_code
            .chars()
            .last()
            .ok_or(ReloddError::UnknownChannelSuffix('?'))?;
        let slot = projection::slot_for_suffix(suffix)?;

        let orientation = projection::orientation_zne(tc);
        let transformation = match suffix {
            'R' | 'T' => {
                let (_, _, baz) = delazi(
                    event.latitude,
                    event.longitude,
                    sensor.latitude,
                    sensor.longitude,
                );
                projection::rotation_zrt(baz) * orientation
            }
            _ => orientation,
        };

        debug!(
            "Loading the 3 component waveforms ({} {} {}) to perform the projection",
            tc.vertical.code, tc.first_horizontal.code, tc.second_horizontal.code
        );

        let load = |channel: &str| {
            self.load_waveform(
                tw,
                &phase.network_code,
                &phase.station_code,
                &phase.location_code,
                channel,
                use_disk_cache,
            )
        };
        let vertical = load(&tc.vertical.code)?;
        let first = load(&tc.first_horizontal.code)?;
        let second = load(&tc.second_horizontal.code)?;

        let projected = projection::project(
            &second,
            &first,
            &vertical,
            &transformation,
            slot,
            &phase.channel_code,
        )?;

        projected.slice(tw).ok_or_else(|| {
            ReloddError::IncompleteTrace(format!("projected {}", projected.stream_id()))
        })
    }

    /// Demean, optionally resample, optionally filter.
    fn process(&self, trace: &mut Trace) {
        trace.demean();
        if self.filter_cfg.resample_freq > 0.0 {
            waveform::resample(trace, self.filter_cfg.resample_freq, true);
        }
        if let Some(filter) = &self.filter {
            filter.apply(trace.sampling_frequency(), trace.samples_mut());
        }
    }

    fn dump_trace(&self, trace: &Trace, waveform_id: &str, extension: &str) {
        let file = self.cache_dir.join(format!("{}{}", waveform_id, extension));
        if let Err(err) = record::write_trace(trace, &file) {
            warn!("Couldn't dump trace to {}: {}", file, err);
        }
    }
}
