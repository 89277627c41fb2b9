//! Artificial-phase synthesis.
//!
//! When the reference event lacks a P or S pick at a station where nearby
//! events carry manual picks, the pick can be inferred: the neighbors'
//! travel times bracket a search window on the reference trace, each
//! neighbor's pick window is cross-correlated against it, and the best
//! correlations vote on where the missing arrival sits. The synthesized
//! pick is automatic and weighted by the scatter of the vote.

use std::collections::{BTreeMap, BTreeSet};

use hifitime::Duration;
use itertools::Itertools;
use log::{debug, info};
use ordered_float::NotNan;

use crate::catalog::{compute_pick_weight, Catalog, Event, EventId, Phase};
use crate::config::{ArtificialPhasesConfig, XcorrSet};
use crate::geodesy::{event_distance, station_distance};
use crate::relodd_errors::ReloddResult;
use crate::stats::{compute_mean, compute_mean_absolute_deviation};
use crate::time::TimeWindow;
use crate::waveform::pipeline::{TraceCache, TraceLoader};
use crate::xcorr;

pub struct PhaseSynthesizer<'a> {
    pub cfg: &'a ArtificialPhasesConfig,
    pub xcorr_cfg: &'a XcorrSet,
    pub loader: &'a mut TraceLoader,
    pub wf_cache: &'a mut TraceCache,
    pub use_disk_cache: bool,
}

impl PhaseSynthesizer<'_> {
    /// Run the synthesis for every event of the catalog.
    pub fn create_missing_phases(&mut self, catalog: &Catalog) -> ReloddResult<Catalog> {
        let mut new_catalog = catalog.clone();
        let events: Vec<Event> = catalog.events().values().cloned().collect();
        for event in &events {
            self.add_missing_event_phases(&mut new_catalog, event)?;
        }
        Ok(new_catalog)
    }

    /// Synthesize the missing picks of one event and install them in the
    /// catalog, replacing any pick they were derived to supersede.
    pub fn add_missing_event_phases(
        &mut self,
        catalog: &mut Catalog,
        ref_ev: &Event,
    ) -> ReloddResult<()> {
        let new_phases = self.find_missing_event_phases(catalog, ref_ev)?;
        for phase in new_phases {
            catalog.remove_phase(phase.event_id, &phase.station_id, &phase.phase_type);
            catalog.add_phase(phase);
        }
        Ok(())
    }

    fn find_missing_event_phases(
        &mut self,
        catalog: &Catalog,
        ref_ev: &Event,
    ) -> ReloddResult<Vec<Phase>> {
        let ref_phases = catalog.phases_of(ref_ev.id);

        info!(
            "Creating missing phases for {} (current num phases {})",
            ref_ev,
            ref_phases.len()
        );

        // stations where the reference event misses a P or S pick
        let mut missing_phases: BTreeMap<(String, String), f64> = BTreeMap::new();
        for station in catalog.stations().values() {
            let mut found_p = false;
            let mut found_s = false;
            for phase in ref_phases {
                if station.network_code == phase.network_code
                    && station.station_code == phase.station_code
                {
                    if self.cfg.fix_auto_phase && !phase.is_manual {
                        continue;
                    }
                    if phase.phase_type == "P" {
                        found_p = true;
                    }
                    if phase.phase_type == "S" {
                        found_s = true;
                    }
                }
                if found_p && found_s {
                    break;
                }
            }
            if !found_p || !found_s {
                let (station_dist, _, _) = station_distance(ref_ev, station);
                if !found_p {
                    missing_phases.insert((station.id.clone(), "P".to_string()), station_dist);
                }
                if !found_s {
                    missing_phases.insert((station.id.clone(), "S".to_string()), station_dist);
                }
            }
        }

        // other events by distance to the reference, closest first
        let mut events_by_distance: BTreeSet<(NotNan<f64>, EventId)> = BTreeSet::new();
        for event in catalog.events().values() {
            if event.id == ref_ev.id {
                continue;
            }
            let (distance, _, _) = event_distance(ref_ev, event);
            if let Ok(distance) = NotNan::new(distance) {
                events_by_distance.insert((distance, event.id));
            }
        }

        let mut new_phases = Vec::new();
        let mut tmp_cache = TraceCache::new();

        for ((station_id, phase_type), ref_station_dist) in &missing_phases {
            let Some(station) = catalog.stations().get(station_id) else {
                continue;
            };
            let Some(xcfg) = self.xcorr_cfg.for_phase(phase_type) else {
                continue;
            };

            debug!(
                "{}: try to detect missing {} phase for station {} (distance {:.2} km)",
                ref_ev, phase_type, station_id, ref_station_dist
            );

            // close-by events with a manual pick of the missing type at
            // this station; also remember the stream coordinates of the
            // pick closest in time to the reference origin
            let mut peers: Vec<(f64, Event, Phase)> = Vec::new();
            let mut stream: Option<(String, String, hifitime::Epoch)> = None;

            for (distance, event_id) in &events_by_distance {
                if distance.into_inner() > self.cfg.max_ie_dist {
                    continue;
                }
                let Some(event) = catalog.event(*event_id) else {
                    continue;
                };
                for phase in catalog.phases_of(*event_id) {
                    if station.network_code == phase.network_code
                        && station.station_code == phase.station_code
                    {
                        if *phase_type == phase.phase_type && phase.is_manual {
                            peers.push((phase.travel_time(event), event.clone(), phase.clone()));
                        }

                        let is_closer = match &stream {
                            None => true,
                            Some((_, _, time)) => {
                                (ref_ev.time - phase.time).abs() < (ref_ev.time - *time).abs()
                            }
                        };
                        if is_closer {
                            stream = Some((
                                phase.location_code.clone(),
                                phase.channel_code.clone(),
                                phase.time,
                            ));
                        }
                        break;
                    }
                }
            }

            if peers.len() < self.cfg.num_cc.max(2) {
                debug!(
                    "{}: cannot create phase {} for station {}. Not enough close-by events",
                    ref_ev, phase_type, station_id
                );
                continue;
            }

            // the closest and furthest travel times bracket the window
            // where the missing arrival must sit
            peers.sort_by(|a, b| a.0.total_cmp(&b.0));
            let closer_travel_time = peers.first().map(|p| p.0).unwrap_or(0.0);
            let further_travel_time = peers.last().map(|p| p.0).unwrap_or(0.0);

            let start =
                ref_ev.time + Duration::from_seconds(closer_travel_time + xcfg.start_offset);
            let end = ref_ev.time + Duration::from_seconds(further_travel_time + xcfg.end_offset);
            let mut xcorr_tw = TimeWindow::new(start, end);
            if xcorr_tw.length_secs() > self.cfg.max_cc_tw {
                xcorr_tw = TimeWindow::new(
                    ref_ev.time - Duration::from_seconds(self.cfg.max_cc_tw / 2.0),
                    ref_ev.time + Duration::from_seconds(self.cfg.max_cc_tw / 2.0),
                );
            }

            let Some((location_code, channel_code, _)) = stream.clone() else {
                continue;
            };

            let mut new_phase = Phase {
                event_id: ref_ev.id,
                station_id: station_id.clone(),
                time: xcorr_tw.start() + Duration::from_seconds(xcorr_tw.length_secs() / 2.0),
                weight: 0.0,
                phase_type: phase_type.clone(),
                network_code: station.network_code.clone(),
                station_code: station.station_code.clone(),
                location_code,
                channel_code,
                is_manual: false,
                reloc_info: None,
            };

            let Some(ref_trace) =
                self.loader
                    .get_waveform(&xcorr_tw, ref_ev, &new_phase, &mut tmp_cache, false, false)
            else {
                debug!(
                    "{}: cannot create phase {} for station {}. Cannot load waveform",
                    ref_ev, phase_type, station_id
                );
                continue;
            };

            // correlate each peer's pick window against the search window
            let mut xcorr_out: Vec<(f64, f64)> = Vec::new(); // (coeff, dt)
            for (_, event, phase) in &peers {
                let tw_long = xcorr::time_window_long(xcfg, phase);
                let Some(trace) = self.loader.get_waveform(
                    &tw_long,
                    event,
                    phase,
                    self.wf_cache,
                    self.use_disk_cache,
                    true,
                ) else {
                    continue;
                };

                let tw_short = xcorr::time_window_short(xcfg, phase);
                let Some(trace_short) = trace.slice(&tw_short) else {
                    continue;
                };

                let max_delay = (xcorr_tw.length_secs() - tw_short.length_secs()) / 2.0;
                let Some(cc) = xcorr::xcorr_traces(&trace_short, &ref_trace, max_delay, true)
                else {
                    continue;
                };
                if !cc.coeff.is_finite() {
                    continue;
                }
                xcorr_out.push((cc.coeff, cc.delay));
            }

            if xcorr_out.len() < self.cfg.num_cc {
                debug!(
                    "{}: rejected artificial phase {} for station {}. \
                     Not enough close-by events to crosscorrelate ({})",
                    ref_ev,
                    phase_type,
                    station_id,
                    xcorr_out.len()
                );
                continue;
            }

            // average the best correlations
            let best: Vec<(f64, f64)> = xcorr_out
                .iter()
                .sorted_by(|a, b| b.0.total_cmp(&a.0))
                .take(self.cfg.num_cc)
                .copied()
                .collect();
            let mean_coeff = compute_mean(&best.iter().map(|x| x.0).collect::<Vec<_>>());
            let delays: Vec<f64> = best.iter().map(|x| x.1).collect();
            let mean_dt = compute_mean(&delays);

            if mean_coeff < xcfg.min_coef {
                debug!(
                    "{}: rejected artificial phase {} for station {}. \
                     Crosscorrelation coefficient too low ({:.2})",
                    ref_ev, phase_type, station_id, mean_coeff
                );
                continue;
            }

            // the scatter of the vote becomes the pick uncertainty
            let abs_mean_dev = compute_mean_absolute_deviation(&delays, mean_dt);

            new_phase.time = new_phase.time + Duration::from_seconds(mean_dt);
            new_phase.weight = compute_pick_weight(abs_mean_dev);

            info!(
                "{}: new phase {} for station {} created with weight {:.2} \
                 (average crosscorrelation coefficient {:.2} over {} close-by events)",
                ref_ev, phase_type, station_id, new_phase.weight, mean_coeff, self.cfg.num_cc
            );
            new_phases.push(new_phase);
        }

        info!("{}: created {} new phases", ref_ev, new_phases.len());
        Ok(new_phases)
    }
}

#[cfg(test)]
mod synth_test {
    use super::*;
    use std::sync::Arc;

    use ahash::AHashMap;
    use approx::assert_abs_diff_eq;
    use camino::Utf8PathBuf;
    use hifitime::Epoch;

    use crate::catalog::Station;
    use crate::config::{SnrConfig, WfFilterConfig, XcorrConfig};
    use crate::test_support::{zne_sensor, FixedInventory, MapSource};
    use crate::waveform::Trace;

    const FS: f64 = 100.0;
    const KM_IN_DEG: f64 = 1.0 / 111.19492664455873;

    fn t_ref() -> Epoch {
        Epoch::from_gregorian_utc(2021, 3, 1, 12, 0, 0, 0)
    }

    /// One continuous channel with the same wavelet at every arrival.
    fn station_trace(arrivals: &[Epoch]) -> Trace {
        let start = t_ref() - Duration::from_seconds(200.0);
        let n = (220.0 * FS) as usize;
        let mut samples = vec![0.0; n];
        for arrival in arrivals {
            let center = (*arrival - start).to_seconds();
            let from = ((center - 0.4) * FS) as usize;
            let to = ((center + 0.4) * FS) as usize;
            for i in from..to {
                let t = i as f64 / FS - center;
                samples[i] += (-t * t / 0.02).exp()
                    * (2.0 * std::f64::consts::PI * 8.0 * t).sin();
            }
        }
        Trace::new("CH", "STA1", "", "HHZ", start, FS, samples)
    }

    fn manual_s_phase(event: &Event, station_id: &str, travel_time: f64) -> Phase {
        Phase {
            event_id: event.id,
            station_id: station_id.to_string(),
            time: event.time + Duration::from_seconds(travel_time),
            weight: 1.0,
            phase_type: "S".to_string(),
            network_code: "CH".to_string(),
            station_code: "STA1".to_string(),
            location_code: String::new(),
            channel_code: "HHZ".to_string(),
            is_manual: true,
            reloc_info: None,
        }
    }

    #[test]
    fn test_synthesize_missing_s_phase() {
        let mut catalog = Catalog::new();
        let station_id = catalog.add_station(Station {
            id: String::new(),
            latitude: 46.8,
            longitude: 8.5,
            elevation: 500.0,
            network_code: "CH".to_string(),
            station_code: "STA1".to_string(),
            location_code: String::new(),
        });

        // reference event with no picks at all
        let ref_id = catalog.add_event(&Event {
            id: 0,
            time: t_ref(),
            latitude: 46.5,
            longitude: 8.5,
            depth: 5.0,
            magnitude: 2.0,
            horiz_err: 0.0,
            vert_err: 0.0,
            rms: 0.0,
            reloc_info: None,
        });

        // three neighbors at 1/2/3 km with manual S picks, travel times
        // 2.00 / 2.30 / 2.60 s
        let mut arrivals = Vec::new();
        for (k, travel_time) in [2.0, 2.3, 2.6].iter().enumerate() {
            let event = Event {
                id: 0,
                time: t_ref() - Duration::from_seconds(60.0 * (k + 1) as f64),
                latitude: 46.5 + (k + 1) as f64 * KM_IN_DEG,
                longitude: 8.5,
                depth: 5.0,
                magnitude: 1.5,
                horiz_err: 0.0,
                vert_err: 0.0,
                rms: 0.0,
                reloc_info: None,
            };
            let id = catalog.add_event(&event);
            let event = catalog.event(id).unwrap().clone();
            let phase = manual_s_phase(&event, &station_id, *travel_time);
            arrivals.push(phase.time);
            catalog.add_phase(phase);
        }

        // the reference arrival sits at t_ref + 2.35: the search window is
        // [t_ref+1.5, t_ref+3.1] (midpoint travel time 2.3), so every peer
        // correlates with dt = +0.05
        arrivals.push(t_ref() + Duration::from_seconds(2.35));

        let mut traces = AHashMap::new();
        traces.insert("HHZ".to_string(), station_trace(&arrivals));
        let source = Arc::new(MapSource::new(traces));
        let inventory = Arc::new(FixedInventory {
            location: zne_sensor(46.8, 8.5),
        });

        let dir = tempfile::tempdir().unwrap();
        let cache_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut loader = TraceLoader::new(
            WfFilterConfig {
                filter_string: String::new(),
                resample_freq: 0.0,
                dump: false,
            },
            SnrConfig {
                min_snr: 0.0,
                ..SnrConfig::default()
            },
            cache_dir,
            inventory,
            source,
        )
        .unwrap();

        let cfg = ArtificialPhasesConfig {
            enable: true,
            fix_auto_phase: false,
            max_ie_dist: 10.0,
            num_cc: 3,
            max_cc_tw: 10.0,
        };
        let xcorr_cfg = XcorrSet {
            p: XcorrConfig::default(),
            s: XcorrConfig {
                min_coef: 0.5,
                start_offset: -0.5,
                end_offset: 0.5,
                max_delay: 0.5,
            },
        };

        let mut wf_cache = TraceCache::new();
        let mut synthesizer = PhaseSynthesizer {
            cfg: &cfg,
            xcorr_cfg: &xcorr_cfg,
            loader: &mut loader,
            wf_cache: &mut wf_cache,
            use_disk_cache: false,
        };

        let ref_ev = catalog.event(ref_id).unwrap().clone();
        let mut catalog = catalog;
        synthesizer
            .add_missing_event_phases(&mut catalog, &ref_ev)
            .unwrap();

        let synthesized: Vec<&Phase> = catalog
            .phases_of(ref_id)
            .iter()
            .filter(|ph| ph.phase_type == "S")
            .collect();
        assert_eq!(synthesized.len(), 1);
        let phase = synthesized[0];

        assert!(!phase.is_manual);
        assert_eq!(phase.station_id, station_id);
        assert_eq!(phase.channel_code, "HHZ");
        // pick lands on the reference arrival: midpoint + mean dt
        let offset = (phase.time - ref_ev.time).to_seconds();
        assert_abs_diff_eq!(offset, 2.35, epsilon = 2.0 / FS);
        // all three delays agree, so the deviation is 0 and the weight 1
        assert_eq!(phase.weight, 1.0);
    }

    #[test]
    fn test_not_enough_neighbors() {
        let mut catalog = Catalog::new();
        let station_id = catalog.add_station(Station {
            id: String::new(),
            latitude: 46.8,
            longitude: 8.5,
            elevation: 500.0,
            network_code: "CH".to_string(),
            station_code: "STA1".to_string(),
            location_code: String::new(),
        });
        let ref_id = catalog.add_event(&Event {
            id: 0,
            time: t_ref(),
            latitude: 46.5,
            longitude: 8.5,
            depth: 5.0,
            magnitude: 2.0,
            horiz_err: 0.0,
            vert_err: 0.0,
            rms: 0.0,
            reloc_info: None,
        });
        // a single donor is below the minimum of two
        let donor_id = catalog.add_event(&Event {
            id: 0,
            time: t_ref() - Duration::from_seconds(60.0),
            latitude: 46.5 + KM_IN_DEG,
            longitude: 8.5,
            depth: 5.0,
            magnitude: 1.5,
            horiz_err: 0.0,
            vert_err: 0.0,
            rms: 0.0,
            reloc_info: None,
        });
        let donor = catalog.event(donor_id).unwrap().clone();
        catalog.add_phase(manual_s_phase(&donor, &station_id, 2.0));

        let source = Arc::new(MapSource::new(AHashMap::new()));
        let inventory = Arc::new(FixedInventory {
            location: zne_sensor(46.8, 8.5),
        });
        let dir = tempfile::tempdir().unwrap();
        let mut loader = TraceLoader::new(
            WfFilterConfig::default(),
            SnrConfig::default(),
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            inventory,
            source.clone(),
        )
        .unwrap();

        let cfg = ArtificialPhasesConfig {
            enable: true,
            num_cc: 2,
            max_ie_dist: 10.0,
            ..ArtificialPhasesConfig::default()
        };
        let xcorr_cfg = XcorrSet::default();
        let mut wf_cache = TraceCache::new();
        let mut synthesizer = PhaseSynthesizer {
            cfg: &cfg,
            xcorr_cfg: &xcorr_cfg,
            loader: &mut loader,
            wf_cache: &mut wf_cache,
            use_disk_cache: false,
        };

        let ref_ev = catalog.event(ref_id).unwrap().clone();
        let mut catalog = catalog;
        synthesizer
            .add_missing_event_phases(&mut catalog, &ref_ev)
            .unwrap();

        assert!(catalog.phases_of(ref_id).is_empty());
        // nothing was ever fetched
        assert_eq!(*source.queries.borrow(), 0);
    }
}
