//! Relocation orchestrator.
//!
//! [`DdEngine`] drives the whole pipeline: it filters the background
//! catalog once, then serves two relocation modes. Whole-catalog mode
//! builds the solver inputs for every event pair and runs the solver a
//! single time. Single-event mode runs two passes for one target event: a
//! coarse refinement from catalog travel times only, then a refined pass
//! that adds cross-correlation differential times starting from the
//! coarse hypocenter.
//!
//! Every step works in its own subdirectory of the engine working
//! directory and dumps its starting/relocated catalog as CSV next to the
//! solver files, so a failed run can be replayed by hand.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::sync::Arc;

use ahash::AHashSet;
use camino::{Utf8Path, Utf8PathBuf};
use hifitime::Epoch;
use log::{error, info, warn};

use crate::catalog::{filter_phases, Catalog, Event, EventId, Phase};
use crate::config::Config;
use crate::inventory::Inventory;
use crate::neighbors::{select_neighboring_events, select_neighbors_catalog};
use crate::relodd_errors::{ReloddError, ReloddResult};
use crate::solver;
use crate::synth::PhaseSynthesizer;
use crate::waveform::pipeline::{waveform_id_for_phase, TraceCache, TraceLoader};
use crate::waveform::WaveformSource;
use crate::xcorr::{self, xcorr_phase_pair};

/// Telemetry counters of one differential-time build or preload pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub xcorr_tot: u32,
    pub xcorr_performed: u32,
    pub xcorr_cc_good: u32,
    pub xcorr_cc_low: u32,
    pub snr_low: u32,
    pub wf_no_avail: u32,
}

pub struct DdEngine {
    cfg: Config,
    working_dir: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
    /// Background catalog after phase filtering and canonicalization.
    ddbg: Catalog,
    loader: TraceLoader,
    wf_cache: TraceCache,
}

impl DdEngine {
    pub fn new(
        catalog: Catalog,
        cfg: Config,
        working_dir: impl Into<Utf8PathBuf>,
        inventory: Arc<dyn Inventory>,
        source: Arc<dyn WaveformSource>,
    ) -> ReloddResult<Self> {
        let working_dir = working_dir.into();
        fs::create_dir_all(&working_dir)
            .map_err(|_| ReloddError::UnableToCreateWorkDir(working_dir.clone()))?;
        let cache_dir = working_dir.join("wfcache");
        fs::create_dir_all(&cache_dir)
            .map_err(|_| ReloddError::UnableToCreateWorkDir(cache_dir.clone()))?;

        let loader = TraceLoader::new(
            cfg.wf_filter.clone(),
            cfg.snr,
            cache_dir.clone(),
            inventory,
            source,
        )?;

        let ddbg = filter_phases(&catalog, &cfg.valid_p_phases, &cfg.valid_s_phases);

        Ok(DdEngine {
            cfg,
            working_dir,
            cache_dir,
            ddbg,
            loader,
            wf_cache: TraceCache::new(),
        })
    }

    /// The filtered background catalog the engine relocates against.
    pub fn catalog(&self) -> &Catalog {
        &self.ddbg
    }

    /// Replace the background catalog (re-runs the phase filtering).
    pub fn set_catalog(&mut self, catalog: Catalog) {
        self.ddbg = filter_phases(&catalog, &self.cfg.valid_p_phases, &self.cfg.valid_s_phases);
    }

    pub fn working_dir(&self) -> &Utf8Path {
        &self.working_dir
    }

    pub fn counters(&self) -> Counters {
        self.loader.counters
    }

    /// Warm the disk and memory caches with every catalog waveform.
    pub fn preload_waveforms(&mut self) {
        self.loader.counters = Counters::default();

        let events: Vec<Event> = self.ddbg.events().values().cloned().collect();
        for event in &events {
            let phases: Vec<Phase> = self.ddbg.phases_of(event.id).to_vec();
            for phase in &phases {
                let Some(xcfg) = self.cfg.xcorr.for_phase(&phase.phase_type) else {
                    continue;
                };
                let tw = xcorr::time_window_long(xcfg, phase);
                let _ = self.loader.get_waveform(
                    &tw,
                    event,
                    phase,
                    &mut self.wf_cache,
                    self.cfg.use_catalog_disk_cache,
                    true,
                );
            }
        }

        info!(
            "Finished preloading catalog waveform data: waveforms with Signal to Noise \
             ratio too low {}, waveforms not available {}",
            self.loader.counters.snr_low, self.loader.counters.wf_no_avail
        );
    }

    /// Relocate the whole background catalog.
    ///
    /// With `force` unset, solver input files already present in the
    /// `catalog/` step directory are reused instead of regenerated. With
    /// `use_ph2dt` the pair selection is delegated to the external ph2dt
    /// preprocessor and the cross-correlation runs over the pairs it
    /// matched in `dt.ct`.
    pub fn relocate_catalog(&mut self, force: bool, use_ph2dt: bool) -> ReloddResult<Catalog> {
        info!("Starting relocator in multiple events mode");

        let mut cat_to_reloc = self.ddbg.clone();
        if self.cfg.artificial_phases.enable {
            cat_to_reloc = self.create_missing_phases(&cat_to_reloc)?;
        }

        let step_dir = self.working_dir.join("catalog");
        fs::create_dir_all(&step_dir)
            .map_err(|_| ReloddError::UnableToCreateWorkDir(step_dir.clone()))?;

        cat_to_reloc.write_to_csv(
            &step_dir.join("starting-event.csv"),
            &step_dir.join("starting-phase.csv"),
            &step_dir.join("starting-station.csv"),
        )?;

        let station_file = step_dir.join("station.dat");
        if force || !station_file.exists() {
            solver::write_station_dat(&cat_to_reloc, &station_file)?;
        }

        let event_file = step_dir.join("event.dat");
        let dtct_file = step_dir.join("dt.ct");
        let dtcc_file = step_dir.join("dt.cc");

        if !use_ph2dt {
            if force || !event_file.exists() {
                solver::write_event_dat(&cat_to_reloc, &event_file)?;
            }
            if force || !dtct_file.exists() {
                self.create_dtct_catalog(&cat_to_reloc, &dtct_file)?;
            }
            if force || !dtcc_file.exists() {
                self.create_dtcc_catalog(&cat_to_reloc, &dtcc_file)?;
            }
        } else {
            let phase_file = step_dir.join("phase.dat");
            if force || !phase_file.exists() {
                solver::write_phase_dat(&cat_to_reloc, &phase_file)?;
            }

            if force || !dtct_file.exists() {
                solver::run_ph2dt(
                    &step_dir,
                    &station_file,
                    &phase_file,
                    &self.cfg.ph2dt.ctrl_file,
                    &self.cfg.ph2dt.exec,
                )?;
                let station_sel = step_dir.join("station.sel");
                if station_sel.exists() {
                    fs::copy(&station_sel, &station_file)?;
                }
                let event_sel = step_dir.join("event.sel");
                if event_sel.exists() {
                    fs::copy(&event_sel, &event_file)?;
                }
            }

            if force || !dtcc_file.exists() {
                self.create_dtcc_ph2dt(&cat_to_reloc, &dtct_file, &dtcc_file)?;
            }
        }

        let reloc_file = step_dir.join("hypoDD.reloc");
        let residual_file = step_dir.join("hypoDD.res");
        if force || !reloc_file.exists() || !residual_file.exists() {
            solver::run_hypodd(
                &step_dir,
                &dtcc_file,
                &dtct_file,
                &event_file,
                &station_file,
                &self.cfg.hypodd.step2_ctrl_file,
                &self.cfg.hypodd.exec,
            )?;
        }

        let relocated = solver::load_relocated_catalog(&cat_to_reloc, &reloc_file, &residual_file)?;

        relocated.write_to_csv(
            &step_dir.join("relocated-event.csv"),
            &step_dir.join("relocated-phase.csv"),
            &step_dir.join("relocated-station.csv"),
        )?;

        Ok(relocated)
    }

    /// Relocate one event against the background catalog in two passes.
    ///
    /// Step 1 refines the location from catalog travel times alone; step
    /// 2 restarts from the refined hypocenter and adds cross-correlation
    /// times. The step-2 result wins when the solver accepted it, the
    /// step-1 result is the fallback, and losing both passes is an error.
    pub fn relocate_single_event(&mut self, single_event: &Catalog) -> ReloddResult<Catalog> {
        info!("Starting relocator in single event mode");

        let ev_to_relocate = single_event
            .events()
            .values()
            .next()
            .ok_or_else(|| {
                ReloddError::MalformedCatalog("single event catalog is empty".to_string())
            })?
            .clone();

        let sub_dir = self
            .working_dir
            .join(generate_working_sub_dir(&ev_to_relocate));
        if sub_dir.exists() {
            fs::remove_dir_all(&sub_dir)?;
        }

        let step1_result = match self.single_event_step1(single_event, &sub_dir) {
            Ok(relocated) => relocated,
            Err(err) => {
                error!("{}", err);
                None
            }
        };
        if step1_result.is_none() {
            error!("Failed to perform step 1 origin relocation");
        }

        let step2_result = match self.single_event_step2(single_event, step1_result.as_ref(), &sub_dir)
        {
            Ok(relocated) => relocated,
            Err(err) => {
                error!("{}", err);
                None
            }
        };
        if step2_result.is_none() {
            error!("Failed to perform step 2 origin relocation");
        }

        step2_result
            .or(step1_result)
            .ok_or(ReloddError::RelocationFailed)
    }

    /// Step 1: location refinement without cross-correlation.
    fn single_event_step1(
        &mut self,
        single_event: &Catalog,
        sub_dir: &Utf8Path,
    ) -> ReloddResult<Option<Catalog>> {
        info!("Performing step 1: initial location refinement (no cross correlation)");

        let step_dir = sub_dir.join("step1");
        fs::create_dir_all(&step_dir)
            .map_err(|_| ReloddError::UnableToCreateWorkDir(step_dir.clone()))?;

        let ev_cat = filter_phases(
            single_event,
            &self.cfg.valid_p_phases,
            &self.cfg.valid_s_phases,
        );
        let merged = self.ddbg.merge(&ev_cat, false)?;
        let target = ev_cat
            .events()
            .values()
            .next()
            .ok_or_else(|| {
                ReloddError::MalformedCatalog("single event catalog is empty".to_string())
            })?
            .clone();
        // the merge issued a new local id
        let ev_to_relocate = merged
            .search_event(&target)
            .ok_or_else(|| {
                ReloddError::MalformedCatalog("merged event not found in catalog".to_string())
            })?
            .clone();

        let mut neighbor_cat = select_neighboring_events(&merged, &ev_to_relocate, &self.cfg.dtct)?;
        let new_id = neighbor_cat.copy_event(&ev_to_relocate, &merged, false)?;

        self.run_single_event_step(
            &step_dir,
            &neighbor_cat,
            new_id,
            false,
            &self.cfg.hypodd.step1_ctrl_file.clone(),
        )
    }

    /// Step 2: relocation with cross-correlation, starting from the
    /// step-1 hypocenter when available.
    fn single_event_step2(
        &mut self,
        single_event: &Catalog,
        step1_result: Option<&Catalog>,
        sub_dir: &Utf8Path,
    ) -> ReloddResult<Option<Catalog>> {
        info!("Performing step 2: relocation with cross correlation");

        let step_dir = sub_dir.join("step2");
        fs::create_dir_all(&step_dir)
            .map_err(|_| ReloddError::UnableToCreateWorkDir(step_dir.clone()))?;

        let ev_cat = match step1_result {
            Some(relocated) => relocated.clone(),
            None => filter_phases(
                single_event,
                &self.cfg.valid_p_phases,
                &self.cfg.valid_s_phases,
            ),
        };
        let target = ev_cat
            .events()
            .values()
            .next()
            .ok_or_else(|| {
                ReloddError::MalformedCatalog("single event catalog is empty".to_string())
            })?
            .clone();

        let mut merged = self.ddbg.merge(&ev_cat, false)?;
        let mut ev_to_relocate = merged
            .search_event(&target)
            .ok_or_else(|| {
                ReloddError::MalformedCatalog("merged event not found in catalog".to_string())
            })?
            .clone();

        if self.cfg.artificial_phases.enable {
            let mut synthesizer = PhaseSynthesizer {
                cfg: &self.cfg.artificial_phases,
                xcorr_cfg: &self.cfg.xcorr,
                loader: &mut self.loader,
                wf_cache: &mut self.wf_cache,
                use_disk_cache: self.cfg.use_catalog_disk_cache,
            };
            synthesizer.add_missing_event_phases(&mut merged, &ev_to_relocate)?;
            ev_to_relocate = merged
                .event(ev_to_relocate.id)
                .ok_or(ReloddError::EventNotFound(ev_to_relocate.id))?
                .clone();
        }

        let mut neighbor_cat = select_neighboring_events(&merged, &ev_to_relocate, &self.cfg.dtcc)?;
        let new_id = neighbor_cat.copy_event(&ev_to_relocate, &merged, false)?;

        self.run_single_event_step(
            &step_dir,
            &neighbor_cat,
            new_id,
            true,
            &self.cfg.hypodd.step2_ctrl_file.clone(),
        )
    }

    /// Write the solver inputs for one single-event step, run the solver
    /// and extract the target event when it was actually relocated.
    fn run_single_event_step(
        &mut self,
        step_dir: &Utf8Path,
        neighbor_cat: &Catalog,
        ev_to_relocate_id: EventId,
        with_xcorr: bool,
        ctrl_file: &Utf8Path,
    ) -> ReloddResult<Option<Catalog>> {
        neighbor_cat.write_to_csv(
            &step_dir.join("starting-event.csv"),
            &step_dir.join("starting-phase.csv"),
            &step_dir.join("starting-station.csv"),
        )?;

        let station_file = step_dir.join("station.dat");
        solver::write_station_dat(neighbor_cat, &station_file)?;

        let event_file = step_dir.join("event.dat");
        solver::write_event_dat(neighbor_cat, &event_file)?;

        let dtct_file = step_dir.join("dt.ct");
        self.create_dtct_single_event(neighbor_cat, ev_to_relocate_id, &dtct_file)?;

        let dtcc_file = step_dir.join("dt.cc");
        if with_xcorr {
            self.create_dtcc_single_event(neighbor_cat, ev_to_relocate_id, &dtcc_file)?;
        } else {
            fs::File::create(&dtcc_file)?;
        }

        solver::run_hypodd(
            step_dir,
            &dtcc_file,
            &dtct_file,
            &event_file,
            &station_file,
            ctrl_file,
            &self.cfg.hypodd.exec,
        )?;

        let relocated = solver::load_relocated_catalog(
            neighbor_cat,
            &step_dir.join("hypoDD.reloc"),
            &step_dir.join("hypoDD.res"),
        )?;

        relocated.write_to_csv(
            &step_dir.join("relocated-event.csv"),
            &step_dir.join("relocated-phase.csv"),
            &step_dir.join("relocated-station.csv"),
        )?;

        // the reloc file can exist yet not contain the target event
        let extracted = relocated.extract_event(ev_to_relocate_id, false)?;
        let relocated_ev = extracted
            .events()
            .values()
            .next()
            .ok_or(ReloddError::EventNotFound(ev_to_relocate_id))?;
        if relocated_ev.is_relocated() {
            Ok(Some(extracted))
        } else {
            Ok(None)
        }
    }

    /// Infer missing picks for every event via cross-correlation.
    pub fn create_missing_phases(&mut self, catalog: &Catalog) -> ReloddResult<Catalog> {
        let mut synthesizer = PhaseSynthesizer {
            cfg: &self.cfg.artificial_phases,
            xcorr_cfg: &self.cfg.xcorr,
            loader: &mut self.loader,
            wf_cache: &mut self.wf_cache,
            use_disk_cache: self.cfg.use_catalog_disk_cache,
        };
        synthesizer.create_missing_phases(catalog)
    }

    /// Write `dt.ct` for the whole catalog (one neighbor set per event,
    /// pairs deduplicated).
    fn create_dtct_catalog(&self, catalog: &Catalog, dtct_file: &Utf8Path) -> ReloddResult<()> {
        info!("Creating differential travel time file {}", dtct_file);

        let neighbor_cats = select_neighbors_catalog(catalog, &self.cfg.dtct)?;

        let mut out = fs::File::create(dtct_file)?;
        for (event_id, neighbor_cat) in &neighbor_cats {
            build_abs_ttime_pairs(neighbor_cat, *event_id, &mut out)?;
        }
        Ok(())
    }

    fn create_dtct_single_event(
        &self,
        catalog: &Catalog,
        ev_to_relocate_id: EventId,
        dtct_file: &Utf8Path,
    ) -> ReloddResult<()> {
        info!("Creating differential travel time file {}", dtct_file);

        let mut out = fs::File::create(dtct_file)?;
        build_abs_ttime_pairs(catalog, ev_to_relocate_id, &mut out)
    }

    /// Write `dt.cc` for the whole catalog.
    fn create_dtcc_catalog(&mut self, catalog: &Catalog, dtcc_file: &Utf8Path) -> ReloddResult<()> {
        info!(
            "Creating cross correlation differential travel time file {}",
            dtcc_file
        );

        let neighbor_cats = select_neighbors_catalog(catalog, &self.cfg.dtcc)?;

        let mut out = fs::File::create(dtcc_file)?;
        self.loader.counters = Counters::default();
        for (event_id, neighbor_cat) in &neighbor_cats {
            self.build_xcorr_difftt_pairs(neighbor_cat, *event_id, &mut out)?;
        }
        self.log_xcorr_stats();
        Ok(())
    }

    fn create_dtcc_single_event(
        &mut self,
        catalog: &Catalog,
        ev_to_relocate_id: EventId,
        dtcc_file: &Utf8Path,
    ) -> ReloddResult<()> {
        info!(
            "Creating cross correlation differential travel time file {}",
            dtcc_file
        );

        let mut out = fs::File::create(dtcc_file)?;
        self.loader.counters = Counters::default();
        self.build_xcorr_difftt_pairs(catalog, ev_to_relocate_id, &mut out)?;
        self.log_xcorr_stats();
        Ok(())
    }

    /// Re-read the pairs ph2dt selected in `dt.ct` and cross-correlate
    /// exactly those.
    fn create_dtcc_ph2dt(
        &mut self,
        catalog: &Catalog,
        dtct_file: &Utf8Path,
        dtcc_file: &Utf8Path,
    ) -> ReloddResult<()> {
        info!(
            "Creating cross correlation differential travel time file {}",
            dtcc_file
        );

        if !dtct_file.exists() {
            return Err(ReloddError::MissingFile(dtct_file.to_owned()));
        }

        let mut out = fs::File::create(dtcc_file)?;
        self.loader.counters = Counters::default();

        let mut current_pair: Option<(Event, Event)> = None;
        let mut block = String::new();
        let mut dt_count = 0usize;

        for row in fs::read_to_string(dtct_file)?.lines() {
            let fields: Vec<&str> = row.split_whitespace().collect();

            if fields.first() == Some(&"#") && fields.len() == 3 {
                // new pair header: flush what we built so far
                if dt_count > 0 {
                    out.write_all(block.as_bytes())?;
                }
                block.clear();
                dt_count = 0;

                let ids = (fields[1].parse::<EventId>(), fields[2].parse::<EventId>());
                let (Ok(id1), Ok(id2)) = ids else {
                    current_pair = None;
                    warn!("Skipping unrecognized line from '{}' (line='{}')", dtct_file, row);
                    continue;
                };
                let (ev1, ev2) = (catalog.event(id1), catalog.event(id2));
                let (Some(ev1), Some(ev2)) = (ev1, ev2) else {
                    return Err(ReloddError::MalformedCatalog(format!(
                        "{} contains event ids ({} or {}) that are not present in the catalog",
                        dtct_file, id1, id2
                    )));
                };
                current_pair = Some((ev1.clone(), ev2.clone()));
                block.push_str(&format!("# {:>10} {:>10}       0.0\n", id1, id2));
            } else if let (Some((ev1, ev2)), 5) = (&current_pair, fields.len()) {
                let station_id = fields[0];
                let phase_type = fields[4];

                let phase1 = catalog.search_phase(ev1.id, station_id, phase_type);
                let phase2 = catalog.search_phase(ev2.id, station_id, phase_type);
                if let (Some(phase1), Some(phase2)) = (phase1, phase2) {
                    let Some(xcfg) = self.cfg.xcorr.for_phase(phase_type) else {
                        continue;
                    };
                    let (ev1, ev2, phase1, phase2) =
                        (ev1.clone(), ev2.clone(), phase1.clone(), phase2.clone());
                    if let Some(obs) = xcorr_phase_pair(
                        &mut self.loader,
                        xcfg,
                        &ev1,
                        &phase1,
                        &ev2,
                        &phase2,
                        &mut self.wf_cache,
                        self.cfg.use_catalog_disk_cache,
                    ) {
                        block.push_str(&format!(
                            "{:<12} {:.6} {:.4} {}\n",
                            station_id, obs.dtcc, obs.weight, phase_type
                        ));
                        dt_count += 1;
                    }
                }
            } else if !row.trim().is_empty() {
                current_pair = None;
                warn!("Skipping unrecognized line from '{}' (line='{}')", dtct_file, row);
            }
        }

        if dt_count > 0 {
            out.write_all(block.as_bytes())?;
        }
        Ok(())
    }

    /// One `dt.cc` block per neighbor of the reference event.
    fn build_xcorr_difftt_pairs(
        &mut self,
        catalog: &Catalog,
        ref_ev_id: EventId,
        out: &mut impl Write,
    ) -> ReloddResult<()> {
        let ref_ev = catalog
            .event(ref_ev_id)
            .ok_or(ReloddError::EventNotFound(ref_ev_id))?
            .clone();

        for event in catalog.events().values() {
            if event.id == ref_ev.id {
                continue;
            }

            let mut block = format!("# {:>10} {:>10}       0.0\n", ref_ev.id, event.id);
            let mut dt_count = 0usize;

            for phase in catalog.phases_of(event.id) {
                let Some(ref_phase) =
                    catalog.search_phase(ref_ev.id, &phase.station_id, &phase.phase_type)
                else {
                    continue;
                };
                let Some(xcfg) = self.cfg.xcorr.for_phase(&ref_phase.phase_type) else {
                    continue;
                };

                let (ref_phase, phase) = (ref_phase.clone(), phase.clone());
                if let Some(obs) = xcorr_phase_pair(
                    &mut self.loader,
                    xcfg,
                    &ref_ev,
                    &ref_phase,
                    event,
                    &phase,
                    &mut self.wf_cache,
                    self.cfg.use_catalog_disk_cache,
                ) {
                    block.push_str(&format!(
                        "{:<12} {:.6} {:.4} {}\n",
                        ref_phase.station_id, obs.dtcc, obs.weight, ref_phase.phase_type
                    ));
                    dt_count += 1;
                }
            }

            if dt_count > 0 {
                out.write_all(block.as_bytes())?;
            }
        }
        Ok(())
    }

    fn log_xcorr_stats(&self) {
        let c = self.loader.counters;
        info!(
            "Cross correlation statistics: attempted {} performed {} with good cc \
             coefficient {} with too low cc coefficient {} waveforms with Signal to \
             Noise ratio too low {} waveforms not available {}",
            c.xcorr_tot, c.xcorr_performed, c.xcorr_cc_good, c.xcorr_cc_low, c.snr_low,
            c.wf_no_avail
        );
    }

    /// Purge the working directory (keeping the waveform cache) and prune
    /// both caches to the fingerprints of the current catalog.
    pub fn clean_unused_resources(&mut self) {
        info!("Cleaning unused resources");

        if self.cfg.working_dir_cleanup {
            if let Ok(entries) = fs::read_dir(&self.working_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path == std::path::Path::new(self.cache_dir.as_str()) {
                        continue;
                    }
                    info!("Deleting {}", path.display());
                    let result = if path.is_dir() {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    if let Err(err) = result {
                        warn!("Couldn't delete {}: {}", path.display(), err);
                    }
                }
            }
        }

        // fingerprints and file prefixes of the catalog waveforms
        let mut wf_to_keep: AHashSet<String> = AHashSet::new();
        let mut file_prefixes: BTreeSet<String> = BTreeSet::new();
        for event in self.ddbg.events().values() {
            for phase in self.ddbg.phases_of(event.id) {
                let Some(xcfg) = self.cfg.xcorr.for_phase(&phase.phase_type) else {
                    continue;
                };
                let tw = xcorr::time_window_long(xcfg, phase);
                wf_to_keep.insert(waveform_id_for_phase(phase, &tw));
                file_prefixes.insert(format!(
                    "{}.{}.{}.",
                    phase.network_code, phase.station_code, phase.location_code
                ));
            }
        }

        self.wf_cache.retain(|id, _| wf_to_keep.contains(id));

        if self.cfg.use_catalog_disk_cache {
            if let Ok(entries) = fs::read_dir(&self.cache_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !file_prefixes.iter().any(|prefix| name.starts_with(prefix)) {
                        info!("Deleting {}", entry.path().display());
                        if let Err(err) = fs::remove_file(entry.path()) {
                            warn!("Couldn't delete {}: {}", entry.path().display(), err);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for DdEngine {
    fn drop(&mut self) {
        if self.cfg.working_dir_cleanup {
            self.clean_unused_resources();
        }
    }
}

/// One `dt.ct` block per neighbor: `# id1 id2` then one
/// `sta tt1 tt2 weight type` line per common observation.
fn build_abs_ttime_pairs(
    catalog: &Catalog,
    ref_ev_id: EventId,
    out: &mut impl Write,
) -> ReloddResult<()> {
    let ref_ev = catalog
        .event(ref_ev_id)
        .ok_or(ReloddError::EventNotFound(ref_ev_id))?;

    for event in catalog.events().values() {
        if event.id == ref_ev.id {
            continue;
        }

        let mut block = format!("# {:>10} {:>10}\n", ref_ev.id, event.id);
        let mut dt_count = 0usize;

        for phase in catalog.phases_of(event.id) {
            let Some(ref_phase) =
                catalog.search_phase(ref_ev.id, &phase.station_id, &phase.phase_type)
            else {
                continue;
            };

            let ref_travel_time = ref_phase.travel_time(ref_ev);
            if ref_travel_time < 0.0 {
                log::debug!(
                    "Ignoring {} with negative travel time ({})",
                    ref_phase,
                    ref_ev
                );
                continue;
            }
            let travel_time = phase.travel_time(event);
            if travel_time < 0.0 {
                log::debug!("Ignoring {} with negative travel time ({})", phase, event);
                continue;
            }

            let weight = (ref_phase.weight + phase.weight) / 2.0;
            block.push_str(&format!(
                "{:<12} {:.6} {:.6} {:.2} {}\n",
                ref_phase.station_id, ref_travel_time, travel_time, weight, ref_phase.phase_type
            ));
            dt_count += 1;
        }

        if dt_count > 0 {
            out.write_all(block.as_bytes())?;
        }
    }
    Ok(())
}

/// Step directory name for a target event:
/// `OriginTime_Lat_Lon_CreationTime`, e.g.
/// `20111210115715_46343_007519_20111210115740`.
fn generate_working_sub_dir(event: &Event) -> String {
    let (year, month, day, hour, minute, second, _) = event.time.to_gregorian_utc();
    let now = Epoch::now().unwrap_or(event.time);
    let (ny, nmo, nd, nh, nmi, ns, _) = now.to_gregorian_utc();
    format!(
        "{}{:02}{:02}{:02}{:02}{:02}_{:05}_{:06}_{}{:02}{:02}{:02}{:02}{:02}",
        year,
        month,
        day,
        hour,
        minute,
        second,
        (event.latitude * 1000.0) as i32,
        (event.longitude * 1000.0) as i32,
        ny,
        nmo,
        nd,
        nh,
        nmi,
        ns
    )
}
