//! Seismic event catalog: stations, events and phase picks.
//!
//! A [`Catalog`] owns three keyed collections. Events are keyed by a
//! numeric id unique within the catalog, stations by a
//! `network.station.location` id, and phases are grouped per event.
//! `BTreeMap`s keep every iteration deterministic, which the solver input
//! writers and the neighbor selection rely on.

pub mod io;

use std::collections::BTreeMap;
use std::fmt;

use hifitime::Epoch;
use log::debug;

use crate::relodd_errors::{ReloddError, ReloddResult};

pub type EventId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above sea level in meters, as the inventory reports it.
    pub elevation: f64,
    pub network_code: String,
    pub station_code: String,
    pub location_code: String,
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Relocation results attached to an event once the solver accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EventRelocInfo {
    /// Uncertainties in km.
    pub lat_uncertainty: f64,
    pub lon_uncertainty: f64,
    pub depth_uncertainty: f64,
    pub num_ccp: u32,
    pub num_ccs: u32,
    pub num_ctp: u32,
    pub num_cts: u32,
    pub rms_residual_cc: f64,
    pub rms_residual_ct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub time: Epoch,
    pub latitude: f64,
    pub longitude: f64,
    /// Depth in km, positive downward.
    pub depth: f64,
    pub magnitude: f64,
    pub horiz_err: f64,
    pub vert_err: f64,
    pub rms: f64,
    pub reloc_info: Option<EventRelocInfo>,
}

impl Event {
    /// Whether two entries describe the same hypocenter, regardless of the
    /// id they carry. Used to find an event again after a merge reassigned
    /// its id.
    pub fn same_hypocenter(&self, other: &Event) -> bool {
        self.time == other.time
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.depth == other.depth
            && self.magnitude == other.magnitude
    }

    pub fn is_relocated(&self) -> bool {
        self.reloc_info.is_some()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event {} {} lat {:.6} lon {:.6} depth {:.3}",
            self.id,
            crate::time::to_iso_string(self.time),
            self.latitude,
            self.longitude,
            self.depth
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseRelocInfo {
    /// Mean solver residual in seconds.
    pub residual: f64,
    pub final_weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub event_id: EventId,
    pub station_id: String,
    pub time: Epoch,
    /// Pick quality in `[0, 1]`.
    pub weight: f64,
    /// Source pick label before filtering (e.g. "Pg"), exactly "P" or "S"
    /// afterwards.
    pub phase_type: String,
    pub network_code: String,
    pub station_code: String,
    pub location_code: String,
    pub channel_code: String,
    pub is_manual: bool,
    pub reloc_info: Option<PhaseRelocInfo>,
}

impl Phase {
    pub fn travel_time(&self, event: &Event) -> f64 {
        (self.time - event.time).to_seconds()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "phase {} event {} station {} {}",
            self.phase_type,
            self.event_id,
            self.station_id,
            crate::time::to_iso_string(self.time)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    stations: BTreeMap<String, Station>,
    events: BTreeMap<EventId, Event>,
    phases: BTreeMap<EventId, Vec<Phase>>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn with_content(
        stations: BTreeMap<String, Station>,
        events: BTreeMap<EventId, Event>,
        phases: BTreeMap<EventId, Vec<Phase>>,
    ) -> Self {
        Catalog {
            stations,
            events,
            phases,
        }
    }

    pub fn stations(&self) -> &BTreeMap<String, Station> {
        &self.stations
    }

    pub fn events(&self) -> &BTreeMap<EventId, Event> {
        &self.events
    }

    pub fn phases(&self) -> &BTreeMap<EventId, Vec<Phase>> {
        &self.phases
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    pub fn phases_of(&self, id: EventId) -> &[Phase] {
        self.phases.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn events_mut(&mut self) -> &mut BTreeMap<EventId, Event> {
        &mut self.events
    }

    pub(crate) fn phases_mut(&mut self) -> &mut BTreeMap<EventId, Vec<Phase>> {
        &mut self.phases
    }

    /// The stable station id used everywhere: `network.station.location`.
    pub fn station_id(network: &str, station: &str, location: &str) -> String {
        format!("{}.{}.{}", network, station, location)
    }

    /// Insert a station if its id is not taken yet; returns the id.
    pub fn add_station(&mut self, sta: Station) -> String {
        let id = Self::station_id(&sta.network_code, &sta.station_code, &sta.location_code);
        self.stations.entry(id.clone()).or_insert(Station {
            id: id.clone(),
            ..sta
        });
        id
    }

    /// Insert a copy of `event` under a freshly assigned id (max + 1).
    pub fn add_event(&mut self, event: &Event) -> EventId {
        let max_key = self.events.keys().next_back().copied().unwrap_or(0);
        let new_id = max_key + 1;
        let mut new_event = event.clone();
        new_event.id = new_id;
        self.events.insert(new_id, new_event);
        new_id
    }

    pub fn add_phase(&mut self, phase: Phase) {
        self.phases.entry(phase.event_id).or_default().push(phase);
    }

    pub fn remove_event(&mut self, id: EventId) {
        self.events.remove(&id);
        self.phases.remove(&id);
    }

    pub fn remove_phase(&mut self, event_id: EventId, station_id: &str, phase_type: &str) {
        if let Some(phases) = self.phases.get_mut(&event_id) {
            phases.retain(|ph| !(ph.station_id == station_id && ph.phase_type == phase_type));
        }
    }

    /// Search an event by hypocenter value rather than id.
    pub fn search_event(&self, event: &Event) -> Option<&Event> {
        self.events.values().find(|ev| ev.same_hypocenter(event))
    }

    pub fn search_phase(
        &self,
        event_id: EventId,
        station_id: &str,
        phase_type: &str,
    ) -> Option<&Phase> {
        self.phases_of(event_id)
            .iter()
            .find(|ph| ph.station_id == station_id && ph.phase_type == phase_type)
    }

    /// Copy one event with its phases and the stations they reference from
    /// another catalog into this one.
    ///
    /// With `keep_id` the original id is preserved (it must be free);
    /// otherwise a new local id is assigned and the phases are rewritten to
    /// point at it. Returns the id the event ended up with.
    pub fn copy_event(
        &mut self,
        event: &Event,
        from: &Catalog,
        keep_id: bool,
    ) -> ReloddResult<EventId> {
        let new_id = if keep_id {
            if self.events.contains_key(&event.id) {
                return Err(ReloddError::MalformedCatalog(format!(
                    "cannot copy event {}, id already present",
                    event.id
                )));
            }
            self.events.insert(event.id, event.clone());
            event.id
        } else {
            self.add_event(event)
        };

        for phase in from.phases_of(event.id) {
            let station = from.stations.get(&phase.station_id).ok_or_else(|| {
                ReloddError::MalformedCatalog(format!(
                    "cannot find station '{}' referenced by {}",
                    phase.station_id, phase
                ))
            })?;
            self.add_station(station.clone());

            let mut phase = phase.clone();
            phase.event_id = new_id;
            self.add_phase(phase);
        }

        Ok(new_id)
    }

    /// Merge another catalog into a copy of this one. Duplicated ids are
    /// skipped when `keep_id` is set.
    pub fn merge(&self, other: &Catalog, keep_id: bool) -> ReloddResult<Catalog> {
        let mut merged = self.clone();
        for event in other.events.values() {
            if keep_id && merged.events.contains_key(&event.id) {
                debug!("Skipping duplicated event id {}", event.id);
                continue;
            }
            merged.copy_event(event, other, keep_id)?;
        }
        Ok(merged)
    }

    /// New catalog holding only the requested event, its phases and their
    /// stations.
    pub fn extract_event(&self, event_id: EventId, keep_id: bool) -> ReloddResult<Catalog> {
        let event = self
            .events
            .get(&event_id)
            .ok_or(ReloddError::EventNotFound(event_id))?;
        let mut extracted = Catalog::new();
        extracted.copy_event(event, self, keep_id)?;
        Ok(extracted)
    }
}

/// Build a catalog in which every `(event, station)` slot holds at most one
/// P and one S phase, the most preferred source label winning.
///
/// Arguments
/// ---------
/// * `p_to_keep`, `s_to_keep`: ordered preference lists of acceptable
///   source pick labels; a lower index is more preferred
///
/// Return
/// ------
/// * A new catalog whose phase types are canonicalized to exactly "P" or
///   "S". Phases whose label appears in neither list are discarded.
pub fn filter_phases(catalog: &Catalog, p_to_keep: &[String], s_to_keep: &[String]) -> Catalog {
    // (event, station) -> (preference index, phase); first-seen wins ties
    let mut filtered_p: BTreeMap<(EventId, String), (usize, Phase)> = BTreeMap::new();
    let mut filtered_s: BTreeMap<(EventId, String), (usize, Phase)> = BTreeMap::new();

    for (event_id, phases) in catalog.phases() {
        for phase in phases {
            let slot = (*event_id, phase.station_id.clone());
            if let Some(priority) = p_to_keep.iter().position(|t| *t == phase.phase_type) {
                match filtered_p.get(&slot) {
                    Some((existing, _)) if *existing <= priority => {}
                    _ => {
                        filtered_p.insert(slot, (priority, phase.clone()));
                    }
                }
            } else if let Some(priority) = s_to_keep.iter().position(|t| *t == phase.phase_type) {
                match filtered_s.get(&slot) {
                    Some((existing, _)) if *existing <= priority => {}
                    _ => {
                        filtered_s.insert(slot, (priority, phase.clone()));
                    }
                }
            } else {
                debug!("Discard {}, the type is not among the selected ones", phase);
            }
        }
    }

    let mut phases: BTreeMap<EventId, Vec<Phase>> = BTreeMap::new();
    for (canonical, selection) in [("P", filtered_p), ("S", filtered_s)] {
        for ((event_id, _), (_, mut phase)) in selection {
            phase.phase_type = canonical.to_string();
            phases.entry(event_id).or_default().push(phase);
        }
    }

    Catalog::with_content(catalog.stations().clone(), catalog.events().clone(), phases)
}

/// Fixed weighting scheme based on pick time uncertainty in seconds.
///
/// Class 0: 0     - 0.025
///       1: 0.025 - 0.050
///       2: 0.050 - 0.100
///       3: 0.100 - 0.200
///       4: 0.200 - 0.400
///       5: 0.400 -
pub fn compute_pick_weight(uncertainty: f64) -> f64 {
    if (0.0..=0.025).contains(&uncertainty) {
        1.00
    } else if uncertainty <= 0.050 {
        0.80
    } else if uncertainty <= 0.100 {
        0.60
    } else if uncertainty <= 0.200 {
        0.40
    } else if uncertainty <= 0.400 {
        0.20
    } else {
        0.10
    }
}

#[cfg(test)]
mod catalog_test {
    use super::*;

    pub(crate) fn test_station(network: &str, station: &str) -> Station {
        Station {
            id: Catalog::station_id(network, station, ""),
            latitude: 47.0,
            longitude: 8.0,
            elevation: 500.0,
            network_code: network.to_string(),
            station_code: station.to_string(),
            location_code: String::new(),
        }
    }

    pub(crate) fn test_event(id: EventId, lat: f64, lon: f64, depth: f64) -> Event {
        Event {
            id,
            time: Epoch::from_gregorian_utc(2021, 3, 1, 10, 0, 0, 0),
            latitude: lat,
            longitude: lon,
            depth,
            magnitude: 2.0,
            horiz_err: 0.1,
            vert_err: 0.2,
            rms: 0.05,
            reloc_info: None,
        }
    }

    fn test_phase(event_id: EventId, station_id: &str, phase_type: &str) -> Phase {
        Phase {
            event_id,
            station_id: station_id.to_string(),
            time: Epoch::from_gregorian_utc(2021, 3, 1, 10, 0, 3, 0),
            weight: 1.0,
            phase_type: phase_type.to_string(),
            network_code: "CH".to_string(),
            station_code: station_id.split('.').nth(1).unwrap().to_string(),
            location_code: String::new(),
            channel_code: "HHZ".to_string(),
            is_manual: true,
            reloc_info: None,
        }
    }

    fn strings(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_event_assigns_increasing_ids() {
        let mut cat = Catalog::new();
        let ev = test_event(0, 46.0, 8.0, 5.0);
        assert_eq!(cat.add_event(&ev), 1);
        let mut ev2 = test_event(0, 46.1, 8.1, 6.0);
        ev2.time = ev.time + hifitime::Duration::from_seconds(60.0);
        assert_eq!(cat.add_event(&ev2), 2);
    }

    #[test]
    fn test_filter_prefers_lower_index() {
        let mut cat = Catalog::new();
        let sta = test_station("CH", "STA1");
        cat.add_station(sta.clone());
        let ev_id = cat.add_event(&test_event(0, 46.5, 8.5, 5.0));

        let mut pg = test_phase(ev_id, &sta.id, "Pg");
        pg.time = pg.time + hifitime::Duration::from_seconds(0.2);
        let pn = test_phase(ev_id, &sta.id, "Pn");
        cat.add_phase(pg);
        cat.add_phase(pn.clone());

        let filtered = filter_phases(&cat, &strings(&["Pn", "Pg"]), &strings(&["Sg"]));
        let phases = filtered.phases_of(ev_id);
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].phase_type, "P");
        assert_eq!(phases[0].time, pn.time);
    }

    #[test]
    fn test_filter_discards_unknown_types() {
        let mut cat = Catalog::new();
        let sta = test_station("CH", "STA1");
        cat.add_station(sta.clone());
        let ev_id = cat.add_event(&test_event(0, 46.5, 8.5, 5.0));
        cat.add_phase(test_phase(ev_id, &sta.id, "AML"));

        let filtered = filter_phases(&cat, &strings(&["P"]), &strings(&["S"]));
        assert!(filtered.phases_of(ev_id).is_empty());
    }

    #[test]
    fn test_merge_reassigns_ids() {
        let mut background = Catalog::new();
        background.add_station(test_station("CH", "STA1"));
        background.add_event(&test_event(0, 46.0, 8.0, 5.0));

        let mut single = Catalog::new();
        let sta_id = single.add_station(test_station("CH", "STA2"));
        let mut target = test_event(0, 46.2, 8.2, 7.0);
        target.time = target.time + hifitime::Duration::from_seconds(3600.0);
        let target_id = single.add_event(&target);
        single.add_phase(test_phase(target_id, &sta_id, "P"));

        let merged = background.merge(&single, false).unwrap();
        let target = single.event(target_id).unwrap();
        let found = merged.search_event(target).unwrap();
        assert_eq!(found.id, 2);
        assert_eq!(merged.phases_of(found.id).len(), 1);
        assert_eq!(merged.phases_of(found.id)[0].event_id, found.id);
    }

    #[test]
    fn test_extract_event() {
        let mut cat = Catalog::new();
        let sta_id = cat.add_station(test_station("CH", "STA1"));
        let ev_id = cat.add_event(&test_event(0, 46.0, 8.0, 5.0));
        cat.add_phase(test_phase(ev_id, &sta_id, "P"));

        let extracted = cat.extract_event(ev_id, true).unwrap();
        assert_eq!(extracted.events().len(), 1);
        assert_eq!(extracted.phases_of(ev_id).len(), 1);
        assert!(extracted.stations().contains_key(&sta_id));

        assert!(cat.extract_event(99, true).is_err());
    }

    #[test]
    fn test_remove_phase() {
        let mut cat = Catalog::new();
        let sta_id = cat.add_station(test_station("CH", "STA1"));
        let ev_id = cat.add_event(&test_event(0, 46.0, 8.0, 5.0));
        cat.add_phase(test_phase(ev_id, &sta_id, "P"));
        cat.add_phase(test_phase(ev_id, &sta_id, "S"));

        cat.remove_phase(ev_id, &sta_id, "P");
        let phases = cat.phases_of(ev_id);
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].phase_type, "S");
    }

    #[test]
    fn test_travel_time_zero_is_allowed() {
        let mut cat = Catalog::new();
        let sta_id = cat.add_station(test_station("CH", "STA1"));
        let ev_id = cat.add_event(&test_event(0, 46.0, 8.0, 5.0));
        let mut phase = test_phase(ev_id, &sta_id, "P");
        phase.time = cat.event(ev_id).unwrap().time;
        assert_eq!(phase.travel_time(cat.event(ev_id).unwrap()), 0.0);
    }

    #[test]
    fn test_compute_pick_weight_classes() {
        assert_eq!(compute_pick_weight(0.0), 1.0);
        assert_eq!(compute_pick_weight(0.025), 1.0);
        assert_eq!(compute_pick_weight(0.03), 0.8);
        assert_eq!(compute_pick_weight(0.1), 0.6);
        assert_eq!(compute_pick_weight(0.15), 0.4);
        assert_eq!(compute_pick_weight(0.3), 0.2);
        assert_eq!(compute_pick_weight(2.0), 0.1);
    }
}
