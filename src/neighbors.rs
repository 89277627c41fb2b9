//! Neighboring-event selection.
//!
//! For a reference event the selector picks a bounded set of nearby events
//! that share enough usable picks with it, then homogenizes the sampling
//! geometrically: candidates are consumed nearest-first from concentric
//! ellipsoidal layers split into 8 quadrants, so no azimuth or distance
//! range dominates the double-difference system (Waldhauser 2009).

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use ordered_float::NotNan;

use crate::catalog::{Catalog, Event, EventId};
use crate::config::SelectionConfig;
use crate::ellipsoid::Ellipsoid;
use crate::geodesy::{event_distance, station_distance};
use crate::relodd_errors::{ReloddError, ReloddResult};

/// Select at most `max_num_neigh` neighbors of `ref_ev`.
///
/// Arguments
/// ---------
/// * `catalog`: the background catalog, `ref_ev` included or not
/// * `ref_ev`: the reference event the neighbors are picked around
/// * `cfg`: distance/phase constraints and shell geometry
///
/// Return
/// ------
/// * A catalog holding the selected neighbors (without `ref_ev` itself),
///   their phases trimmed to the `max_dt_per_evt` nearest stations.
///   Fails with [`ReloddError::InsufficientNeighbors`] when fewer than
///   `min_num_neigh` events survive; that error is event-scoped and
///   callers iterating a whole catalog skip the event and continue.
pub fn select_neighboring_events(
    catalog: &Catalog,
    ref_ev: &Event,
    cfg: &SelectionConfig,
) -> ReloddResult<Catalog> {
    debug!("Selecting neighbouring events for {}", ref_ev);

    let mut src_cat = catalog.clone();

    // events within the inter-event distance limit
    let mut distance_by_event: BTreeMap<EventId, f64> = BTreeMap::new();
    for event in src_cat.events().values() {
        if event.id == ref_ev.id && event.same_hypocenter(ref_ev) {
            continue;
        }
        let (distance, _, _) = event_distance(ref_ev, event);
        if cfg.max_ie_dist > 0.0 && distance > cfg.max_ie_dist {
            continue;
        }
        distance_by_event.insert(event.id, distance);
    }

    // among those, keep events sharing enough usable picks with ref_ev
    let mut selected: BTreeSet<(NotNan<f64>, EventId)> = BTreeSet::new();
    let mut included_stations: BTreeSet<String> = BTreeSet::new();
    let mut excluded_stations: BTreeSet<String> = BTreeSet::new();

    for (&event_id, &event_dist) in &distance_by_event {
        let event = src_cat
            .event(event_id)
            .cloned()
            .ok_or(ReloddError::EventNotFound(event_id))?;

        // matching picks by station distance, nearest first
        let mut station_by_distance: BTreeSet<(NotNan<f64>, (String, String))> = BTreeSet::new();
        let mut dt_count = 0usize;

        for phase in src_cat.phases_of(event_id) {
            if phase.weight < cfg.min_weight {
                continue;
            }

            let station = src_cat.stations().get(&phase.station_id).ok_or_else(|| {
                ReloddError::MalformedCatalog(format!(
                    "cannot find station '{}' referenced by {} for {}",
                    phase.station_id, phase, event
                ))
            })?;

            if excluded_stations.contains(&station.id) {
                continue;
            }

            if !included_stations.contains(&station.id) {
                // distance between the station and the reference event
                let (ref_sta_dist, _, _) = station_distance(ref_ev, station);
                if (cfg.max_es_dist > 0.0 && ref_sta_dist > cfg.max_es_dist)
                    || ref_sta_dist < cfg.min_es_dist
                {
                    excluded_stations.insert(station.id.clone());
                    continue;
                }
                if ref_sta_dist / event_dist < cfg.min_es_to_ie_ratio {
                    // depends on the current event, cannot be memoized
                    continue;
                }
                included_stations.insert(station.id.clone());
            }

            // same constraints for the candidate event itself
            let (sta_dist, _, _) = station_distance(&event, station);
            if (cfg.max_es_dist > 0.0 && sta_dist > cfg.max_es_dist)
                || sta_dist < cfg.min_es_dist
                || sta_dist / event_dist < cfg.min_es_to_ie_ratio
            {
                continue;
            }

            // ref_ev must have a usable matching pick for the same slot
            let matching = src_cat
                .search_phase(ref_ev.id, &phase.station_id, &phase.phase_type)
                .map(|ref_phase| ref_phase.weight >= cfg.min_weight)
                .unwrap_or(false);
            if matching {
                if let Ok(dist) = NotNan::new(sta_dist) {
                    dt_count += 1;
                    station_by_distance
                        .insert((dist, (phase.station_id.clone(), phase.phase_type.clone())));
                }
            }
        }

        if dt_count < cfg.min_dt_per_evt {
            continue;
        }

        // too many observations: drop the picks of the furthest stations
        if cfg.max_dt_per_evt > 0 && dt_count > cfg.max_dt_per_evt {
            for (_, (station_id, phase_type)) in
                station_by_distance.iter().skip(cfg.max_dt_per_evt)
            {
                src_cat.remove_phase(event_id, station_id, phase_type);
            }
        }

        if let Ok(dist) = NotNan::new(event_dist) {
            selected.insert((dist, event_id));
        }
    }

    // concentric shells, largest first, ending with a degenerate point
    let mut ellipsoids = Vec::with_capacity(cfg.num_ellipsoids);
    let mut curr_size = cfg.max_ellipsoid_size;
    for _ in 0..cfg.num_ellipsoids.saturating_sub(1) {
        ellipsoids.push(Ellipsoid::with_axis_len(
            curr_size,
            ref_ev.latitude,
            ref_ev.longitude,
            ref_ev.depth,
        ));
        curr_size /= 2.0;
    }
    ellipsoids.push(Ellipsoid::with_axis_len(
        0.0,
        ref_ev.latitude,
        ref_ev.longitude,
        ref_ev.depth,
    ));

    // sweep the annuli from the innermost outward, taking for each
    // quadrant the closest remaining candidate, until the quota is filled
    let mut neighboring_cat = Catalog::new();
    let mut num_neighbors = 0usize;
    let mut work_to_do = true;
    while work_to_do {
        let before = selected.len();
        'shells: for elps_num in (0..ellipsoids.len()).rev() {
            for quadrant in 1..=8u8 {
                if selected.is_empty()
                    || (cfg.max_num_neigh > 0 && num_neighbors >= cfg.max_num_neigh)
                {
                    work_to_do = false;
                    break 'shells;
                }

                let mut chosen = None;
                for key in &selected {
                    let ev = src_cat
                        .event(key.1)
                        .ok_or(ReloddError::EventNotFound(key.1))?;
                    let found = if elps_num == 0 {
                        ellipsoids[0].is_outside_quadrant(
                            ev.latitude,
                            ev.longitude,
                            ev.depth,
                            quadrant,
                        )
                    } else {
                        ellipsoids[elps_num].is_outside_quadrant(
                            ev.latitude,
                            ev.longitude,
                            ev.depth,
                            quadrant,
                        ) && ellipsoids[elps_num - 1].is_inside_quadrant(
                            ev.latitude,
                            ev.longitude,
                            ev.depth,
                            quadrant,
                        )
                    };
                    if found {
                        chosen = Some(*key);
                        break;
                    }
                }

                if let Some(key) = chosen {
                    let ev = src_cat
                        .event(key.1)
                        .cloned()
                        .ok_or(ReloddError::EventNotFound(key.1))?;
                    debug!(
                        "Chose neighbour {} ellipsoid {} quadrant {} distance {:.1}",
                        ev,
                        elps_num,
                        quadrant,
                        key.0.into_inner()
                    );
                    neighboring_cat.copy_event(&ev, &src_cat, true)?;
                    num_neighbors += 1;
                    selected.remove(&key);
                }
            }
        }
        if work_to_do && selected.len() == before {
            debug!("No candidate matched any shell/quadrant, stopping selection");
            break;
        }
    }

    if num_neighbors < cfg.min_num_neigh {
        return Err(ReloddError::InsufficientNeighbors(
            ref_ev.to_string(),
            num_neighbors,
        ));
    }

    Ok(neighboring_cat)
}

/// Neighbor sets for every event of the catalog, deduplicated so each
/// unordered event pair appears in exactly one set.
///
/// Events with too few neighbors are skipped; each returned catalog also
/// contains its reference event.
pub fn select_neighbors_catalog(
    catalog: &Catalog,
    cfg: &SelectionConfig,
) -> ReloddResult<BTreeMap<EventId, Catalog>> {
    let mut neighbors_by_event: BTreeMap<EventId, Catalog> = BTreeMap::new();

    for event in catalog.events().values() {
        match select_neighboring_events(catalog, event, cfg) {
            Ok(mut neighbor_cat) => {
                neighbor_cat.copy_event(event, catalog, true)?;
                neighbors_by_event.insert(event.id, neighbor_cat);
            }
            Err(err @ ReloddError::InsufficientNeighbors(..)) => {
                debug!("{}", err);
            }
            Err(err) => return Err(err),
        }
    }

    // pair eventXX-eventYY equals pair eventYY-eventXX: drop pairs that
    // already appeared in an earlier neighbor set
    let mut existing_pairs: BTreeMap<EventId, Vec<EventId>> = BTreeMap::new();
    for (&curr_id, curr_cat) in neighbors_by_event.iter_mut() {
        if let Some(duplicates) = existing_pairs.get(&curr_id) {
            for id in duplicates {
                curr_cat.remove_event(*id);
            }
        }
        for &other_id in curr_cat.events().keys() {
            if other_id != curr_id {
                existing_pairs.entry(other_id).or_default().push(curr_id);
            }
        }
    }

    Ok(neighbors_by_event)
}
