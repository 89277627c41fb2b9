use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use hifitime::{Duration, Epoch};

use relodd::catalog::{Catalog, Event, EventId, Phase, Station};
use relodd::config::{Config, SelectionConfig, SnrConfig, WfFilterConfig};
use relodd::inventory::{Inventory, SensorComponent, SensorLocation};
use relodd::relodd_errors::ReloddResult;
use relodd::time::TimeWindow;
use relodd::waveform::{Trace, WaveformSource};

/// Inventory with a single well-oriented ZNE sensor for every station.
pub struct MockInventory;

impl Inventory for MockInventory {
    fn sensor_location(
        &self,
        _network: &str,
        _station: &str,
        _location: &str,
        _at_time: Epoch,
    ) -> Option<SensorLocation> {
        let component = |code: &str, azimuth: f64, dip: f64| SensorComponent {
            code: code.to_string(),
            azimuth,
            dip,
        };
        Some(SensorLocation {
            latitude: 46.8,
            longitude: 8.5,
            elevation: 500.0,
            components: vec![
                component("HHZ", 0.0, -90.0),
                component("HHN", 0.0, 0.0),
                component("HHE", 90.0, 0.0),
            ],
        })
    }
}

/// Waveform source with no data at all; every request ends up excluded.
pub struct SilentSource;

impl WaveformSource for SilentSource {
    fn query(
        &self,
        _network: &str,
        _station: &str,
        _location: &str,
        _channel: &str,
        _tw: &TimeWindow,
    ) -> ReloddResult<Vec<Trace>> {
        Ok(Vec::new())
    }
}

pub fn t0() -> Epoch {
    Epoch::from_gregorian_utc(2021, 3, 1, 10, 0, 0, 0)
}

pub fn test_station(catalog: &mut Catalog) -> String {
    catalog.add_station(Station {
        id: String::new(),
        latitude: 46.8,
        longitude: 8.5,
        elevation: 500.0,
        network_code: "CH".to_string(),
        station_code: "STA1".to_string(),
        location_code: String::new(),
    })
}

pub fn add_event(
    catalog: &mut Catalog,
    station_id: &str,
    time: Epoch,
    lat: f64,
    lon: f64,
    depth: f64,
    travel_time: f64,
) -> EventId {
    let id = catalog.add_event(&Event {
        id: 0,
        time,
        latitude: lat,
        longitude: lon,
        depth,
        magnitude: 1.8,
        horiz_err: 0.1,
        vert_err: 0.1,
        rms: 0.02,
        reloc_info: None,
    });
    catalog.add_phase(Phase {
        event_id: id,
        station_id: station_id.to_string(),
        time: time + Duration::from_seconds(travel_time),
        weight: 1.0,
        phase_type: "P".to_string(),
        network_code: "CH".to_string(),
        station_code: "STA1".to_string(),
        location_code: String::new(),
        channel_code: "HHZ".to_string(),
        is_manual: true,
        reloc_info: None,
    });
    id
}

/// A `/bin/sh` stand-in for the solver executable.
///
/// It reads `event.dat` from the working directory and writes a
/// `hypoDD.reloc` in which every event moved by +0.001° lat, +0.002° lon
/// and +0.5 km depth, with fixed uncertainties and residuals. When the
/// rendered control file carries a `STEP2` marker the output is left
/// empty, so no event counts as relocated. Every invocation appends to
/// `run_count.txt`.
pub fn write_mock_solver(dir: &Utf8Path) -> Utf8PathBuf {
    let script = dir.join("mock_hypodd.sh");
    fs::write(
        &script,
        r#"#!/bin/sh
echo run >> run_count.txt
: > hypoDD.res
if grep -q STEP2 hypoDD.inp; then
    : > hypoDD.reloc
else
    awk '{
        date=$1; time=$2;
        lat=$3+0.001; lon=$4+0.002; dep=$5+0.5;
        yr=substr(date,1,4)+0; mo=substr(date,5,2)+0; dy=substr(date,7,2)+0;
        hr=substr(time,1,2)+0; mi=substr(time,3,2)+0;
        sc=substr(time,5,2)"."substr(time,7,2);
        print $10, lat, lon, dep, 0, 0, 0, 100, 100, 100, \
              yr, mo, dy, hr, mi, sc, $6, 1, 1, 2, 2, 0.01, 0.03, 1
    }' event.dat > hypoDD.reloc
fi
"#,
    )
    .unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).unwrap();
    script
}

/// Control-file template with the expected 9 replaceable lines and a
/// marker comment the mock solver can branch on.
pub fn write_control_file(dir: &Utf8Path, name: &str, marker: &str) -> Utf8PathBuf {
    let file = dir.join(name);
    fs::write(
        &file,
        format!(
            "* {marker}\n\
             dt.cc.template\n\
             dt.ct.template\n\
             event.template\n\
             station.template\n\
             loc.template\n\
             reloc.template\n\
             sta.template\n\
             res.template\n\
             src.template\n\
             100 100 1.0\n"
        ),
    )
    .unwrap();
    file
}

fn loose_selection() -> SelectionConfig {
    SelectionConfig {
        min_weight: 0.0,
        min_es_dist: 0.0,
        max_es_dist: -1.0,
        min_es_to_ie_ratio: 0.0,
        max_ie_dist: -1.0,
        min_dt_per_evt: 1,
        max_dt_per_evt: 0,
        min_num_neigh: 1,
        max_num_neigh: 0,
        num_ellipsoids: 5,
        max_ellipsoid_size: 8.0,
    }
}

/// Engine configuration pointing at the mock solver, with waveform
/// processing and cleanup turned off.
pub fn test_config(dir: &Utf8Path) -> Config {
    let solver = write_mock_solver(dir);
    let step1 = write_control_file(dir, "hypoDD-step1.ctrl", "STEP1");
    let step2 = write_control_file(dir, "hypoDD-step2.ctrl", "STEP2");

    let mut cfg = Config {
        valid_p_phases: vec!["P".to_string(), "Pg".to_string()],
        valid_s_phases: vec!["S".to_string(), "Sg".to_string()],
        dtct: loose_selection(),
        dtcc: loose_selection(),
        use_catalog_disk_cache: false,
        working_dir_cleanup: false,
        ..Config::default()
    };
    cfg.snr = SnrConfig {
        min_snr: 0.0,
        ..SnrConfig::default()
    };
    cfg.wf_filter = WfFilterConfig {
        filter_string: String::new(),
        resample_freq: 0.0,
        dump: false,
    };
    cfg.hypodd.exec = solver.to_string();
    cfg.hypodd.step1_ctrl_file = step1;
    cfg.hypodd.step2_ctrl_file = step2;
    cfg
}

pub fn mock_services() -> (Arc<MockInventory>, Arc<SilentSource>) {
    (Arc::new(MockInventory), Arc::new(SilentSource))
}
