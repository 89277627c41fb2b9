//! Plain CSV persistence for catalogs.
//!
//! Every relocation step dumps its starting and relocated catalog next to
//! the solver files, which makes reruns and debugging reproducible without
//! the upstream data services. The format is a flat comma-separated table
//! with a header line; none of the values may contain a comma.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::Utf8Path;
use log::info;

use crate::catalog::{
    Catalog, Event, EventId, EventRelocInfo, Phase, PhaseRelocInfo, Station,
};
use crate::relodd_errors::{ReloddError, ReloddResult};
use crate::time::{parse_iso, to_iso_string};

impl Catalog {
    /// Write the catalog as three CSV files (events, phases, stations).
    pub fn write_to_csv(
        &self,
        event_file: &Utf8Path,
        phase_file: &Utf8Path,
        station_file: &Utf8Path,
    ) -> ReloddResult<()> {
        info!("Writing catalog to {}", event_file);

        let mut out = fs::File::create(event_file)?;
        writeln!(
            out,
            "id,isotime,latitude,longitude,depth,magnitude,horizErr,vertErr,rms,\
             relocated,latUnc,lonUnc,depthUnc,numCCp,numCCs,numCTp,numCTs,rmsCC,rmsCT"
        )?;
        for event in self.events().values() {
            write!(
                out,
                "{},{},{:.6},{:.6},{:.4},{:.2},{:.4},{:.4},{:.4}",
                event.id,
                to_iso_string(event.time),
                event.latitude,
                event.longitude,
                event.depth,
                event.magnitude,
                event.horiz_err,
                event.vert_err,
                event.rms
            )?;
            match &event.reloc_info {
                Some(ri) => writeln!(
                    out,
                    ",true,{:.4},{:.4},{:.4},{},{},{},{},{:.4},{:.4}",
                    ri.lat_uncertainty,
                    ri.lon_uncertainty,
                    ri.depth_uncertainty,
                    ri.num_ccp,
                    ri.num_ccs,
                    ri.num_ctp,
                    ri.num_cts,
                    ri.rms_residual_cc,
                    ri.rms_residual_ct
                )?,
                None => writeln!(out, ",false,,,,,,,,,")?,
            }
        }

        let mut out = fs::File::create(phase_file)?;
        writeln!(
            out,
            "eventId,stationId,isotime,weight,type,networkCode,stationCode,\
             locationCode,channelCode,evalMode,usedInReloc,residual,finalWeight"
        )?;
        for phases in self.phases().values() {
            for ph in phases {
                write!(
                    out,
                    "{},{},{},{:.2},{},{},{},{},{},{}",
                    ph.event_id,
                    ph.station_id,
                    to_iso_string(ph.time),
                    ph.weight,
                    ph.phase_type,
                    ph.network_code,
                    ph.station_code,
                    ph.location_code,
                    ph.channel_code,
                    if ph.is_manual { "manual" } else { "automatic" }
                )?;
                match &ph.reloc_info {
                    Some(ri) => {
                        writeln!(out, ",true,{:.4},{:.2}", ri.residual, ri.final_weight)?
                    }
                    None => writeln!(out, ",false,,")?,
                }
            }
        }

        let mut out = fs::File::create(station_file)?;
        writeln!(
            out,
            "id,latitude,longitude,elevation,networkCode,stationCode,locationCode"
        )?;
        for sta in self.stations().values() {
            writeln!(
                out,
                "{},{:.6},{:.6},{:.1},{},{},{}",
                sta.id,
                sta.latitude,
                sta.longitude,
                sta.elevation,
                sta.network_code,
                sta.station_code,
                sta.location_code
            )?;
        }

        Ok(())
    }

    /// Load a catalog previously written by [`Catalog::write_to_csv`].
    pub fn from_csv_files(
        station_file: &Utf8Path,
        event_file: &Utf8Path,
        phase_file: &Utf8Path,
    ) -> ReloddResult<Catalog> {
        let mut stations = BTreeMap::new();
        for row in read_rows(station_file)? {
            let sta = Station {
                id: row.field("id")?.to_string(),
                latitude: row.parse("latitude")?,
                longitude: row.parse("longitude")?,
                elevation: row.parse("elevation")?,
                network_code: row.field("networkCode")?.to_string(),
                station_code: row.field("stationCode")?.to_string(),
                location_code: row.field("locationCode")?.to_string(),
            };
            stations.insert(sta.id.clone(), sta);
        }

        let mut events = BTreeMap::new();
        for row in read_rows(event_file)? {
            let reloc_info = if row.field("relocated")? == "true" {
                Some(EventRelocInfo {
                    lat_uncertainty: row.parse("latUnc")?,
                    lon_uncertainty: row.parse("lonUnc")?,
                    depth_uncertainty: row.parse("depthUnc")?,
                    num_ccp: row.parse("numCCp")?,
                    num_ccs: row.parse("numCCs")?,
                    num_ctp: row.parse("numCTp")?,
                    num_cts: row.parse("numCTs")?,
                    rms_residual_cc: row.parse("rmsCC")?,
                    rms_residual_ct: row.parse("rmsCT")?,
                })
            } else {
                None
            };
            let ev = Event {
                id: row.parse("id")?,
                time: parse_iso(row.field("isotime")?)?,
                latitude: row.parse("latitude")?,
                longitude: row.parse("longitude")?,
                depth: row.parse("depth")?,
                magnitude: row.parse("magnitude")?,
                horiz_err: row.parse("horizErr")?,
                vert_err: row.parse("vertErr")?,
                rms: row.parse("rms")?,
                reloc_info,
            };
            events.insert(ev.id, ev);
        }

        let mut phases: BTreeMap<EventId, Vec<Phase>> = BTreeMap::new();
        for row in read_rows(phase_file)? {
            let reloc_info = if row.field("usedInReloc")? == "true" {
                Some(PhaseRelocInfo {
                    residual: row.parse("residual")?,
                    final_weight: row.parse("finalWeight")?,
                })
            } else {
                None
            };
            let ph = Phase {
                event_id: row.parse("eventId")?,
                station_id: row.field("stationId")?.to_string(),
                time: parse_iso(row.field("isotime")?)?,
                weight: row.parse("weight")?,
                phase_type: row.field("type")?.to_string(),
                network_code: row.field("networkCode")?.to_string(),
                station_code: row.field("stationCode")?.to_string(),
                location_code: row.field("locationCode")?.to_string(),
                channel_code: row.field("channelCode")?.to_string(),
                is_manual: row.field("evalMode")? == "manual",
                reloc_info,
            };
            phases.entry(ph.event_id).or_default().push(ph);
        }

        let catalog = Catalog::with_content(stations, events, phases);

        // a phase referencing an unknown station or event is a fatal
        // catalog defect, not something to paper over
        for (event_id, phases) in catalog.phases() {
            if !catalog.events().contains_key(event_id) {
                return Err(ReloddError::MalformedCatalog(format!(
                    "phases reference unknown event {}",
                    event_id
                )));
            }
            for ph in phases {
                if !catalog.stations().contains_key(&ph.station_id) {
                    return Err(ReloddError::MalformedCatalog(format!(
                        "cannot find station '{}' referenced by {}",
                        ph.station_id, ph
                    )));
                }
            }
        }

        Ok(catalog)
    }
}

struct CsvRow {
    header: std::rc::Rc<BTreeMap<String, usize>>,
    fields: Vec<String>,
    file: String,
    line: usize,
}

impl CsvRow {
    fn field(&self, name: &str) -> ReloddResult<&str> {
        let idx = self.header.get(name).ok_or_else(|| {
            ReloddError::MalformedCatalog(format!("{}: missing column '{}'", self.file, name))
        })?;
        self.fields.get(*idx).map(String::as_str).ok_or_else(|| {
            ReloddError::MalformedCatalog(format!(
                "{}:{}: missing field '{}'",
                self.file, self.line, name
            ))
        })
    }

    fn parse<T: std::str::FromStr>(&self, name: &str) -> ReloddResult<T> {
        self.field(name)?.parse().map_err(|_| {
            ReloddError::MalformedCatalog(format!(
                "{}:{}: cannot parse field '{}'",
                self.file, self.line, name
            ))
        })
    }
}

fn read_rows(file: &Utf8Path) -> ReloddResult<Vec<CsvRow>> {
    if !file.exists() {
        return Err(ReloddError::MissingFile(file.to_owned()));
    }
    let content = fs::read_to_string(file)?;
    let mut lines = content.lines();

    let header: BTreeMap<String, usize> = match lines.next() {
        Some(line) => line
            .split(',')
            .enumerate()
            .map(|(idx, name)| (name.trim().to_string(), idx))
            .collect(),
        None => BTreeMap::new(),
    };
    let header = std::rc::Rc::new(header);

    Ok(lines
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| CsvRow {
            header: header.clone(),
            fields: line.split(',').map(|f| f.trim().to_string()).collect(),
            file: file.to_string(),
            line: idx + 2,
        })
        .collect())
}

#[cfg(test)]
mod catalog_io_test {
    use camino::Utf8PathBuf;

    use crate::catalog::catalog_test::{test_event, test_station};
    use crate::catalog::{Catalog, Phase};

    #[test]
    fn test_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut cat = Catalog::new();
        let sta_id = cat.add_station(test_station("CH", "STA1"));
        let ev_id = cat.add_event(&test_event(0, 46.5, 8.5, 5.0));
        cat.add_phase(Phase {
            event_id: ev_id,
            station_id: sta_id.clone(),
            time: hifitime::Epoch::from_gregorian_utc(2021, 3, 1, 10, 0, 2, 500_000_000),
            weight: 0.8,
            phase_type: "P".to_string(),
            network_code: "CH".to_string(),
            station_code: "STA1".to_string(),
            location_code: String::new(),
            channel_code: "HHZ".to_string(),
            is_manual: true,
            reloc_info: None,
        });

        let ev_file = base.join("event.csv");
        let ph_file = base.join("phase.csv");
        let sta_file = base.join("station.csv");
        cat.write_to_csv(&ev_file, &ph_file, &sta_file).unwrap();

        let reread = Catalog::from_csv_files(&sta_file, &ev_file, &ph_file).unwrap();
        assert_eq!(reread.events().len(), 1);
        assert_eq!(reread.stations().len(), 1);
        let phases = reread.phases_of(ev_id);
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].station_id, sta_id);
        assert_eq!(phases[0].weight, 0.8);
        assert!(phases[0].is_manual);
        assert_eq!(
            reread.event(ev_id).unwrap().time,
            cat.event(ev_id).unwrap().time
        );
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let missing = Utf8PathBuf::from("/nonexistent/station.csv");
        assert!(Catalog::from_csv_files(&missing, &missing, &missing).is_err());
    }
}
