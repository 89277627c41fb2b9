//! Driver for the external double-difference solver and its ph2dt
//! companion.
//!
//! Both programs are controlled exclusively through fixed-format ASCII
//! files in a working directory: the driver renders the input files,
//! launches the executable as a blocking subprocess with stdout/stderr
//! captured to a log file, and parses `hypoDD.reloc` / `hypoDD.res` back
//! into the catalog. A non-zero exit status is logged but not fatal; the
//! presence and content of `hypoDD.reloc` is the authoritative success
//! signal.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};

use camino::Utf8Path;
use hifitime::Epoch;
use log::{debug, error, info, warn};

use crate::catalog::{Catalog, EventId, EventRelocInfo, PhaseRelocInfo};
use crate::relodd_errors::{ReloddError, ReloddResult};

/// Write `station.dat`: one `id lat lon elevation_m` line per station.
pub fn write_station_dat(catalog: &Catalog, file: &Utf8Path) -> ReloddResult<()> {
    info!("Creating station file {}", file);

    let mut out = fs::File::create(file)?;
    for station in catalog.stations().values() {
        writeln!(
            out,
            "{:<12} {:12.6} {:12.6} {:12.0}",
            station.id, station.latitude, station.longitude, station.elevation
        )?;
    }
    Ok(())
}

/// Write `event.dat`: one `DATE TIME LAT LON DEP MAG EH EV RMS ID` line
/// per event; the TIME field packs `hhmmsscc` with centiseconds.
pub fn write_event_dat(catalog: &Catalog, file: &Utf8Path) -> ReloddResult<()> {
    info!("Creating event file {}", file);

    let mut out = fs::File::create(file)?;
    for event in catalog.events().values() {
        let (year, month, day, hour, minute, second, nanos) = event.time.to_gregorian_utc();
        let centisec_field = u32::from(second) * 100 + nanos / 10_000_000;
        writeln!(
            out,
            "{}{:02}{:02}  {:02}{:02}{:04} {:.6} {:.6} {:.3} {:.2} {:.4} {:.4} {:.4} {}",
            year,
            month,
            day,
            hour,
            minute,
            centisec_field,
            event.latitude,
            event.longitude,
            event.depth,
            event.magnitude,
            event.horiz_err,
            event.vert_err,
            event.rms,
            event.id
        )?;
    }
    Ok(())
}

/// Write `phase.dat` for ph2dt: an event header followed by its
/// travel-time observations.
pub fn write_phase_dat(catalog: &Catalog, file: &Utf8Path) -> ReloddResult<()> {
    info!("Creating phase file {}", file);

    let mut out = fs::File::create(file)?;
    for event in catalog.events().values() {
        let (year, month, day, hour, minute, second, nanos) = event.time.to_gregorian_utc();
        writeln!(
            out,
            "# {} {} {} {} {} {:.2} {:.6} {:.6} {:.3} {:.2} {:.4} {:.4} {:.4} {}",
            year,
            month,
            day,
            hour,
            minute,
            f64::from(second) + f64::from(nanos) / 1e9,
            event.latitude,
            event.longitude,
            event.depth,
            event.magnitude,
            event.horiz_err,
            event.vert_err,
            event.rms,
            event.id
        )?;

        for phase in catalog.phases_of(event.id) {
            let travel_time = phase.travel_time(event);
            if travel_time < 0.0 {
                debug!("Ignoring {} with negative travel time ({})", phase, event);
                continue;
            }
            writeln!(
                out,
                "{:<12} {:12.6} {:5.2} {:>4}",
                phase.station_id, travel_time, phase.weight, phase.phase_type
            )?;
        }
    }
    Ok(())
}

/// Copy a control-file template replacing selected non-comment lines.
///
/// Line numbers count only lines not starting with `comment`; each
/// replacement is consumed on first use.
pub fn copy_file_and_replace_lines(
    src: &Utf8Path,
    dest: &Utf8Path,
    mut lines_to_replace: BTreeMap<usize, String>,
    comment: &str,
) -> ReloddResult<()> {
    if !src.exists() {
        return Err(ReloddError::MissingFile(src.to_owned()));
    }
    let content = fs::read_to_string(src)?;
    let mut out = fs::File::create(dest)?;

    let mut line_num = 0usize;
    for line in content.lines() {
        if !line.starts_with(comment) {
            line_num += 1;
        }
        match lines_to_replace.remove(&line_num) {
            Some(replacement) => writeln!(out, "{}", replacement)?,
            None => writeln!(out, "{}", line)?,
        }
    }
    Ok(())
}

/// Launch `exec arg` in `working_dir`, blocking until it terminates, with
/// stdout and stderr appended to `output_file` in the same directory.
pub fn run_process(
    exec: &str,
    arg: &str,
    working_dir: &Utf8Path,
    output_file: &str,
) -> ReloddResult<()> {
    info!("Working directory {}", working_dir);
    info!("Executing command: {} {}", exec, arg);

    let stdout = fs::File::create(working_dir.join(output_file))?;
    let stderr = stdout.try_clone()?;
    let status = Command::new(exec)
        .arg(arg)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()?;

    if !status.success() {
        error!("Command exited with non zero value ({})", status);
    }
    Ok(())
}

fn file_name_of(path: &Utf8Path) -> String {
    path.file_name().unwrap_or_default().to_string()
}

/// Render `hypoDD.inp` from the control-file template and run the solver.
///
/// The template's first 9 non-comment lines name the input/output files;
/// a leading `hypoDD_2` marker line shifts the replacements by one.
#[allow(clippy::too_many_arguments)]
pub fn run_hypodd(
    working_dir: &Utf8Path,
    dtcc_file: &Utf8Path,
    dtct_file: &Utf8Path,
    event_file: &Utf8Path,
    station_file: &Utf8Path,
    ctrl_file: &Utf8Path,
    exec: &str,
) -> ReloddResult<()> {
    info!("Running hypodd...");

    for file in [dtcc_file, dtct_file, event_file, station_file, ctrl_file] {
        if !file.exists() {
            return Err(ReloddError::MissingFile(file.to_owned()));
        }
    }

    let line_offset = match fs::read_to_string(ctrl_file)?.lines().next() {
        Some("hypoDD_2") => 1,
        _ => 0,
    };

    let lines_to_replace = BTreeMap::from([
        (line_offset + 1, file_name_of(dtcc_file)),
        (line_offset + 2, file_name_of(dtct_file)),
        (line_offset + 3, file_name_of(event_file)),
        (line_offset + 4, file_name_of(station_file)),
        (line_offset + 5, "hypoDD.loc".to_string()),
        (line_offset + 6, "hypoDD.reloc".to_string()),
        (line_offset + 7, "hypoDD.sta".to_string()),
        (line_offset + 8, "hypoDD.res".to_string()),
        (line_offset + 9, "hypoDD.src".to_string()),
    ]);
    copy_file_and_replace_lines(
        ctrl_file,
        &working_dir.join("hypoDD.inp"),
        lines_to_replace,
        "*",
    )?;

    run_process(exec, "hypoDD.inp", working_dir, "hypoDD.out")
}

/// Render `ph2dt.inp` and run the ph2dt preprocessor.
pub fn run_ph2dt(
    working_dir: &Utf8Path,
    station_file: &Utf8Path,
    phase_file: &Utf8Path,
    ctrl_file: &Utf8Path,
    exec: &str,
) -> ReloddResult<()> {
    info!("Running ph2dt...");

    for file in [station_file, phase_file, ctrl_file] {
        if !file.exists() {
            return Err(ReloddError::MissingFile(file.to_owned()));
        }
    }

    let lines_to_replace = BTreeMap::from([
        (1, file_name_of(station_file)),
        (2, file_name_of(phase_file)),
    ]);
    copy_file_and_replace_lines(
        ctrl_file,
        &working_dir.join("ph2dt.inp"),
        lines_to_replace,
        "*",
    )?;

    run_process(exec, "ph2dt.inp", working_dir, "ph2dt.out")
}

struct RelocLine {
    event_id: EventId,
    latitude: f64,
    longitude: f64,
    depth: f64,
    time: Epoch,
    reloc_info: EventRelocInfo,
}

fn parse_reloc_line(fields: &[&str]) -> Option<RelocLine> {
    let f = |idx: usize| fields[idx].parse::<f64>().ok();
    let u = |idx: usize| fields[idx].parse::<u32>().ok();

    let seconds = f(15)?;
    let time = Epoch::from_gregorian_utc(
        fields[10].parse().ok()?,
        fields[11].parse().ok()?,
        fields[12].parse().ok()?,
        fields[13].parse().ok()?,
        fields[14].parse().ok()?,
        seconds as u8,
        (seconds.fract() * 1e9) as u32,
    );

    Some(RelocLine {
        event_id: u(0)?,
        latitude: f(1)?,
        longitude: f(2)?,
        depth: f(3)?,
        time,
        reloc_info: EventRelocInfo {
            lon_uncertainty: f(7)? / 1000.0,
            lat_uncertainty: f(8)? / 1000.0,
            depth_uncertainty: f(9)? / 1000.0,
            num_ccp: u(17)?,
            num_ccs: u(18)?,
            num_ctp: u(19)?,
            num_cts: u(20)?,
            rms_residual_cc: f(21)?,
            rms_residual_ct: f(22)?,
        },
    })
}

/// Rebuild a catalog from the solver output.
///
/// `hypoDD.reloc` is whitespace-separated free format, 24 fields per
/// line; the events found there are updated with their new hypocenter,
/// recomputed origin time and relocation block (uncertainties arrive in
/// meters and are stored in km). When `hypoDD.res` exists its per-pair
/// residuals are averaged onto the phases.
pub fn load_relocated_catalog(
    original: &Catalog,
    reloc_file: &Utf8Path,
    residual_file: &Utf8Path,
) -> ReloddResult<Catalog> {
    info!("Loading catalog relocated by hypodd...");

    if !reloc_file.exists() {
        return Err(ReloddError::MissingFile(reloc_file.to_owned()));
    }

    let mut catalog = original.clone();

    for row in fs::read_to_string(reloc_file)?.lines() {
        let fields: Vec<&str> = row.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let parsed = if fields.len() == 24 {
            parse_reloc_line(&fields)
        } else {
            None
        };
        let Some(line) = parsed else {
            warn!(
                "Skipping unrecognized line from '{}' (line='{}')",
                reloc_file, row
            );
            continue;
        };

        let event = catalog.events_mut().get_mut(&line.event_id).ok_or_else(|| {
            ReloddError::MalformedCatalog(format!(
                "cannot find relocated event {} in the original catalog",
                line.event_id
            ))
        })?;

        event.latitude = line.latitude;
        event.longitude = line.longitude;
        event.depth = line.depth;
        event.time = line.time;

        let ri = line.reloc_info;
        let num_ct = ri.num_ctp + ri.num_cts;
        let num_cc = ri.num_ccp + ri.num_ccs;
        event.rms = if num_ct > 0 && num_cc > 0 {
            (ri.rms_residual_cc + ri.rms_residual_ct) / 2.0
        } else if num_ct > 0 {
            ri.rms_residual_ct
        } else if num_cc > 0 {
            ri.rms_residual_cc
        } else {
            0.0
        };
        event.reloc_info = Some(ri);
    }

    if residual_file.exists() {
        apply_residuals(&mut catalog, residual_file)?;
    }

    Ok(catalog)
}

/// Average the solver residuals and final weights onto the phases.
///
/// `hypoDD.res` has 9 whitespace fields; field 4 encodes the data type
/// (1: ccP, 2: ccS, 3: ctP, 4: ctS), field 6 the residual in ms.
fn apply_residuals(catalog: &mut Catalog, residual_file: &Utf8Path) -> ReloddResult<()> {
    #[derive(Default)]
    struct Aggregate {
        residuals: f64,
        weights: f64,
        count: usize,
    }
    let mut aggregates: BTreeMap<(EventId, String, String), Aggregate> = BTreeMap::new();

    for row in fs::read_to_string(residual_file)?.lines() {
        let fields: Vec<&str> = row.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 9 {
            warn!(
                "Skipping unrecognized line from '{}' (line='{}')",
                residual_file, row
            );
            continue;
        }

        let station_id = fields[0];
        let parsed = (
            fields[2].parse::<EventId>(),
            fields[3].parse::<EventId>(),
            fields[6].parse::<f64>(),
            fields[7].parse::<f64>(),
        );
        let (Ok(ev1), Ok(ev2), Ok(residual_ms), Ok(final_weight)) = parsed else {
            warn!(
                "Skipping unrecognized line from '{}' (line='{}')",
                residual_file, row
            );
            continue;
        };
        let phase_type = match fields[4] {
            "1" | "3" => "P",
            "2" | "4" => "S",
            _ => {
                warn!(
                    "Skipping unrecognized line from '{}' (line='{}')",
                    residual_file, row
                );
                continue;
            }
        };

        let residual = residual_ms / 1000.0;
        for event_id in [ev1, ev2] {
            let agg = aggregates
                .entry((event_id, station_id.to_string(), phase_type.to_string()))
                .or_default();
            agg.residuals += residual;
            agg.weights += final_weight;
            agg.count += 1;
        }
    }

    for phases in catalog.phases_mut().values_mut() {
        for phase in phases.iter_mut() {
            let key = (
                phase.event_id,
                phase.station_id.clone(),
                phase.phase_type.clone(),
            );
            if let Some(agg) = aggregates.get(&key) {
                phase.reloc_info = Some(PhaseRelocInfo {
                    residual: agg.residuals / agg.count as f64,
                    final_weight: agg.weights / agg.count as f64,
                });
            }
        }
    }

    Ok(())
}
