mod common;

use approx::assert_abs_diff_eq;
use camino::Utf8PathBuf;
use hifitime::Duration;

use relodd::catalog::Catalog;
use relodd::DdEngine;

use common::{add_event, mock_services, t0, test_config, test_station, write_control_file};

fn workspace() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn background_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    let station = test_station(&mut catalog);
    add_event(&mut catalog, &station, t0(), 46.500, 8.500, 5.0, 4.0);
    add_event(
        &mut catalog,
        &station,
        t0() + Duration::from_seconds(120.0),
        46.505,
        8.500,
        5.2,
        4.1,
    );
    add_event(
        &mut catalog,
        &station,
        t0() + Duration::from_seconds(240.0),
        46.510,
        8.501,
        5.4,
        4.2,
    );
    catalog
}

fn single_event_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    let station = test_station(&mut catalog);
    add_event(
        &mut catalog,
        &station,
        t0() + Duration::from_seconds(600.0),
        46.502,
        8.500,
        5.1,
        4.05,
    );
    catalog
}

#[test]
fn test_relocate_catalog_applies_solver_output() {
    let (_guard, dir) = workspace();
    let mut cfg = test_config(&dir);
    // catalog mode renders the step-2 control file; use one the mock
    // solver treats as a normal run
    cfg.hypodd.step2_ctrl_file = write_control_file(&dir, "hypoDD-catalog.ctrl", "CATALOG");

    let (inventory, source) = mock_services();
    let mut engine = DdEngine::new(
        background_catalog(),
        cfg,
        dir.join("work"),
        inventory,
        source,
    )
    .unwrap();

    let relocated = engine.relocate_catalog(true, false).unwrap();

    assert_eq!(relocated.events().len(), 3);
    for (id, event) in relocated.events() {
        let original = engine.catalog().event(*id).unwrap();
        assert!(event.is_relocated(), "event {} not relocated", id);
        assert_abs_diff_eq!(event.latitude, original.latitude + 0.001, epsilon = 1e-9);
        assert_abs_diff_eq!(event.longitude, original.longitude + 0.002, epsilon = 1e-9);
        assert_abs_diff_eq!(event.depth, original.depth + 0.5, epsilon = 1e-9);

        let ri = event.reloc_info.unwrap();
        // 100 m uncertainties arrive as 0.1 km
        assert_abs_diff_eq!(ri.lat_uncertainty, 0.1);
        assert_abs_diff_eq!(ri.depth_uncertainty, 0.1);
        assert_eq!((ri.num_ccp, ri.num_ccs, ri.num_ctp, ri.num_cts), (1, 1, 2, 2));
        // both cc and ct present: the event rms is their mean
        assert_abs_diff_eq!(event.rms, (0.01 + 0.03) / 2.0, epsilon = 1e-9);
    }

    // solver input files were produced in the step directory
    let step_dir = engine.working_dir().join("catalog");
    for file in ["station.dat", "event.dat", "dt.ct", "dt.cc", "hypoDD.inp"] {
        assert!(step_dir.join(file).exists(), "{} missing", file);
    }

    // dt.ct holds each unordered pair exactly once
    let dtct = std::fs::read_to_string(step_dir.join("dt.ct")).unwrap();
    let mut pairs = std::collections::BTreeSet::new();
    for line in dtct.lines().filter(|l| l.starts_with('#')) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (a, b): (u32, u32) = (fields[1].parse().unwrap(), fields[2].parse().unwrap());
        assert!(pairs.insert((a.min(b), a.max(b))), "duplicated pair {:?}", (a, b));
    }
    assert_eq!(pairs.len(), 3);
}

#[test]
fn test_relocate_catalog_force_false_reuses_files() {
    let (_guard, dir) = workspace();
    let mut cfg = test_config(&dir);
    cfg.hypodd.step2_ctrl_file = write_control_file(&dir, "hypoDD-catalog.ctrl", "CATALOG");

    let (inventory, source) = mock_services();
    let mut engine = DdEngine::new(
        background_catalog(),
        cfg,
        dir.join("work"),
        inventory,
        source,
    )
    .unwrap();

    let first = engine.relocate_catalog(false, false).unwrap();
    let second = engine.relocate_catalog(false, false).unwrap();

    // the solver ran exactly once; the second pass reused every file
    let runs = std::fs::read_to_string(engine.working_dir().join("catalog").join("run_count.txt"))
        .unwrap();
    assert_eq!(runs.lines().count(), 1);
    assert_eq!(first.events(), second.events());
}

#[test]
fn test_single_event_falls_back_to_step1() {
    let (_guard, dir) = workspace();
    let cfg = test_config(&dir); // step-2 control carries the STEP2 marker

    let (inventory, source) = mock_services();
    let mut engine = DdEngine::new(
        background_catalog(),
        cfg,
        dir.join("work"),
        inventory,
        source,
    )
    .unwrap();

    let single = single_event_catalog();
    let relocated = engine.relocate_single_event(&single).unwrap();

    // step 2 produced no relocation, so the step-1 result comes back:
    // one perturbation applied to the original location
    assert_eq!(relocated.events().len(), 1);
    let event = relocated.events().values().next().unwrap();
    assert!(event.is_relocated());
    assert_abs_diff_eq!(event.latitude, 46.503, epsilon = 1e-9);
    assert_abs_diff_eq!(event.longitude, 8.502, epsilon = 1e-9);
    assert_abs_diff_eq!(event.depth, 5.6, epsilon = 1e-9);
}

#[test]
fn test_single_event_two_pass_refinement() {
    let (_guard, dir) = workspace();
    let mut cfg = test_config(&dir);
    // both passes succeed this time
    cfg.hypodd.step2_ctrl_file = write_control_file(&dir, "hypoDD-both.ctrl", "REFINE");

    let (inventory, source) = mock_services();
    let mut engine = DdEngine::new(
        background_catalog(),
        cfg,
        dir.join("work"),
        inventory,
        source,
    )
    .unwrap();

    let single = single_event_catalog();
    let relocated = engine.relocate_single_event(&single).unwrap();

    // step 2 restarts from the step-1 hypocenter, so the perturbation is
    // applied twice
    let event = relocated.events().values().next().unwrap();
    assert!(event.is_relocated());
    assert_abs_diff_eq!(event.latitude, 46.504, epsilon = 1e-9);
    assert_abs_diff_eq!(event.longitude, 8.504, epsilon = 1e-9);
    assert_abs_diff_eq!(event.depth, 6.1, epsilon = 1e-9);
}

#[test]
fn test_single_event_fails_when_both_steps_fail() {
    let (_guard, dir) = workspace();
    let mut cfg = test_config(&dir);
    // both control files carry the failure marker
    cfg.hypodd.step1_ctrl_file = write_control_file(&dir, "hypoDD-fail1.ctrl", "STEP2");

    let (inventory, source) = mock_services();
    let mut engine = DdEngine::new(
        background_catalog(),
        cfg,
        dir.join("work"),
        inventory,
        source,
    )
    .unwrap();

    assert!(engine.relocate_single_event(&single_event_catalog()).is_err());
}
