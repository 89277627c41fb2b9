//! Engine configuration.
//!
//! The defaults mirror a conservative regional-seismicity setup; every
//! deployment overrides at least the solver executables and control files.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Acceptable source labels for P picks, most preferred first.
    pub valid_p_phases: Vec<String>,
    /// Acceptable source labels for S picks, most preferred first.
    pub valid_s_phases: Vec<String>,
    /// Neighbor selection for the catalog-time (dt.ct) pass.
    pub dtct: SelectionConfig,
    /// Neighbor selection for the cross-correlation (dt.cc) pass.
    pub dtcc: SelectionConfig,
    pub xcorr: XcorrSet,
    pub snr: SnrConfig,
    pub wf_filter: WfFilterConfig,
    pub artificial_phases: ArtificialPhasesConfig,
    pub hypodd: HypoddConfig,
    pub ph2dt: Ph2dtConfig,
    /// Keep a disk copy of every catalog waveform under `wfcache/`.
    pub use_catalog_disk_cache: bool,
    /// Purge the working directory (except the waveform cache) on drop.
    pub working_dir_cleanup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            valid_p_phases: vec!["Pg".into(), "P".into(), "Px".into()],
            valid_s_phases: vec!["Sg".into(), "S".into(), "Sx".into()],
            dtct: SelectionConfig::default(),
            dtcc: SelectionConfig::default(),
            xcorr: XcorrSet::default(),
            snr: SnrConfig::default(),
            wf_filter: WfFilterConfig::default(),
            artificial_phases: ArtificialPhasesConfig::default(),
            hypodd: HypoddConfig::default(),
            ph2dt: Ph2dtConfig::default(),
            use_catalog_disk_cache: true,
            working_dir_cleanup: true,
        }
    }
}

/// Constraints driving the neighboring-event selection (§ the dt.ct and
/// dt.cc passes usually differ only in these numbers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Minimum pick weight for a phase to count.
    pub min_weight: f64,
    /// Event-station distance bounds in km.
    pub min_es_dist: f64,
    /// Disabled when <= 0.
    pub max_es_dist: f64,
    /// Minimum station-distance to inter-event-distance ratio.
    pub min_es_to_ie_ratio: f64,
    /// Maximum inter-event distance in km, disabled when <= 0.
    pub max_ie_dist: f64,
    /// Minimum matching station phases per neighbor.
    pub min_dt_per_evt: usize,
    /// Keep only this many nearest-station picks, disabled when 0.
    pub max_dt_per_evt: usize,
    pub min_num_neigh: usize,
    /// Disabled when 0.
    pub max_num_neigh: usize,
    pub num_ellipsoids: usize,
    /// Characteristic size of the largest shell in km.
    pub max_ellipsoid_size: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            min_weight: 0.0,
            min_es_dist: 0.0,
            max_es_dist: -1.0,
            min_es_to_ie_ratio: 0.0,
            max_ie_dist: -1.0,
            min_dt_per_evt: 1,
            max_dt_per_evt: 0,
            min_num_neigh: 1,
            max_num_neigh: 40,
            num_ellipsoids: 5,
            max_ellipsoid_size: 10.0,
        }
    }
}

/// Cross-correlation windows and acceptance threshold for one phase type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct XcorrConfig {
    pub min_coef: f64,
    /// Short-window start relative to the pick, seconds (usually negative).
    pub start_offset: f64,
    /// Short-window end relative to the pick, seconds.
    pub end_offset: f64,
    /// Maximum delay searched on both sides, seconds.
    pub max_delay: f64,
}

impl Default for XcorrConfig {
    fn default() -> Self {
        XcorrConfig {
            min_coef: 0.5,
            start_offset: -0.5,
            end_offset: 0.5,
            max_delay: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct XcorrSet {
    pub p: XcorrConfig,
    pub s: XcorrConfig,
}

impl XcorrSet {
    /// Windows for a canonical phase type ("P" or "S").
    pub fn for_phase(&self, phase_type: &str) -> Option<&XcorrConfig> {
        match phase_type {
            "P" => Some(&self.p),
            "S" => Some(&self.s),
            _ => None,
        }
    }
}

/// Signal-to-noise gate; offsets are seconds relative to the pick time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SnrConfig {
    /// Disabled when <= 0.
    pub min_snr: f64,
    pub noise_start: f64,
    pub noise_end: f64,
    pub signal_start: f64,
    pub signal_end: f64,
}

impl Default for SnrConfig {
    fn default() -> Self {
        SnrConfig {
            min_snr: 2.0,
            noise_start: -3.0,
            noise_end: -0.35,
            signal_start: -0.35,
            signal_end: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WfFilterConfig {
    /// Filter descriptor, e.g. `BP(3,1,20)`; empty disables filtering.
    pub filter_string: String,
    /// Disabled when <= 0.
    pub resample_freq: f64,
    /// Write every processed trace next to its cache file.
    pub dump: bool,
}

impl Default for WfFilterConfig {
    fn default() -> Self {
        WfFilterConfig {
            filter_string: "BP(3,1,20)".to_string(),
            resample_freq: 400.0,
            dump: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtificialPhasesConfig {
    pub enable: bool,
    /// Also replace automatic picks on the reference event.
    pub fix_auto_phase: bool,
    /// Only use donor events within this distance in km.
    pub max_ie_dist: f64,
    /// How many best correlations are averaged into the new pick.
    pub num_cc: usize,
    /// Hard cap on the correlation search window, seconds.
    pub max_cc_tw: f64,
}

impl Default for ArtificialPhasesConfig {
    fn default() -> Self {
        ArtificialPhasesConfig {
            enable: false,
            fix_auto_phase: false,
            max_ie_dist: 3.0,
            num_cc: 2,
            max_cc_tw: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HypoddConfig {
    pub exec: String,
    pub step1_ctrl_file: Utf8PathBuf,
    pub step2_ctrl_file: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Ph2dtConfig {
    pub exec: String,
    pub ctrl_file: Utf8PathBuf,
}
