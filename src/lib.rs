pub mod catalog;
pub mod config;
pub mod ellipsoid;
pub mod engine;
pub mod geodesy;
pub mod inventory;
pub mod neighbors;
pub mod relodd_errors;
pub mod solver;
pub mod stats;
pub mod synth;
pub mod time;
pub mod waveform;
pub mod xcorr;

pub use catalog::Catalog;
pub use config::Config;
pub use engine::DdEngine;
pub use relodd_errors::{ReloddError, ReloddResult};

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::RefCell;

    use ahash::AHashMap;
    use hifitime::Epoch;

    use crate::inventory::{Inventory, SensorComponent, SensorLocation};
    use crate::relodd_errors::ReloddResult;
    use crate::time::TimeWindow;
    use crate::waveform::{Trace, WaveformSource};

    /// Serves one long synthetic trace per channel code and counts the
    /// queries, so tests can assert on cache behavior.
    pub(crate) struct MapSource {
        pub traces: AHashMap<String, Trace>,
        pub queries: RefCell<usize>,
    }

    impl MapSource {
        pub fn new(traces: AHashMap<String, Trace>) -> Self {
            MapSource {
                traces,
                queries: RefCell::new(0),
            }
        }
    }

    impl WaveformSource for MapSource {
        fn query(
            &self,
            _network: &str,
            _station: &str,
            _location: &str,
            channel: &str,
            _tw: &TimeWindow,
        ) -> ReloddResult<Vec<Trace>> {
            *self.queries.borrow_mut() += 1;
            Ok(self.traces.get(channel).cloned().into_iter().collect())
        }
    }

    /// Answers every lookup with the same sensor location.
    pub(crate) struct FixedInventory {
        pub location: SensorLocation,
    }

    impl Inventory for FixedInventory {
        fn sensor_location(
            &self,
            _network: &str,
            _station: &str,
            _location: &str,
            _at_time: Epoch,
        ) -> Option<SensorLocation> {
            Some(self.location.clone())
        }
    }

    pub(crate) fn component(code: &str, azimuth: f64, dip: f64) -> SensorComponent {
        SensorComponent {
            code: code.to_string(),
            azimuth,
            dip,
        }
    }

    /// A well-oriented ZNE sensor on the `HH` band.
    pub(crate) fn zne_sensor(latitude: f64, longitude: f64) -> SensorLocation {
        SensorLocation {
            latitude,
            longitude,
            elevation: 500.0,
            components: vec![
                component("HHZ", 0.0, -90.0),
                component("HHN", 0.0, 0.0),
                component("HHE", 90.0, 0.0),
            ],
        }
    }
}
