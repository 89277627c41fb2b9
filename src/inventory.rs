//! Station metadata lookup.
//!
//! The engine never talks to a metadata service directly; it goes through
//! the [`Inventory`] trait so tests can inject a fixed set of sensors.

use hifitime::Epoch;

/// Orientation of one native sensor axis.
///
/// Azimuth is in degrees clockwise from north, dip in degrees down from
/// horizontal (so a vertical component has dip -90).
#[derive(Debug, Clone, PartialEq)]
pub struct SensorComponent {
    pub code: String,
    pub azimuth: f64,
    pub dip: f64,
}

/// The three native components of one sensor, classified by the last
/// letter of their channel codes following the SEED convention:
/// `Z` vertical, `N`/`1` first horizontal, `E`/`2` second horizontal.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreeComponents {
    pub vertical: SensorComponent,
    pub first_horizontal: SensorComponent,
    pub second_horizontal: SensorComponent,
}

impl ThreeComponents {
    pub fn component_codes(&self) -> [&str; 3] {
        [
            self.vertical.code.as_str(),
            self.first_horizontal.code.as_str(),
            self.second_horizontal.code.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above sea level in meters.
    pub elevation: f64,
    pub components: Vec<SensorComponent>,
}

impl SensorLocation {
    /// Pick the three components whose codes share `channel_root` (the
    /// channel code minus its orientation letter). Returns `None` unless
    /// exactly one vertical and two distinct horizontals are found.
    pub fn three_components(&self, channel_root: &str) -> Option<ThreeComponents> {
        let mut vertical = None;
        let mut first = None;
        let mut second = None;

        for comp in &self.components {
            let Some((idx, letter)) = comp.code.char_indices().last() else {
                continue;
            };
            if &comp.code[..idx] != channel_root {
                continue;
            }
            match letter {
                'Z' => vertical = Some(comp.clone()),
                'N' | '1' => first = Some(comp.clone()),
                'E' | '2' => second = Some(comp.clone()),
                _ => {}
            }
        }

        Some(ThreeComponents {
            vertical: vertical?,
            first_horizontal: first?,
            second_horizontal: second?,
        })
    }
}

/// External station-metadata service.
pub trait Inventory {
    /// Sensor metadata valid at `at_time` for a network/station/location
    /// triple, or `None` when the inventory has no matching entry.
    fn sensor_location(
        &self,
        network: &str,
        station: &str,
        location: &str,
        at_time: Epoch,
    ) -> Option<SensorLocation>;
}
