//! 3-component projection.
//!
//! When a pick references a channel the station never recorded (a `Z/N/E`
//! code on a misoriented borehole sensor, or a ray-frame `R/T` code), the
//! requested trace is synthesized from the three native components: each
//! sample triple is pushed through a 3×3 matrix composed from the sensor
//! orientations and, for the ray frame, a back-azimuth rotation.
//!
//! Output slots follow the native ordering used throughout: slot 0 is the
//! second horizontal (east / transverse), slot 1 the first horizontal
//! (north / radial), slot 2 the vertical.

use nalgebra::{Matrix3, Vector3};

use crate::inventory::{SensorComponent, ThreeComponents};
use crate::relodd_errors::{ReloddError, ReloddResult};
use crate::time::TimeWindow;
use crate::waveform::Trace;

/// Unit direction of one sensor axis in the (east, north, up) frame.
fn component_direction(comp: &SensorComponent) -> Vector3<f64> {
    let azimuth = comp.azimuth.to_radians();
    let elevation = (-comp.dip).to_radians();
    Vector3::new(
        elevation.cos() * azimuth.sin(),
        elevation.cos() * azimuth.cos(),
        elevation.sin(),
    )
    .normalize()
}

/// Orthogonalization matrix built from the native sensor orientations;
/// applied to a native sample triple it yields ground motion in ZNE.
pub fn orientation_zne(tc: &ThreeComponents) -> Matrix3<f64> {
    Matrix3::from_columns(&[
        component_direction(&tc.second_horizontal),
        component_direction(&tc.first_horizontal),
        component_direction(&tc.vertical),
    ])
}

/// Rotation from ZNE into the ray frame for a station whose back-azimuth
/// towards the event is `baz` degrees; the radial axis points along
/// `baz + 180°`.
pub fn rotation_zrt(baz: f64) -> Matrix3<f64> {
    let phi = (baz + 180.0).to_radians();
    let (sin, cos) = phi.sin_cos();
    // rows: transverse, radial, vertical
    Matrix3::new(
        cos, -sin, 0.0, //
        sin, cos, 0.0, //
        0.0, 0.0, 1.0,
    )
}

/// Output slot for the requested orientation letter.
pub fn slot_for_suffix(suffix: char) -> ReloddResult<usize> {
    match suffix {
        'E' | 'T' => Ok(0),
        'N' | 'R' => Ok(1),
        'Z' => Ok(2),
        other => Err(ReloddError::UnknownChannelSuffix(other)),
    }
}

/// Apply `transformation` to three sample-aligned native traces and emit
/// the single output channel `out_channel` from `slot`.
///
/// The traces are aligned on the overlap of their time windows; they must
/// share the sampling frequency and actually overlap.
pub fn project(
    second_horizontal: &Trace,
    first_horizontal: &Trace,
    vertical: &Trace,
    transformation: &Matrix3<f64>,
    slot: usize,
    out_channel: &str,
) -> ReloddResult<Trace> {
    let stream = format!(
        "{}.{}.{}.{}",
        vertical.network_code, vertical.station_code, vertical.location_code, out_channel
    );

    let fs = vertical.sampling_frequency();
    if second_horizontal.sampling_frequency() != fs || first_horizontal.sampling_frequency() != fs
    {
        return Err(ReloddError::TraceMergeFailed(format!(
            "{}: component sampling frequencies differ",
            stream
        )));
    }

    let components = [second_horizontal, first_horizontal, vertical];
    let start = components
        .iter()
        .map(|tr| tr.start_time())
        .max()
        .expect("three components");
    let end = components
        .iter()
        .map(|tr| tr.end_time())
        .min()
        .expect("three components");
    if end <= start {
        return Err(ReloddError::EmptyProjection(stream));
    }

    let common = TimeWindow::new(start, end);
    let aligned: Vec<Trace> = components
        .iter()
        .map(|tr| tr.slice(&common))
        .collect::<Option<_>>()
        .ok_or_else(|| ReloddError::EmptyProjection(stream.clone()))?;

    let len = aligned.iter().map(Trace::sample_count).min().unwrap_or(0);
    if len == 0 {
        return Err(ReloddError::EmptyProjection(stream));
    }

    let row = transformation.row(slot);
    let samples: Vec<f64> = (0..len)
        .map(|i| {
            row[0] * aligned[0].samples()[i]
                + row[1] * aligned[1].samples()[i]
                + row[2] * aligned[2].samples()[i]
        })
        .collect();

    Ok(Trace::new(
        &vertical.network_code,
        &vertical.station_code,
        &vertical.location_code,
        out_channel,
        start,
        fs,
        samples,
    ))
}
