// Measurement engine: density correction to 15°C, dip-to-volume conversion
// and delivery-invoice variance audit.
//
// Everything here is pure. The lookup tables are fetched by the asset loader
// and handed in already parsed; nothing in this module touches the network
// or storage.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Input, Result};

/// Density the correction table's index 0 corresponds to (kg/m³).
pub const BASE_DENSITY: f64 = 700.0;

/// Largest absolute variance (kg/m³) an invoice may show and still pass.
pub const VARIANCE_TOLERANCE: f64 = 3.0;

/// JavaScript-style rounding: halves go up (towards +∞).
fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

// ---------------------------------------------------------------------------
// Density correction table
// ---------------------------------------------------------------------------

/// Observed-density to density@15°C table, bucketed by half-degree
/// temperature. Keys carry exactly one decimal ("29.5"); each bucket is
/// indexed by `observed density - 700`. Gaps in a bucket are `None`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct DensityTable {
    buckets: HashMap<String, Vec<Option<f64>>>,
}

impl DensityTable {
    pub fn new(buckets: HashMap<String, Vec<Option<f64>>>) -> Self {
        Self { buckets }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Density at 15°C for a sample of `observed` density at `temperature`.
    pub fn correct(&self, observed: f64, temperature: f64) -> Result<f64> {
        let key = temperature_bucket(temperature)?;
        let bucket = self
            .buckets
            .get(&key)
            .ok_or(Error::OutOfRange(Input::Temperature))?;

        if !observed.is_finite() {
            return Err(Error::OutOfRange(Input::Density));
        }
        let index = round_half_up(observed - BASE_DENSITY);
        if index < 0.0 || index >= bucket.len() as f64 {
            return Err(Error::OutOfRange(Input::Density));
        }
        bucket[index as usize].ok_or(Error::OutOfRange(Input::Density))
    }
}

/// Table key for `temperature`: the nearest half degree, halves rounded up,
/// formatted with one decimal.
pub fn temperature_bucket(temperature: f64) -> Result<String> {
    if !temperature.is_finite() {
        return Err(Error::OutOfRange(Input::Temperature));
    }
    // `+ 0.0` turns a negative zero into "0.0" rather than "-0.0".
    let bucket = round_half_up(temperature * 2.0) / 2.0 + 0.0;
    Ok(format!("{bucket:.1}"))
}

// ---------------------------------------------------------------------------
// Dip charts
// ---------------------------------------------------------------------------

/// Calibration chart of one tank type: cumulative volume by dip depth.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "HashMap<String, f64>")]
pub struct TankChart {
    /// (dip, volume), ascending by dip.
    points: Vec<(f64, f64)>,
}

impl From<HashMap<String, f64>> for TankChart {
    fn from(raw: HashMap<String, f64>) -> Self {
        let mut points: Vec<(f64, f64)> = raw
            .into_iter()
            .filter_map(|(key, volume)| match key.trim().parse::<f64>() {
                Ok(dip) if dip.is_finite() => Some((dip, volume)),
                _ => {
                    warn!("Skipping unparseable dip chart key {key:?}");
                    None
                }
            })
            .collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        points.dedup_by(|b, a| a.0 == b.0);
        Self { points }
    }
}

impl TankChart {
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let raw: HashMap<String, f64> = points
            .into_iter()
            .map(|(dip, volume)| (dip.to_string(), volume))
            .collect();
        Self::from(raw)
    }

    /// Volume held at `dip`.
    ///
    /// A dip whose one-decimal rendering names a chart point returns that
    /// point. Otherwise the volume is interpolated linearly between the
    /// chart points with `lower <= dip < upper`. A dip outside the chart
    /// is out of range.
    pub fn volume_at(&self, dip: f64) -> Result<f64> {
        if !dip.is_finite() {
            return Err(Error::OutOfRange(Input::Dip));
        }

        let key: f64 = format!("{dip:.1}")
            .parse()
            .map_err(|_| Error::OutOfRange(Input::Dip))?;
        if let Some(&(_, volume)) = self.points.iter().find(|(d, _)| (d - key).abs() < 1e-9) {
            return Ok(volume);
        }

        // First point strictly above the dip.
        let upper = self.points.partition_point(|(d, _)| *d <= dip);
        if upper == 0 || upper == self.points.len() {
            return Err(Error::OutOfRange(Input::Dip));
        }
        let (d0, v0) = self.points[upper - 1];
        let (d1, v1) = self.points[upper];
        Ok(v0 + (v1 - v0) / (d1 - d0) * (dip - d0))
    }
}

/// Every tank type's calibration chart, keyed as stored remotely
/// (`"MS_CHART"`, `"HSD"`, ...).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct VolumeCharts {
    charts: HashMap<String, TankChart>,
}

impl VolumeCharts {
    pub fn new(charts: HashMap<String, TankChart>) -> Self {
        Self { charts }
    }

    pub fn is_empty(&self) -> bool {
        self.charts.is_empty()
    }

    /// Chart for a tank type: `<type>_CHART` first, then `<type>`.
    pub fn chart_for(&self, tank_type: &str) -> Option<&TankChart> {
        self.charts
            .get(&format!("{tank_type}_CHART"))
            .or_else(|| self.charts.get(tank_type))
    }

    pub fn volume(&self, tank_type: &str, dip: f64) -> Result<f64> {
        self.chart_for(tank_type)
            .ok_or_else(|| Error::ChartMissing(tank_type.to_string()))?
            .volume_at(dip)
    }
}

// ---------------------------------------------------------------------------
// Loaded datasets
// ---------------------------------------------------------------------------

/// Outcome of an invoice density audit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuditOutcome {
    pub standard_density: f64,
    pub invoice_density: f64,
    /// `standard_density - invoice_density`, one decimal.
    pub variance: f64,
    pub pass: bool,
}

/// The lookup datasets the asset loader last produced. Either table may be
/// missing if its fetch failed. Each table is replaced whole by a reload
/// that fetched it and kept by one that did not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupDatasets {
    pub density: Option<DensityTable>,
    pub charts: Option<VolumeCharts>,
}

impl LookupDatasets {
    pub fn is_complete(&self) -> bool {
        self.density.is_some() && self.charts.is_some()
    }

    /// Take every table `fresh` carries. A table missing from `fresh` keeps
    /// its current copy.
    pub fn merge(&mut self, fresh: LookupDatasets) {
        if let Some(density) = fresh.density {
            self.density = Some(density);
        }
        if let Some(charts) = fresh.charts {
            self.charts = Some(charts);
        }
    }

    fn density_table(&self) -> Result<&DensityTable> {
        self.density.as_ref().ok_or(Error::AssetUnavailable)
    }

    pub fn correct_density(&self, observed: f64, temperature: f64) -> Result<f64> {
        self.density_table()?.correct(observed, temperature)
    }

    pub fn dip_volume(&self, tank_type: &str, dip: f64) -> Result<f64> {
        self.charts
            .as_ref()
            .ok_or(Error::AssetUnavailable)?
            .volume(tank_type, dip)
    }

    pub fn audit_invoice(
        &self,
        observed: f64,
        temperature: f64,
        invoice_density: f64,
    ) -> Result<AuditOutcome> {
        let standard_density = self.correct_density(observed, temperature)?;
        if !invoice_density.is_finite() {
            return Err(Error::OutOfRange(Input::InvoiceDensity));
        }
        let variance = (standard_density - invoice_density) * 10.0;
        let variance = variance.round() / 10.0 + 0.0;
        Ok(AuditOutcome {
            standard_density,
            invoice_density,
            variance,
            pass: variance.abs() <= VARIANCE_TOLERANCE,
        })
    }
}
