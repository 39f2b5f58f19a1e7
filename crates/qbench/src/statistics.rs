// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of repeated-run samples

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::BenchError;
use crate::measurement::{Measurement, MeasurementUnit};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregatedMeasurement {
    pub unit: MeasurementUnit,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub std_dev_percent: f64,
}

/// Reduce samples to min/max/mean and population standard deviation.
///
/// `std_dev_percent` is zero whenever the deviation or the mean is zero.
pub fn aggregate(unit: MeasurementUnit, samples: &[f64]) -> Result<AggregatedMeasurement, BenchError> {
    match samples {
        [] => Err(BenchError::InvalidArgument(
            "cannot aggregate an empty sample set".to_string(),
        )),
        [only] => Ok(AggregatedMeasurement {
            unit,
            min: *only,
            max: *only,
            mean: *only,
            std_dev: 0.0,
            std_dev_percent: 0.0,
        }),
        _ => {
            let count = samples.len() as f64;
            let mean = samples.iter().sum::<f64>() / count;
            let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;
            let std_dev = variance.sqrt();
            let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            let std_dev_percent = if std_dev == 0.0 || mean == 0.0 {
                0.0
            } else {
                std_dev / mean * 100.0
            };

            Ok(AggregatedMeasurement {
                unit,
                min,
                max,
                mean,
                std_dev,
                std_dev_percent,
            })
        }
    }
}

/// Group measurements by name and aggregate each group.
///
/// Measurements sharing a name must share a unit.
pub fn aggregate_measurements<'a, I>(
    measurements: I,
) -> Result<BTreeMap<String, AggregatedMeasurement>, BenchError>
where
    I: IntoIterator<Item = &'a Measurement>,
{
    let mut groups: BTreeMap<&str, (MeasurementUnit, Vec<f64>)> = BTreeMap::new();
    for measurement in measurements {
        let (unit, values) = groups
            .entry(measurement.name.as_str())
            .or_insert_with(|| (measurement.unit, Vec::new()));
        if *unit != measurement.unit {
            return Err(BenchError::InvalidArgument(format!(
                "measurement {} reported in both {unit} and {}",
                measurement.name, measurement.unit
            )));
        }
        values.push(measurement.value);
    }

    groups
        .into_iter()
        .map(|(name, (unit, values))| Ok((name.to_string(), aggregate(unit, &values)?)))
        .collect()
}
