#![forbid(unsafe_code)]

use chrono::Duration;
use kf_types::{Sample, TimeError, TimestampMs, duration_width_ms};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SeriesError {
    #[error("samples must be strictly increasing in time: {prev_ms}ms followed by {next_ms}ms")]
    NonMonotonic { prev_ms: i64, next_ms: i64 },
    #[error("point-wise operation requires equal sample counts: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("point-wise operations require flat operands")]
    PointwiseOnWindowed,
    #[error("cannot window a series that is already windowed; aggregate it first")]
    AlreadyWindowed,
    #[error("aggregate requires a windowed series")]
    NotWindowed,
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error("thd base harmonic must be positive, got {hz}Hz")]
    ThdBaseFrequency { hz: f64 },
    #[error("thd requires at least {required} samples, got {actual}")]
    ThdTooFewSamples { required: usize, actual: usize },
    #[error("thd found no spectral peak near the base harmonic")]
    ThdNoFundamentalPeak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointwiseOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
}

impl PointwiseOp {
    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::FloorDiv => (lhs / rhs).floor(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Ne,
}

impl ComparisonOp {
    #[must_use]
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Gte => lhs >= rhs,
            Self::Lte => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum SeriesData {
    Flat(Vec<Sample>),
    Windowed(Vec<Vec<Sample>>),
}

/// An ordered sequence of time-stamped samples, strictly increasing in time.
///
/// A series is either *flat* (one sample per point in time) or *windowed*
/// (each element is one window's worth of consecutive samples, at most one
/// level deep). `carry_in` holds a remainder segment logically preceding the
/// data, supplied out-of-band from the previous chunk; `carry_out` holds the
/// trailing remainder belonging to the next chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    data: SeriesData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    carry_in: Vec<Sample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    carry_out: Vec<Sample>,
}

impl Series {
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self, SeriesError> {
        ensure_strictly_increasing(&samples)?;
        Ok(Self {
            data: SeriesData::Flat(samples),
            carry_in: Vec::new(),
            carry_out: Vec::new(),
        })
    }

    pub fn from_pairs(pairs: &[(TimestampMs, f64)]) -> Result<Self, SeriesError> {
        Self::from_samples(pairs.iter().map(|&(ts_ms, value)| Sample::new(ts_ms, value)).collect())
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            data: SeriesData::Flat(Vec::new()),
            carry_in: Vec::new(),
            carry_out: Vec::new(),
        }
    }

    fn flat(samples: Vec<Sample>) -> Self {
        Self {
            data: SeriesData::Flat(samples),
            carry_in: Vec::new(),
            carry_out: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_windowed(&self) -> bool {
        matches!(self.data, SeriesData::Windowed(_))
    }

    /// Flat samples; empty for a windowed series.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        match &self.data {
            SeriesData::Flat(samples) => samples,
            SeriesData::Windowed(_) => &[],
        }
    }

    /// Windows; empty for a flat series.
    #[must_use]
    pub fn windows(&self) -> &[Vec<Sample>] {
        match &self.data {
            SeriesData::Flat(_) => &[],
            SeriesData::Windowed(windows) => windows,
        }
    }

    /// Sample count for a flat series, window count for a windowed one.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.data {
            SeriesData::Flat(samples) => samples.len(),
            SeriesData::Windowed(windows) => windows.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn carry_in(&self) -> &[Sample] {
        &self.carry_in
    }

    #[must_use]
    pub fn carry_out(&self) -> &[Sample] {
        &self.carry_out
    }

    pub fn set_carry_in(&mut self, carry_in: Vec<Sample>) {
        self.carry_in = carry_in;
    }

    /// All samples in time order: windows concatenated, or the flat samples.
    #[must_use]
    pub fn flattened(&self) -> Vec<Sample> {
        match &self.data {
            SeriesData::Flat(samples) => samples.clone(),
            SeriesData::Windowed(windows) => windows.iter().flatten().copied().collect(),
        }
    }

    pub fn binary(&self, other: &Self, op: PointwiseOp) -> Result<Self, SeriesError> {
        let (lhs, rhs) = (self.flat_samples()?, other.flat_samples()?);
        if lhs.len() != rhs.len() {
            return Err(SeriesError::LengthMismatch {
                left: lhs.len(),
                right: rhs.len(),
            });
        }
        // Zip positionally; the output keeps the left operand's timestamps.
        let samples = lhs
            .iter()
            .zip(rhs)
            .map(|(l, r)| Sample::new(l.ts_ms, op.apply(l.value, r.value)))
            .collect();
        Ok(Self::flat(samples))
    }

    pub fn binary_scalar(
        &self,
        scalar: f64,
        op: PointwiseOp,
        scalar_is_left: bool,
    ) -> Result<Self, SeriesError> {
        let samples = self
            .flat_samples()?
            .iter()
            .map(|s| {
                let value = if scalar_is_left {
                    op.apply(scalar, s.value)
                } else {
                    op.apply(s.value, scalar)
                };
                Sample::new(s.ts_ms, value)
            })
            .collect();
        Ok(Self::flat(samples))
    }

    /// Point-wise comparison; true samples become 1.0, false become 0.0.
    pub fn compare(&self, other: &Self, op: ComparisonOp) -> Result<Self, SeriesError> {
        let (lhs, rhs) = (self.flat_samples()?, other.flat_samples()?);
        if lhs.len() != rhs.len() {
            return Err(SeriesError::LengthMismatch {
                left: lhs.len(),
                right: rhs.len(),
            });
        }
        let samples = lhs
            .iter()
            .zip(rhs)
            .map(|(l, r)| Sample::new(l.ts_ms, f64::from(op.holds(l.value, r.value))))
            .collect();
        Ok(Self::flat(samples))
    }

    pub fn compare_scalar(
        &self,
        scalar: f64,
        op: ComparisonOp,
        scalar_is_left: bool,
    ) -> Result<Self, SeriesError> {
        let samples = self
            .flat_samples()?
            .iter()
            .map(|s| {
                let holds = if scalar_is_left {
                    op.holds(scalar, s.value)
                } else {
                    op.holds(s.value, scalar)
                };
                Sample::new(s.ts_ms, f64::from(holds))
            })
            .collect();
        Ok(Self::flat(samples))
    }

    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Result<Self, SeriesError> {
        let samples = self
            .flat_samples()?
            .iter()
            .map(|s| Sample::new(s.ts_ms, f(s.value)))
            .collect();
        Ok(Self::flat(samples))
    }

    /// Partition into consecutive windows of at most `width`, completing the
    /// trailing window from the next chunk via carry-out.
    pub fn window(&self, width: Duration) -> Result<Self, SeriesError> {
        self.window_with_carry(width, true)
    }

    /// `window` with carry propagation optionally disabled: when disabled,
    /// an incomplete trailing window is emitted as-is instead of becoming
    /// `carry_out`.
    pub fn window_with_carry(
        &self,
        width: Duration,
        propagate_carry: bool,
    ) -> Result<Self, SeriesError> {
        if self.is_windowed() {
            return Err(SeriesError::AlreadyWindowed);
        }
        let width_ms = duration_width_ms(width)?;

        let mut walk = self.carry_in.clone();
        walk.extend_from_slice(self.samples());

        let mut windows: Vec<Vec<Sample>> = Vec::new();
        let mut current: Vec<Sample> = Vec::new();
        let mut start_ms = walk.first().map_or(0, |s| s.ts_ms);
        for sample in &walk {
            if sample.ts_ms - start_ms >= width_ms {
                windows.push(std::mem::take(&mut current));
                start_ms = sample.ts_ms;
            }
            current.push(*sample);
        }

        let mut carry_out = Vec::new();
        if !current.is_empty() {
            if !propagate_carry || trailing_window_complete(&walk, start_ms, width_ms) {
                windows.push(current);
            } else {
                carry_out = current;
            }
        }

        Ok(Self {
            data: SeriesData::Windowed(windows),
            carry_in: Vec::new(),
            carry_out,
        })
    }

    /// Map a reducer over each window, producing one sample per window at the
    /// window's start time. The input's carry-out survives on the output so
    /// the scheduler can hand it to the next chunk.
    pub fn aggregate(&self, f: impl Fn(&[Sample]) -> f64) -> Result<Self, SeriesError> {
        self.try_aggregate(|window| Ok(f(window)))
    }

    pub fn try_aggregate(
        &self,
        f: impl Fn(&[Sample]) -> Result<f64, SeriesError>,
    ) -> Result<Self, SeriesError> {
        let SeriesData::Windowed(windows) = &self.data else {
            return Err(SeriesError::NotWindowed);
        };
        let samples = windows
            .iter()
            .map(|window| Ok(Sample::new(window[0].ts_ms, f(window)?)))
            .collect::<Result<Vec<_>, SeriesError>>()?;
        Ok(Self {
            data: SeriesData::Flat(samples),
            carry_in: Vec::new(),
            carry_out: self.carry_out.clone(),
        })
    }

    pub fn average(&self) -> Result<Self, SeriesError> {
        self.aggregate(window_mean)
    }

    pub fn min(&self) -> Result<Self, SeriesError> {
        self.aggregate(window_min)
    }

    pub fn max(&self) -> Result<Self, SeriesError> {
        self.aggregate(window_max)
    }

    pub fn sum(&self) -> Result<Self, SeriesError> {
        self.aggregate(window_sum)
    }

    /// Total harmonic distortion of a flat series treated as one window's
    /// worth of samples.
    pub fn thd(&self, base_harmonic_hz: f64) -> Result<f64, SeriesError> {
        if self.is_windowed() {
            return Err(SeriesError::AlreadyWindowed);
        }
        thd_of_window(self.samples(), base_harmonic_hz)
    }

    /// Per-window total harmonic distortion.
    pub fn thd_per_window(&self, base_harmonic_hz: f64) -> Result<Self, SeriesError> {
        self.try_aggregate(|window| thd_of_window(window, base_harmonic_hz))
    }

    fn flat_samples(&self) -> Result<&[Sample], SeriesError> {
        match &self.data {
            SeriesData::Flat(samples) => Ok(samples),
            SeriesData::Windowed(_) => Err(SeriesError::PointwiseOnWindowed),
        }
    }
}

fn ensure_strictly_increasing(samples: &[Sample]) -> Result<(), SeriesError> {
    for pair in samples.windows(2) {
        if pair[1].ts_ms <= pair[0].ts_ms {
            return Err(SeriesError::NonMonotonic {
                prev_ms: pair[0].ts_ms,
                next_ms: pair[1].ts_ms,
            });
        }
    }
    Ok(())
}

/// A trailing window is complete when one more sampling period would land
/// outside it. The period is inferred from the final gap of the walk; a
/// single-sample walk can never prove completeness.
fn trailing_window_complete(walk: &[Sample], start_ms: i64, width_ms: i64) -> bool {
    if walk.len() < 2 {
        return false;
    }
    let last = walk[walk.len() - 1].ts_ms;
    let period = last - walk[walk.len() - 2].ts_ms;
    last + period - start_ms >= width_ms
}

fn window_mean(window: &[Sample]) -> f64 {
    window.iter().map(|s| s.value).sum::<f64>() / window.len() as f64
}

fn window_min(window: &[Sample]) -> f64 {
    window.iter().map(|s| s.value).fold(f64::INFINITY, f64::min)
}

fn window_max(window: &[Sample]) -> f64 {
    window
        .iter()
        .map(|s| s.value)
        .fold(f64::NEG_INFINITY, f64::max)
}

fn window_sum(window: &[Sample]) -> f64 {
    window.iter().map(|s| s.value).sum()
}

const THD_MIN_SAMPLES: usize = 4;
/// Peaks are searched within ±(this fraction × fundamental) of each
/// harmonic's nominal frequency.
const THD_SEARCH_HALF_WIDTH_RATIO: f64 = 0.5;

/// Total harmonic distortion of one window of samples.
///
/// Computes the magnitude spectrum with a naive DFT (windows are small, the
/// quadratic cost is irrelevant), locates the fundamental peak near
/// `base_harmonic_hz`, then sums squared peak magnitudes around each integer
/// multiple of the located fundamental up to Nyquist, normalized by the
/// fundamental peak magnitude.
pub fn thd_of_window(samples: &[Sample], base_harmonic_hz: f64) -> Result<f64, SeriesError> {
    if !(base_harmonic_hz > 0.0) {
        return Err(SeriesError::ThdBaseFrequency {
            hz: base_harmonic_hz,
        });
    }
    if samples.len() < THD_MIN_SAMPLES {
        return Err(SeriesError::ThdTooFewSamples {
            required: THD_MIN_SAMPLES,
            actual: samples.len(),
        });
    }

    let n = samples.len();
    let span_ms = samples[n - 1].ts_ms - samples[0].ts_ms;
    if span_ms <= 0 {
        return Err(SeriesError::NonMonotonic {
            prev_ms: samples[0].ts_ms,
            next_ms: samples[n - 1].ts_ms,
        });
    }
    let sample_rate_hz = 1_000.0 * (n - 1) as f64 / span_ms as f64;
    let bin_hz = sample_rate_hz / n as f64;
    let nyquist_hz = sample_rate_hz / 2.0;

    let magnitudes = magnitude_spectrum(samples);
    let half_width_hz = THD_SEARCH_HALF_WIDTH_RATIO * base_harmonic_hz;

    let (fundamental_bin, fundamental_mag) =
        peak_in_band(&magnitudes, bin_hz, base_harmonic_hz, half_width_hz)
            .ok_or(SeriesError::ThdNoFundamentalPeak)?;
    if fundamental_mag <= 0.0 {
        return Err(SeriesError::ThdNoFundamentalPeak);
    }
    let fundamental_hz = fundamental_bin as f64 * bin_hz;

    let mut harmonic_power = 0.0;
    let mut harmonic = 2_u32;
    loop {
        let center_hz = fundamental_hz * f64::from(harmonic);
        if center_hz > nyquist_hz {
            break;
        }
        if let Some((_, mag)) = peak_in_band(&magnitudes, bin_hz, center_hz, half_width_hz) {
            harmonic_power += mag * mag;
        }
        harmonic += 1;
    }

    Ok(harmonic_power.sqrt() / fundamental_mag)
}

/// Magnitudes of DFT bins 0..=n/2.
fn magnitude_spectrum(samples: &[Sample]) -> Vec<f64> {
    let n = samples.len();
    let half = n / 2;
    (0..=half)
        .map(|k| {
            let mut re = 0.0;
            let mut im = 0.0;
            for (i, sample) in samples.iter().enumerate() {
                let angle = -2.0 * std::f64::consts::PI * k as f64 * i as f64 / n as f64;
                re += sample.value * angle.cos();
                im += sample.value * angle.sin();
            }
            (re * re + im * im).sqrt()
        })
        .collect()
}

/// Highest-magnitude bin within `center ± half_width`, excluding DC.
fn peak_in_band(
    magnitudes: &[f64],
    bin_hz: f64,
    center_hz: f64,
    half_width_hz: f64,
) -> Option<(usize, f64)> {
    let lo = (((center_hz - half_width_hz) / bin_hz).ceil() as i64).max(1) as usize;
    let hi = (((center_hz + half_width_hz) / bin_hz).floor() as i64).max(0) as usize;
    let hi = hi.min(magnitudes.len().saturating_sub(1));
    if lo > hi {
        return None;
    }
    (lo..=hi)
        .map(|bin| (bin, magnitudes[bin]))
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use kf_types::Sample;
    use proptest::prelude::*;

    use super::{ComparisonOp, PointwiseOp, Series, SeriesError};

    fn one_hz_series(values: &[f64]) -> Series {
        Series::from_pairs(
            &values
                .iter()
                .enumerate()
                .map(|(i, &v)| (i as i64 * 1_000, v))
                .collect::<Vec<_>>(),
        )
        .expect("series")
    }

    #[test]
    fn from_samples_rejects_non_monotonic_timestamps() {
        let err = Series::from_pairs(&[(0, 1.0), (1_000, 2.0), (1_000, 3.0)])
            .expect_err("duplicate timestamp must fail");
        assert!(matches!(err, SeriesError::NonMonotonic { .. }));
    }

    #[test]
    fn six_samples_into_two_second_windows_leaves_no_carry() {
        let series = one_hz_series(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let windowed = series.window(Duration::try_seconds(2).expect("2s")).expect("window");

        let values: Vec<Vec<f64>> = windowed
            .windows()
            .iter()
            .map(|w| w.iter().map(|s| s.value).collect())
            .collect();
        assert_eq!(values, vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]]);
        assert!(windowed.carry_out().is_empty());
    }

    #[test]
    fn seventh_sample_becomes_carry_out() {
        let series = one_hz_series(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let windowed = series.window(Duration::try_seconds(2).expect("2s")).expect("window");

        assert_eq!(windowed.windows().len(), 3);
        assert_eq!(windowed.carry_out(), &[Sample::new(6_000, 6.0)]);
    }

    #[test]
    fn disabled_carry_emits_trailing_partial_window() {
        let series = one_hz_series(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let windowed = series
            .window_with_carry(Duration::try_seconds(2).expect("2s"), false)
            .expect("window");

        assert_eq!(windowed.windows().len(), 4);
        assert_eq!(windowed.windows()[3], vec![Sample::new(6_000, 6.0)]);
        assert!(windowed.carry_out().is_empty());
    }

    #[test]
    fn carry_in_is_prepended_before_partitioning() {
        let mut series = one_hz_series(&[]);
        series.set_carry_in(vec![Sample::new(-1_000, 9.0)]);
        // No fresh samples: the remainder alone cannot complete a window.
        let windowed = series.window(Duration::try_seconds(2).expect("2s")).expect("window");
        assert!(windowed.windows().is_empty());
        assert_eq!(windowed.carry_out(), &[Sample::new(-1_000, 9.0)]);
    }

    #[test]
    fn windowing_two_chunks_with_carry_matches_windowing_the_whole() {
        let whole = one_hz_series(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let width = Duration::try_seconds(2).expect("2s");
        let expected = whole.window(width).expect("window whole");

        let first = one_hz_series(&[0.0, 1.0, 2.0]);
        let first_windowed = first.window(width).expect("window first");

        let mut second = Series::from_pairs(&[
            (3_000, 3.0),
            (4_000, 4.0),
            (5_000, 5.0),
            (6_000, 6.0),
            (7_000, 7.0),
        ])
        .expect("second chunk");
        second.set_carry_in(first_windowed.carry_out().to_vec());
        let second_windowed = second.window(width).expect("window second");

        let mut stitched = first_windowed.windows().to_vec();
        stitched.extend_from_slice(second_windowed.windows());
        assert_eq!(stitched, expected.windows());
        assert_eq!(second_windowed.carry_out(), expected.carry_out());
    }

    #[test]
    fn windowing_an_empty_series_yields_empty_windows() {
        let windowed = Series::empty()
            .window(Duration::try_seconds(1).expect("1s"))
            .expect("window");
        assert!(windowed.is_windowed());
        assert!(windowed.is_empty());
    }

    #[test]
    fn windowing_twice_is_a_usage_error() {
        let width = Duration::try_seconds(2).expect("2s");
        let windowed = one_hz_series(&[1.0, 2.0, 3.0]).window(width).expect("window");
        let err = windowed.window(width).expect_err("double window must fail");
        assert!(matches!(err, SeriesError::AlreadyWindowed));
    }

    #[test]
    fn aggregate_requires_windowed_input() {
        let err = one_hz_series(&[1.0, 2.0])
            .average()
            .expect_err("flat aggregate must fail");
        assert!(matches!(err, SeriesError::NotWindowed));
    }

    #[test]
    fn per_window_reducers_emit_one_sample_at_window_start() {
        let series = one_hz_series(&[1.0, 3.0, 10.0, 20.0]);
        let windowed = series.window(Duration::try_seconds(2).expect("2s")).expect("window");

        let averaged = windowed.average().expect("average");
        assert_eq!(
            averaged.samples(),
            &[Sample::new(0, 2.0), Sample::new(2_000, 15.0)]
        );

        let mins = windowed.min().expect("min");
        assert_eq!(mins.samples(), &[Sample::new(0, 1.0), Sample::new(2_000, 10.0)]);

        let maxs = windowed.max().expect("max");
        assert_eq!(maxs.samples(), &[Sample::new(0, 3.0), Sample::new(2_000, 20.0)]);

        let sums = windowed.sum().expect("sum");
        assert_eq!(sums.samples(), &[Sample::new(0, 4.0), Sample::new(2_000, 30.0)]);
    }

    #[test]
    fn aggregate_preserves_carry_out() {
        let series = one_hz_series(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let averaged = series
            .window(Duration::try_seconds(2).expect("2s"))
            .expect("window")
            .average()
            .expect("average");
        assert_eq!(averaged.carry_out(), &[Sample::new(6_000, 6.0)]);
    }

    #[test]
    fn pointwise_ops_zip_positionally_and_keep_left_timestamps() {
        let left = one_hz_series(&[8.0, 6.0]);
        let right = Series::from_pairs(&[(500, 2.0), (1_500, 3.0)]).expect("right");

        let sum = left.binary(&right, PointwiseOp::Add).expect("add");
        assert_eq!(sum.samples(), &[Sample::new(0, 10.0), Sample::new(1_000, 9.0)]);

        let quotient = left.binary(&right, PointwiseOp::Div).expect("div");
        assert_eq!(quotient.samples()[0].value, 4.0);

        let floored = left.binary(&right, PointwiseOp::FloorDiv).expect("floordiv");
        assert_eq!(floored.samples()[1].value, 2.0);
    }

    #[test]
    fn pointwise_length_mismatch_is_rejected() {
        let left = one_hz_series(&[1.0, 2.0, 3.0]);
        let right = one_hz_series(&[1.0]);
        let err = left.binary(&right, PointwiseOp::Mul).expect_err("must fail");
        assert_eq!(err, SeriesError::LengthMismatch { left: 3, right: 1 });
    }

    #[test]
    fn scalar_broadcasts_on_either_side() {
        let series = one_hz_series(&[2.0, 4.0]);

        let doubled = series
            .binary_scalar(2.0, PointwiseOp::Mul, false)
            .expect("mul");
        assert_eq!(doubled.samples()[1].value, 8.0);

        let inverted = series
            .binary_scalar(8.0, PointwiseOp::Div, true)
            .expect("div");
        assert_eq!(inverted.samples(), &[Sample::new(0, 4.0), Sample::new(1_000, 2.0)]);
    }

    #[test]
    fn comparisons_produce_zero_one_masks() {
        let series = one_hz_series(&[1.0, 5.0, 3.0]);
        let mask = series
            .compare_scalar(3.0, ComparisonOp::Gte, false)
            .expect("gte");
        let values: Vec<f64> = mask.samples().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 1.0]);

        let flipped = series
            .compare_scalar(3.0, ComparisonOp::Gte, true)
            .expect("scalar gte series");
        let values: Vec<f64> = flipped.samples().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn thd_of_pure_sine_is_negligible() {
        let samples: Vec<Sample> = (0..200)
            .map(|i| {
                let t = i as f64 / 1_000.0;
                Sample::new(i, (2.0 * std::f64::consts::PI * 50.0 * t).sin())
            })
            .collect();
        let series = Series::from_samples(samples).expect("series");
        let thd = series.thd(50.0).expect("thd");
        assert!(thd < 1e-9, "pure sine thd was {thd}");
    }

    #[test]
    fn thd_measures_injected_third_harmonic() {
        let samples: Vec<Sample> = (0..200)
            .map(|i| {
                let t = i as f64 / 1_000.0;
                let fundamental = (2.0 * std::f64::consts::PI * 50.0 * t).sin();
                let third = 0.1 * (2.0 * std::f64::consts::PI * 150.0 * t).sin();
                Sample::new(i, fundamental + third)
            })
            .collect();
        let series = Series::from_samples(samples).expect("series");
        let thd = series.thd(50.0).expect("thd");
        assert!((thd - 0.1).abs() < 1e-3, "expected thd near 0.1, got {thd}");
    }

    #[test]
    fn thd_rejects_degenerate_inputs() {
        let short = one_hz_series(&[1.0, 2.0]);
        assert!(matches!(
            short.thd(50.0),
            Err(SeriesError::ThdTooFewSamples { .. })
        ));

        let series = one_hz_series(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(matches!(
            series.thd(0.0),
            Err(SeriesError::ThdBaseFrequency { .. })
        ));
    }

    proptest! {
        #[test]
        fn windowing_preserves_every_sample(
            values in proptest::collection::vec(-1e6_f64..1e6, 0..64),
            width_s in 1_i64..10,
        ) {
            let series = one_hz_series(&values);
            let windowed = series
                .window(Duration::try_seconds(width_s).expect("width"))
                .expect("window");

            let mut reassembled = windowed.flattened();
            reassembled.extend_from_slice(windowed.carry_out());
            prop_assert_eq!(reassembled, series.samples().to_vec());
        }
    }
}
