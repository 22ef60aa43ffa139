#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kf_series::{ComparisonOp, PointwiseOp, Series};
use kf_types::{Sample, TimestampMs, is_truthy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggError {
    #[error("cannot merge aggregation shapes {left} and {right}")]
    ShapeMismatch {
        left: &'static str,
        right: &'static str,
    },
    #[error("cannot merge tables: {detail}")]
    TableShape { detail: String },
    #[error("aggregation constructors require a flat series")]
    WindowedSource,
    #[error("when-selection requires a flat test series")]
    WindowedTest,
    #[error("series branch has {actual} samples but the test has {expected}")]
    BranchLength { expected: usize, actual: usize },
    #[error("aggregation holds no value yet")]
    Unpopulated,
    #[error("a table cannot supply a nearest-time value")]
    TableSelection,
    #[error(transparent)]
    Series(#[from] kf_series::SeriesError),
    #[error("dict round-trip failed: {0}")]
    Dict(#[from] serde_json::Error),
}

/// Concrete result reconstructed from an aggregation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AggValue {
    Number(f64),
    Bool(bool),
    Table(BTreeMap<String, Vec<AggValue>>),
}

impl AggValue {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Bool(v) => Some(f64::from(*v)),
            Self::Table(_) => None,
        }
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Number(v) => is_truthy(*v),
            Self::Bool(v) => *v,
            Self::Table(columns) => !columns.is_empty(),
        }
    }
}

/// An accumulator tree mirroring the arithmetic/comparison structure of the
/// expression that produced it.
///
/// `merge` combines this node's state (older) with a same-shape partial from
/// a newer chunk without re-reading raw samples; `value` reconstructs a
/// concrete result and is pure. A node carrying `skip_merge` was looked up by
/// identifier and already holds a merged running total, so merging it again
/// replaces rather than combines (see `merge`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(flatten)]
    node: AggNode,
    #[serde(default, skip_serializing_if = "is_false")]
    skip_merge: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AggNode {
    Constant {
        value: f64,
    },
    Min {
        value: Option<f64>,
        samples: Vec<Sample>,
    },
    Max {
        value: Option<f64>,
        samples: Vec<Sample>,
    },
    Sum {
        value: Option<f64>,
        samples: Vec<Sample>,
    },
    Average {
        average: Option<f64>,
        count: u64,
        samples: Vec<Sample>,
    },
    Add {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Sub {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Mul {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Div {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    FloorDiv {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Gt {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Lt {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Gte {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Lte {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Eq {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    Ne {
        left: Box<Aggregation>,
        right: Box<Aggregation>,
    },
    If {
        test: Box<Aggregation>,
        body: Box<Aggregation>,
        orelse: Box<Aggregation>,
    },
    Table {
        columns: BTreeMap<String, Vec<Aggregation>>,
    },
}

impl Aggregation {
    fn from_node(node: AggNode) -> Self {
        Self {
            node,
            skip_merge: false,
        }
    }

    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self::from_node(AggNode::Constant { value })
    }

    #[must_use]
    pub fn min_value(value: f64) -> Self {
        Self::from_node(AggNode::Min {
            value: Some(value),
            samples: Vec::new(),
        })
    }

    #[must_use]
    pub fn max_value(value: f64) -> Self {
        Self::from_node(AggNode::Max {
            value: Some(value),
            samples: Vec::new(),
        })
    }

    #[must_use]
    pub fn sum_value(value: f64) -> Self {
        Self::from_node(AggNode::Sum {
            value: Some(value),
            samples: Vec::new(),
        })
    }

    /// Fold a flat series into a `Min` leaf, keeping the source samples for
    /// nearest-time selection.
    pub fn min_of(series: &Series) -> Result<Self, AggError> {
        let samples = flat_samples(series)?;
        let value = samples
            .iter()
            .map(|s| s.value)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
        Ok(Self::from_node(AggNode::Min {
            value,
            samples: samples.to_vec(),
        }))
    }

    pub fn max_of(series: &Series) -> Result<Self, AggError> {
        let samples = flat_samples(series)?;
        let value = samples
            .iter()
            .map(|s| s.value)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        Ok(Self::from_node(AggNode::Max {
            value,
            samples: samples.to_vec(),
        }))
    }

    pub fn sum_of(series: &Series) -> Result<Self, AggError> {
        let samples = flat_samples(series)?;
        let value = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().map(|s| s.value).sum())
        };
        Ok(Self::from_node(AggNode::Sum {
            value,
            samples: samples.to_vec(),
        }))
    }

    pub fn average_of(series: &Series) -> Result<Self, AggError> {
        let samples = flat_samples(series)?;
        let count = samples.len() as u64;
        let average = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64)
        };
        Ok(Self::from_node(AggNode::Average {
            average,
            count,
            samples: samples.to_vec(),
        }))
    }

    /// Composite arithmetic node mirroring a point-wise operator.
    #[must_use]
    pub fn combine(op: PointwiseOp, left: Self, right: Self) -> Self {
        let (left, right) = (Box::new(left), Box::new(right));
        Self::from_node(match op {
            PointwiseOp::Add => AggNode::Add { left, right },
            PointwiseOp::Sub => AggNode::Sub { left, right },
            PointwiseOp::Mul => AggNode::Mul { left, right },
            PointwiseOp::Div => AggNode::Div { left, right },
            PointwiseOp::FloorDiv => AggNode::FloorDiv { left, right },
        })
    }

    #[must_use]
    pub fn compare(op: ComparisonOp, left: Self, right: Self) -> Self {
        let (left, right) = (Box::new(left), Box::new(right));
        Self::from_node(match op {
            ComparisonOp::Gt => AggNode::Gt { left, right },
            ComparisonOp::Lt => AggNode::Lt { left, right },
            ComparisonOp::Gte => AggNode::Gte { left, right },
            ComparisonOp::Lte => AggNode::Lte { left, right },
            ComparisonOp::Eq => AggNode::Eq { left, right },
            ComparisonOp::Ne => AggNode::Ne { left, right },
        })
    }

    #[must_use]
    pub fn conditional(test: Self, body: Self, orelse: Self) -> Self {
        Self::from_node(AggNode::If {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    #[must_use]
    pub fn table(columns: BTreeMap<String, Vec<Aggregation>>) -> Self {
        Self::from_node(AggNode::Table { columns })
    }

    #[must_use]
    pub fn skip_merge(&self) -> bool {
        self.skip_merge
    }

    pub fn mark_skip_merge(&mut self) {
        self.skip_merge = true;
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.node.kind()
    }

    /// Combine this (older) state with a same-shape partial from a newer
    /// chunk. If either operand was looked up by identifier (`skip_merge`),
    /// it already contains a merged running total and the newer operand wins
    /// outright; combining would double-count.
    pub fn merge(&self, newer: &Self) -> Result<Self, AggError> {
        if self.skip_merge || newer.skip_merge {
            return Ok(newer.clone());
        }
        Ok(Self::from_node(self.node.merge(&newer.node)?))
    }

    /// Reconstruct a concrete result; `None` while unpopulated.
    #[must_use]
    pub fn value(&self) -> Option<AggValue> {
        self.node.value()
    }

    /// Value located nearest `ts_ms` in this tree's source samples, used by
    /// when-selection. Leaves without samples fall back to their current
    /// value, so a populated aggregation never fails the lookup.
    pub fn nearest_value(&self, ts_ms: TimestampMs) -> Result<f64, AggError> {
        self.node.nearest_value(ts_ms)
    }

    pub fn to_dict(&self) -> Result<serde_json::Value, AggError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_dict(dict: &serde_json::Value) -> Result<Self, AggError> {
        Ok(serde_json::from_value(dict.clone())?)
    }
}

fn flat_samples(series: &Series) -> Result<&[Sample], AggError> {
    if series.is_windowed() {
        return Err(AggError::WindowedSource);
    }
    Ok(series.samples())
}

/// Merge two optional leaf values; an unset side yields the other unchanged.
fn merge_leaf_value(a: Option<f64>, b: Option<f64>, f: impl Fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

fn merge_samples(older: &[Sample], newer: &[Sample]) -> Vec<Sample> {
    let mut merged = older.to_vec();
    merged.extend_from_slice(newer);
    merged
}

impl AggNode {
    fn kind(&self) -> &'static str {
        match self {
            Self::Constant { .. } => "constant",
            Self::Min { .. } => "min",
            Self::Max { .. } => "max",
            Self::Sum { .. } => "sum",
            Self::Average { .. } => "average",
            Self::Add { .. } => "add",
            Self::Sub { .. } => "sub",
            Self::Mul { .. } => "mul",
            Self::Div { .. } => "div",
            Self::FloorDiv { .. } => "floor_div",
            Self::Gt { .. } => "gt",
            Self::Lt { .. } => "lt",
            Self::Gte { .. } => "gte",
            Self::Lte { .. } => "lte",
            Self::Eq { .. } => "eq",
            Self::Ne { .. } => "ne",
            Self::If { .. } => "if",
            Self::Table { .. } => "table",
        }
    }

    fn combine_op(&self) -> Option<PointwiseOp> {
        match self {
            Self::Add { .. } => Some(PointwiseOp::Add),
            Self::Sub { .. } => Some(PointwiseOp::Sub),
            Self::Mul { .. } => Some(PointwiseOp::Mul),
            Self::Div { .. } => Some(PointwiseOp::Div),
            Self::FloorDiv { .. } => Some(PointwiseOp::FloorDiv),
            _ => None,
        }
    }

    fn comparison_op(&self) -> Option<ComparisonOp> {
        match self {
            Self::Gt { .. } => Some(ComparisonOp::Gt),
            Self::Lt { .. } => Some(ComparisonOp::Lt),
            Self::Gte { .. } => Some(ComparisonOp::Gte),
            Self::Lte { .. } => Some(ComparisonOp::Lte),
            Self::Eq { .. } => Some(ComparisonOp::Eq),
            Self::Ne { .. } => Some(ComparisonOp::Ne),
            _ => None,
        }
    }

    fn children(&self) -> Option<(&Aggregation, &Aggregation)> {
        match self {
            Self::Add { left, right }
            | Self::Sub { left, right }
            | Self::Mul { left, right }
            | Self::Div { left, right }
            | Self::FloorDiv { left, right }
            | Self::Gt { left, right }
            | Self::Lt { left, right }
            | Self::Gte { left, right }
            | Self::Lte { left, right }
            | Self::Eq { left, right }
            | Self::Ne { left, right } => Some((left, right)),
            _ => None,
        }
    }

    fn rebuild(&self, left: Aggregation, right: Aggregation) -> Self {
        let (left, right) = (Box::new(left), Box::new(right));
        match self {
            Self::Add { .. } => Self::Add { left, right },
            Self::Sub { .. } => Self::Sub { left, right },
            Self::Mul { .. } => Self::Mul { left, right },
            Self::Div { .. } => Self::Div { left, right },
            Self::FloorDiv { .. } => Self::FloorDiv { left, right },
            Self::Gt { .. } => Self::Gt { left, right },
            Self::Lt { .. } => Self::Lt { left, right },
            Self::Gte { .. } => Self::Gte { left, right },
            Self::Lte { .. } => Self::Lte { left, right },
            Self::Eq { .. } => Self::Eq { left, right },
            Self::Ne { .. } => Self::Ne { left, right },
            Self::Constant { .. }
            | Self::Min { .. }
            | Self::Max { .. }
            | Self::Sum { .. }
            | Self::Average { .. }
            | Self::If { .. }
            | Self::Table { .. } => unreachable!("rebuild is only called on binary composites"),
        }
    }

    fn merge(&self, newer: &Self) -> Result<Self, AggError> {
        let mismatch = || AggError::ShapeMismatch {
            left: self.kind(),
            right: newer.kind(),
        };

        match (self, newer) {
            (Self::Constant { .. }, Self::Constant { value }) => {
                Ok(Self::Constant { value: *value })
            }
            (
                Self::Min {
                    value: a,
                    samples: sa,
                },
                Self::Min {
                    value: b,
                    samples: sb,
                },
            ) => Ok(Self::Min {
                value: merge_leaf_value(*a, *b, f64::min),
                samples: merge_samples(sa, sb),
            }),
            (
                Self::Max {
                    value: a,
                    samples: sa,
                },
                Self::Max {
                    value: b,
                    samples: sb,
                },
            ) => Ok(Self::Max {
                value: merge_leaf_value(*a, *b, f64::max),
                samples: merge_samples(sa, sb),
            }),
            (
                Self::Sum {
                    value: a,
                    samples: sa,
                },
                Self::Sum {
                    value: b,
                    samples: sb,
                },
            ) => Ok(Self::Sum {
                value: merge_leaf_value(*a, *b, |x, y| x + y),
                samples: merge_samples(sa, sb),
            }),
            (
                Self::Average {
                    average: a,
                    count: ca,
                    samples: sa,
                },
                Self::Average {
                    average: b,
                    count: cb,
                    samples: sb,
                },
            ) => {
                // Count-weighted combination; an unset side never counts as
                // zero, it simply yields the other side.
                let (average, count) = match (a, b) {
                    (Some(a), Some(b)) => {
                        let total = ca + cb;
                        let weighted = (a * *ca as f64 + b * *cb as f64) / total as f64;
                        (Some(weighted), total)
                    }
                    (Some(v), None) => (Some(*v), *ca),
                    (None, Some(v)) => (Some(*v), *cb),
                    (None, None) => (None, 0),
                };
                Ok(Self::Average {
                    average,
                    count,
                    samples: merge_samples(sa, sb),
                })
            }
            (Self::If { test, body, orelse }, Self::If { test: t2, body: b2, orelse: o2 }) => {
                Ok(Self::If {
                    test: Box::new(test.merge(t2)?),
                    body: Box::new(body.merge(b2)?),
                    orelse: Box::new(orelse.merge(o2)?),
                })
            }
            (Self::Table { columns: a }, Self::Table { columns: b }) => {
                if a.len() != b.len() || a.keys().zip(b.keys()).any(|(ka, kb)| ka != kb) {
                    return Err(AggError::TableShape {
                        detail: format!(
                            "column names differ: [{}] vs [{}]",
                            a.keys().cloned().collect::<Vec<_>>().join(", "),
                            b.keys().cloned().collect::<Vec<_>>().join(", ")
                        ),
                    });
                }
                let mut columns = BTreeMap::new();
                for ((name, rows_a), rows_b) in a.iter().zip(b.values()) {
                    if rows_a.len() != rows_b.len() {
                        return Err(AggError::TableShape {
                            detail: format!(
                                "column '{name}' has {} rows on one side and {} on the other",
                                rows_a.len(),
                                rows_b.len()
                            ),
                        });
                    }
                    let rows = rows_a
                        .iter()
                        .zip(rows_b)
                        .map(|(ra, rb)| ra.merge(rb))
                        .collect::<Result<Vec<_>, _>>()?;
                    columns.insert(name.clone(), rows);
                }
                Ok(Self::Table { columns })
            }
            _ => {
                let (Some((la, ra)), Some((lb, rb))) = (self.children(), newer.children()) else {
                    return Err(mismatch());
                };
                if std::mem::discriminant(self) != std::mem::discriminant(newer) {
                    return Err(mismatch());
                }
                Ok(self.rebuild(la.merge(lb)?, ra.merge(rb)?))
            }
        }
    }

    fn value(&self) -> Option<AggValue> {
        match self {
            Self::Constant { value } => Some(AggValue::Number(*value)),
            Self::Min { value, .. } | Self::Max { value, .. } | Self::Sum { value, .. } => {
                value.map(AggValue::Number)
            }
            Self::Average { average, .. } => average.map(AggValue::Number),
            Self::If { test, body, orelse } => {
                if test.value()?.is_truthy() {
                    body.value()
                } else {
                    orelse.value()
                }
            }
            Self::Table { columns } => {
                let out = columns
                    .iter()
                    .map(|(name, rows)| {
                        (
                            name.clone(),
                            rows.iter().filter_map(Aggregation::value).collect(),
                        )
                    })
                    .collect();
                Some(AggValue::Table(out))
            }
            _ => {
                let (left, right) = self.children()?;
                let lhs = left.value()?.as_number()?;
                let rhs = right.value()?.as_number()?;
                if let Some(op) = self.combine_op() {
                    Some(AggValue::Number(op.apply(lhs, rhs)))
                } else {
                    let op = self.comparison_op()?;
                    Some(AggValue::Bool(op.holds(lhs, rhs)))
                }
            }
        }
    }

    fn nearest_value(&self, ts_ms: TimestampMs) -> Result<f64, AggError> {
        match self {
            Self::Constant { value } => Ok(*value),
            Self::Min { value, samples }
            | Self::Max { value, samples }
            | Self::Sum { value, samples } => nearest_in(samples, ts_ms, *value),
            Self::Average {
                average, samples, ..
            } => nearest_in(samples, ts_ms, *average),
            Self::If { test, body, orelse } => {
                if is_truthy(test.nearest_value(ts_ms)?) {
                    body.nearest_value(ts_ms)
                } else {
                    orelse.nearest_value(ts_ms)
                }
            }
            Self::Table { .. } => Err(AggError::TableSelection),
            _ => {
                let (left, right) = self
                    .children()
                    .expect("non-leaf non-if non-table nodes are binary composites");
                let lhs = left.nearest_value(ts_ms)?;
                let rhs = right.nearest_value(ts_ms)?;
                if let Some(op) = self.combine_op() {
                    Ok(op.apply(lhs, rhs))
                } else {
                    let op = self
                        .comparison_op()
                        .expect("binary composite is arithmetic or comparison");
                    Ok(f64::from(op.holds(lhs, rhs)))
                }
            }
        }
    }
}

fn nearest_in(
    samples: &[Sample],
    ts_ms: TimestampMs,
    fallback: Option<f64>,
) -> Result<f64, AggError> {
    samples
        .iter()
        .min_by_key(|s| (s.ts_ms - ts_ms).abs())
        .map(|s| s.value)
        .or(fallback)
        .ok_or(AggError::Unpopulated)
}

/// One branch of a when-selection.
#[derive(Debug, Clone, Copy)]
pub enum Selectable<'a> {
    Series(&'a Series),
    Aggregation(&'a Aggregation),
    Number(f64),
}

impl<'a> Selectable<'a> {
    fn pick(&self, position: usize, ts_ms: TimestampMs, test_len: usize) -> Result<f64, AggError> {
        match self {
            Self::Series(series) => {
                let samples = series.samples();
                if series.is_windowed() || samples.len() != test_len {
                    return Err(AggError::BranchLength {
                        expected: test_len,
                        actual: samples.len(),
                    });
                }
                Ok(samples[position].value)
            }
            Self::Aggregation(agg) => agg.nearest_value(ts_ms),
            Self::Number(v) => Ok(*v),
        }
    }
}

/// Per-sample conditional selection over a flat test series: truthy test
/// samples pick from `body`, the rest from `orelse`. Series branches align
/// positionally, aggregation branches supply their nearest-time value, and
/// numbers broadcast. Both branches are materialized before selection; there
/// is no short-circuit at series level.
pub fn select(
    test: &Series,
    body: Selectable<'_>,
    orelse: Selectable<'_>,
) -> Result<Series, AggError> {
    if test.is_windowed() {
        return Err(AggError::WindowedTest);
    }
    let test_samples = test.samples();
    let mut out = Vec::with_capacity(test_samples.len());
    for (position, sample) in test_samples.iter().enumerate() {
        let branch = if is_truthy(sample.value) { &body } else { &orelse };
        let value = branch.pick(position, sample.ts_ms, test_samples.len())?;
        out.push(Sample::new(sample.ts_ms, value));
    }
    Ok(Series::from_samples(out)?)
}
