#![forbid(unsafe_code)]

//! Streaming KPI computation over time-series signal data.
//!
//! Signals arrive in chunks too large to hold in memory at once. KPI
//! definitions are written in a small case-insensitive expression language,
//! compiled once, and evaluated chunk by chunk in dependency order:
//!
//! - [`Series`] carries ordered samples with window remainders flowing
//!   between chunks,
//! - [`Aggregation`] accumulates mergeable partial results (min, max, sum,
//!   count-weighted averages, composite arithmetic, tables),
//! - [`BatchProcess`] parses, orders, and schedules the KPI set, rejecting
//!   cycles before any data flows.
//!
//! ```
//! use kpiflow::{BatchProcess, Chunk, Compiler, KpiDefinition, Sample};
//!
//! let definitions = vec![
//!     KpiDefinition::new("load_2s", "average(window(load, '2s'))"),
//!     KpiDefinition::new("peak", "max(load)"),
//! ];
//! let mut batch = BatchProcess::new(definitions, &Compiler::new())?;
//! let chunk = Chunk::new().with_signal(
//!     "load",
//!     vec![Sample::new(0, 0.4), Sample::new(1_000, 0.9), Sample::new(2_000, 0.7)],
//! );
//! batch.process_chunk(&chunk)?;
//! let report = batch.report();
//! assert!(report.contains_key("peak"));
//! # Ok::<(), kpiflow::BatchError>(())
//! ```

pub use kf_agg::{AggError, AggValue, Aggregation, Selectable, select};
pub use kf_expr::{
    BuiltinTable, Compiler, EagerBuiltin, Environment, EvalError, Expr, LazyBuiltin,
    NOTHING_IDENTIFIER, Reader, SyntaxError, Thunk, Transformer, Value, compile, parse,
};
pub use kf_graph::{
    BatchError, BatchProcess, Chunk, GraphError, KpiDefinition, KpiGraph, MappingValue,
    ReportValue,
};
pub use kf_series::{ComparisonOp, PointwiseOp, Series, SeriesError, thd_of_window};
pub use kf_types::{
    Sample, TimeError, TimestampMs, duration_width_ms, is_truthy, parse_duration_literal,
};
