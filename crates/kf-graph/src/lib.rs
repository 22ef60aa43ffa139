#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use kf_agg::{AggError, AggValue, Aggregation};
use kf_expr::{
    Compiler, Environment, EvalError, NOTHING_IDENTIFIER, Reader, SyntaxError, Value, parse,
};
use kf_series::SeriesError;
use kf_types::{Sample, parse_duration_literal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown vertex '{name}'")]
    UnknownVertex { name: String },
    #[error("cyclic dependency among: {}", vertices.join(", "))]
    CyclicDependency { vertices: Vec<String> },
}

/// Directed dependency graph over KPI names. An edge `A -> B` means B
/// consumes A's output, so A must be computed first. Registration order is
/// retained and breaks ordering ties, keeping the schedule deterministic.
#[derive(Debug, Clone, Default)]
pub struct KpiGraph {
    names: Vec<String>,
    index: BTreeMap<String, usize>,
    outgoing: Vec<BTreeSet<usize>>,
    incoming: Vec<BTreeSet<usize>>,
}

impl KpiGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vertex; re-adding an existing name is a no-op.
    pub fn add_vertex(&mut self, name: &str) {
        let key = name.to_uppercase();
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key, self.names.len());
        self.names.push(name.to_owned());
        self.outgoing.push(BTreeSet::new());
        self.incoming.push(BTreeSet::new());
    }

    fn resolve(&self, name: &str) -> Result<usize, GraphError> {
        self.index
            .get(&name.to_uppercase())
            .copied()
            .ok_or_else(|| GraphError::UnknownVertex {
                name: name.to_owned(),
            })
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        self.outgoing[from].insert(to);
        self.incoming[to].insert(from);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_uppercase())
    }

    #[must_use]
    pub fn vertices(&self) -> &[String] {
        &self.names
    }

    /// Kahn's algorithm over a cloned in-degree map, so ordering leaves the
    /// graph untouched. Ties go to the earlier-registered vertex. A cycle is
    /// reported with the vertices still holding edges.
    pub fn topological_ordering(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: Vec<usize> = self.incoming.iter().map(BTreeSet::len).collect();
        let mut emitted = vec![false; self.names.len()];
        let mut order = Vec::with_capacity(self.names.len());

        while order.len() < self.names.len() {
            let Some(next) = (0..self.names.len()).find(|&i| !emitted[i] && in_degree[i] == 0)
            else {
                let vertices = (0..self.names.len())
                    .filter(|&i| !emitted[i])
                    .map(|i| self.names[i].clone())
                    .collect();
                return Err(GraphError::CyclicDependency { vertices });
            };
            emitted[next] = true;
            order.push(self.names[next].clone());
            for &successor in &self.outgoing[next] {
                in_degree[successor] -= 1;
            }
        }
        Ok(order)
    }

    /// Sub-graph of everything the targets depend on, walking incoming edges
    /// backward from each target.
    pub fn prune(&self, targets: &[&str]) -> Result<Self, GraphError> {
        let mut keep = BTreeSet::new();
        let mut stack = Vec::new();
        for target in targets {
            stack.push(self.resolve(target)?);
        }
        while let Some(vertex) = stack.pop() {
            if !keep.insert(vertex) {
                continue;
            }
            stack.extend(self.incoming[vertex].iter().copied());
        }

        let mut pruned = Self::new();
        for (i, name) in self.names.iter().enumerate() {
            if keep.contains(&i) {
                pruned.add_vertex(name);
            }
        }
        for &from in &keep {
            for &to in &self.outgoing[from] {
                if keep.contains(&to) {
                    pruned.add_edge(&self.names[from], &self.names[to])?;
                }
            }
        }
        Ok(pruned)
    }
}

/// Values an identifier can be mapped to in a KPI definition: a numeric
/// constant, or a text that is either a duration literal, a signal name, or
/// another KPI's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiDefinition {
    pub name: String,
    pub expression: String,
    /// Identifier -> substitution. Identifiers absent from the mapping
    /// default to themselves.
    #[serde(default)]
    pub mapping: BTreeMap<String, MappingValue>,
}

impl KpiDefinition {
    #[must_use]
    pub fn new(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_owned(),
            expression: expression.to_owned(),
            mapping: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn map_number(mut self, identifier: &str, value: f64) -> Self {
        self.mapping
            .insert(identifier.to_owned(), MappingValue::Number(value));
        self
    }

    #[must_use]
    pub fn map_text(mut self, identifier: &str, text: &str) -> Self {
        self.mapping
            .insert(identifier.to_owned(), MappingValue::Text(text.to_owned()));
        self
    }
}

/// One slice of raw signal data, keyed by signal name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub signals: BTreeMap<String, Vec<Sample>>,
}

impl Chunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_signal(mut self, name: &str, samples: Vec<Sample>) -> Self {
        self.signals.insert(name.to_owned(), samples);
        self
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("KPI '{name}' failed to parse: {source}")]
    Parse { name: String, source: SyntaxError },
    #[error("duplicate KPI name '{name}'")]
    DuplicateKpi { name: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("KPI '{name}' failed: {source}")]
    Eval { name: String, source: EvalError },
    #[error("KPI '{name}' produced an unsupported {kind} result")]
    UnsupportedResult { name: String, kind: &'static str },
    #[error(transparent)]
    Agg(#[from] AggError),
    #[error(transparent)]
    Series(#[from] SeriesError),
}

/// Final output of a batch, per KPI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReportValue {
    Series(Vec<Sample>),
    Scalar(AggValue),
}

#[derive(Debug)]
struct KpiState {
    definition: KpiDefinition,
    reader: Reader,
    /// Uppercased mapping keys for case-insensitive identifier resolution.
    mapping: BTreeMap<String, MappingValue>,
    series_out: Vec<Sample>,
    aggregation: Option<Aggregation>,
    window_carry: Vec<Sample>,
}

/// Chunked KPI scheduler. Construction parses, compiles, and orders every
/// KPI; a cycle or a syntax error is rejected before any data flows. Each
/// `process_chunk` call evaluates every KPI in topological order and folds
/// the result into per-KPI running state: series output accumulates sample
/// by sample (with window remainders carried to the next chunk), and
/// aggregation output merges exactly once per chunk, in chunk-arrival order.
#[derive(Debug)]
pub struct BatchProcess {
    states: BTreeMap<String, KpiState>,
    graph: KpiGraph,
    order: Vec<String>,
    chunks_processed: u64,
}

impl BatchProcess {
    pub fn new(definitions: Vec<KpiDefinition>, compiler: &Compiler) -> Result<Self, BatchError> {
        let mut states = BTreeMap::new();
        let mut graph = KpiGraph::new();

        for definition in &definitions {
            let key = definition.name.to_uppercase();
            if states.contains_key(&key) {
                return Err(BatchError::DuplicateKpi {
                    name: definition.name.clone(),
                });
            }
            let expr = parse(&definition.expression).map_err(|source| BatchError::Parse {
                name: definition.name.clone(),
                source,
            })?;
            let reader = compiler.compile(&expr);
            let mapping = definition
                .mapping
                .iter()
                .map(|(k, v)| (k.to_uppercase(), v.clone()))
                .collect();
            graph.add_vertex(&definition.name);
            states.insert(
                key,
                KpiState {
                    definition: definition.clone(),
                    reader,
                    mapping,
                    series_out: Vec::new(),
                    aggregation: None,
                    window_carry: Vec::new(),
                },
            );
        }

        // Any identifier that resolves (through its KPI's mapping) to a
        // registered KPI name is a dependency edge.
        for state in states.values() {
            for identifier in state.reader.identifiers() {
                if let Some(upstream) = resolve_name(&state.mapping, identifier)
                    && graph.contains(&upstream)
                {
                    graph.add_edge(&upstream, &state.definition.name)?;
                }
            }
        }

        let order = graph.topological_ordering()?;
        Ok(Self {
            states,
            graph,
            order,
            chunks_processed: 0,
        })
    }

    #[must_use]
    pub fn graph(&self) -> &KpiGraph {
        &self.graph
    }

    /// KPI names in evaluation order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn chunks_processed(&self) -> u64 {
        self.chunks_processed
    }

    /// Raw signal names the given target KPIs need, walking the pruned
    /// dependency graph. Identifiers mapped to numbers or duration literals
    /// are configuration, not inputs; identifiers resolving to other KPIs
    /// are satisfied internally.
    pub fn required_inputs(&self, targets: &[&str]) -> Result<BTreeSet<String>, BatchError> {
        let pruned = self.graph.prune(targets)?;
        let mut inputs = BTreeSet::new();
        for name in pruned.vertices() {
            let state = &self.states[&name.to_uppercase()];
            for identifier in state.reader.identifiers() {
                match state.mapping.get(&identifier.to_uppercase()) {
                    Some(MappingValue::Number(_)) => {}
                    Some(MappingValue::Text(text)) => {
                        if parse_duration_literal(text).is_none() && !self.graph.contains(text) {
                            inputs.insert(text.clone());
                        }
                    }
                    None => {
                        if !self.graph.contains(identifier)
                            && !identifier.eq_ignore_ascii_case(NOTHING_IDENTIFIER)
                        {
                            inputs.insert(identifier.clone());
                        }
                    }
                }
            }
        }
        Ok(inputs)
    }

    /// Evaluate every KPI against one chunk of signal data. Any error aborts
    /// the batch; nothing is retried internally.
    pub fn process_chunk(&mut self, chunk: &Chunk) -> Result<(), BatchError> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            chunk = self.chunks_processed,
            signals = chunk.signals.len(),
            "processing chunk"
        );

        let signals: BTreeMap<String, &Vec<Sample>> = chunk
            .signals
            .iter()
            .map(|(name, samples)| (name.to_uppercase(), samples))
            .collect();

        // Series and aggregation results computed earlier in this chunk,
        // visible to downstream KPIs.
        let mut computed: BTreeMap<String, Value> = BTreeMap::new();

        let order = self.order.clone();
        for name in &order {
            let key = name.to_uppercase();
            let state = self
                .states
                .get_mut(&key)
                .ok_or_else(|| GraphError::UnknownVertex { name: name.clone() })?;

            let env = build_environment(state, &computed, &signals)?;
            let result = state
                .reader
                .run(&env)
                .map_err(|source| BatchError::Eval {
                    name: name.clone(),
                    source,
                })?;

            #[cfg(feature = "tracing")]
            tracing::trace!(kpi = name.as_str(), result = result.kind(), "evaluated");

            match result {
                Value::Series(series) => {
                    state.series_out.extend(series.flattened());
                    state.window_carry = series.carry_out().to_vec();
                    computed.insert(key, Value::Series(series));
                }
                Value::Aggregation(partial) => {
                    let merged = match &state.aggregation {
                        Some(previous) => previous.merge(&partial)?,
                        None => partial,
                    };
                    state.aggregation = Some(merged.clone());
                    computed.insert(key, Value::Aggregation(merged));
                }
                Value::Number(value) => {
                    let constant = Aggregation::constant(value);
                    let merged = match &state.aggregation {
                        Some(previous) => previous.merge(&constant)?,
                        None => constant,
                    };
                    state.aggregation = Some(merged);
                    computed.insert(key, Value::Number(value));
                }
                Value::Nothing => {
                    // Conditional skip: the KPI contributes nothing this
                    // chunk, and dependents see Nothing.
                    computed.insert(key, Value::Nothing);
                }
                Value::Duration(_) | Value::Text(_) => {
                    return Err(BatchError::UnsupportedResult {
                        name: name.clone(),
                        kind: result.kind(),
                    });
                }
            }
        }
        self.chunks_processed += 1;
        Ok(())
    }

    /// Accumulated results per KPI. KPIs whose aggregation never populated
    /// (and which emitted no series samples) are omitted.
    #[must_use]
    pub fn report(&self) -> BTreeMap<String, ReportValue> {
        let mut report = BTreeMap::new();
        for state in self.states.values() {
            if !state.series_out.is_empty() {
                report.insert(
                    state.definition.name.clone(),
                    ReportValue::Series(state.series_out.clone()),
                );
            } else if let Some(value) = state.aggregation.as_ref().and_then(Aggregation::value) {
                report.insert(state.definition.name.clone(), ReportValue::Scalar(value));
            }
        }
        report
    }
}

fn resolve_name(mapping: &BTreeMap<String, MappingValue>, identifier: &str) -> Option<String> {
    match mapping.get(&identifier.to_uppercase()) {
        Some(MappingValue::Number(_)) => None,
        Some(MappingValue::Text(text)) => Some(text.clone()),
        None => Some(identifier.to_owned()),
    }
}

fn build_environment(
    state: &KpiState,
    computed: &BTreeMap<String, Value>,
    signals: &BTreeMap<String, &Vec<Sample>>,
) -> Result<Environment, BatchError> {
    let mut env = Environment::new();
    env.set_window_carry(state.window_carry.clone());

    for identifier in state.reader.identifiers() {
        if identifier.eq_ignore_ascii_case(NOTHING_IDENTIFIER) {
            continue;
        }
        match state.mapping.get(&identifier.to_uppercase()) {
            Some(MappingValue::Number(value)) => {
                env.bind(identifier, Value::Number(*value));
            }
            Some(MappingValue::Text(text)) => {
                if let Some(duration) = parse_duration_literal(text) {
                    env.bind(identifier, Value::Duration(duration));
                } else {
                    bind_resolved(&mut env, identifier, text, computed, signals)?;
                }
            }
            None => {
                bind_resolved(&mut env, identifier, identifier, computed, signals)?;
            }
        }
    }
    Ok(env)
}

/// KPI outputs computed earlier this chunk shadow raw signals of the same
/// name. An unresolvable name is left unbound; the reader reports it with
/// the identifier's original spelling.
fn bind_resolved(
    env: &mut Environment,
    identifier: &str,
    resolved: &str,
    computed: &BTreeMap<String, Value>,
    signals: &BTreeMap<String, &Vec<Sample>>,
) -> Result<(), BatchError> {
    let key = resolved.to_uppercase();
    if let Some(value) = computed.get(&key) {
        env.bind(identifier, value.clone());
    } else if let Some(samples) = signals.get(&key) {
        let series = kf_series::Series::from_samples((*samples).clone())?;
        env.bind(identifier, Value::Series(series));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use kf_expr::Compiler;
    use kf_types::Sample;

    use super::{
        BatchError, BatchProcess, Chunk, GraphError, KpiDefinition, KpiGraph, ReportValue,
    };

    fn samples_1hz(start_ms: i64, values: &[f64]) -> Vec<Sample> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Sample::new(start_ms + i as i64 * 1_000, v))
            .collect()
    }

    #[test]
    fn ordering_respects_edges_and_registration_order() {
        let mut graph = KpiGraph::new();
        for name in ["c", "a", "b"] {
            graph.add_vertex(name);
        }
        graph.add_edge("a", "c").expect("edge");

        // `a` must precede `c`; among ready vertices the earlier-registered
        // one goes first.
        let order = graph.topological_ordering().expect("ordering");
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn ordering_does_not_consume_the_graph() {
        let mut graph = KpiGraph::new();
        graph.add_vertex("x");
        graph.add_vertex("y");
        graph.add_edge("x", "y").expect("edge");

        let first = graph.topological_ordering().expect("ordering");
        let second = graph.topological_ordering().expect("ordering");
        assert_eq!(first, second);
    }

    #[test]
    fn cycles_are_rejected_with_the_offending_vertices() {
        let mut graph = KpiGraph::new();
        for name in ["a", "b", "c"] {
            graph.add_vertex(name);
        }
        graph.add_edge("a", "b").expect("edge");
        graph.add_edge("b", "a").expect("edge");

        let err = graph.topological_ordering().expect_err("cycle");
        let GraphError::CyclicDependency { vertices } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(vertices, vec!["a", "b"]);
    }

    #[test]
    fn prune_keeps_only_what_targets_depend_on() {
        let mut graph = KpiGraph::new();
        for name in ["raw", "derived", "unrelated"] {
            graph.add_vertex(name);
        }
        graph.add_edge("raw", "derived").expect("edge");

        let pruned = graph.prune(&["derived"]).expect("prune");
        assert_eq!(pruned.vertices(), &["raw", "derived"]);
        assert!(!pruned.contains("unrelated"));
    }

    #[test]
    fn unknown_edge_endpoints_are_rejected() {
        let mut graph = KpiGraph::new();
        graph.add_vertex("a");
        let err = graph.add_edge("a", "ghost").expect_err("unknown");
        assert_eq!(
            err,
            GraphError::UnknownVertex {
                name: "ghost".to_owned()
            }
        );
    }

    #[test]
    fn construction_rejects_cyclic_definitions_before_any_chunk() {
        let definitions = vec![
            KpiDefinition::new("first", "second + 1"),
            KpiDefinition::new("second", "first + 1"),
        ];
        let err = BatchProcess::new(definitions, &Compiler::new()).expect_err("cycle");
        assert!(matches!(
            err,
            BatchError::Graph(GraphError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn construction_rejects_duplicate_names_case_insensitively() {
        let definitions = vec![
            KpiDefinition::new("Load", "1"),
            KpiDefinition::new("LOAD", "2"),
        ];
        let err = BatchProcess::new(definitions, &Compiler::new()).expect_err("duplicate");
        assert!(matches!(err, BatchError::DuplicateKpi { ref name } if name == "LOAD"));
    }

    #[test]
    fn parse_failures_name_the_offending_kpi() {
        let definitions = vec![KpiDefinition::new("broken", "import os")];
        let err = BatchProcess::new(definitions, &Compiler::new()).expect_err("syntax");
        assert!(matches!(err, BatchError::Parse { ref name, .. } if name == "broken"));
    }

    #[test]
    fn kpis_feed_each_other_within_a_chunk() {
        let definitions = vec![
            KpiDefinition::new("doubled", "sig * 2"),
            KpiDefinition::new("total", "sum(doubled)"),
        ];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
        let chunk = Chunk::new().with_signal("sig", samples_1hz(0, &[1.0, 2.0, 3.0]));
        batch.process_chunk(&chunk).expect("chunk");

        let report = batch.report();
        assert_eq!(
            report["doubled"],
            ReportValue::Series(samples_1hz(0, &[2.0, 4.0, 6.0]))
        );
        let ReportValue::Scalar(total) = &report["total"] else {
            panic!("expected scalar");
        };
        assert_eq!(total, &kf_agg::AggValue::Number(12.0));
    }

    #[test]
    fn aggregations_merge_across_chunks() {
        let definitions = vec![KpiDefinition::new("mean", "average(sig)")];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");

        batch
            .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(0, &[1.0, 2.0, 3.0, 4.0])))
            .expect("chunk");
        batch
            .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(4_000, &[3.0, 19.0, 2.0])))
            .expect("chunk");

        let report = batch.report();
        let ReportValue::Scalar(kf_agg::AggValue::Number(mean)) = &report["mean"] else {
            panic!("expected number");
        };
        let expected = (1.0 + 2.0 + 3.0 + 4.0 + 3.0 + 19.0 + 2.0) / 7.0;
        assert!((mean - expected).abs() < 1e-12);
    }

    #[test]
    fn window_remainders_carry_between_chunks() {
        let definitions = vec![KpiDefinition::new("avg2s", "average(window(sig, '2s'))")];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");

        // Seven 1s samples split 3/4: chunk one ends mid-window, so its
        // remainder completes with data from chunk two.
        batch
            .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(0, &[1.0, 3.0, 5.0])))
            .expect("chunk");
        batch
            .process_chunk(
                &Chunk::new().with_signal("sig", samples_1hz(3_000, &[7.0, 9.0, 11.0, 13.0])),
            )
            .expect("chunk");

        let report = batch.report();
        let ReportValue::Series(samples) = &report["avg2s"] else {
            panic!("expected series");
        };
        assert_eq!(
            samples,
            &vec![
                Sample::new(0, 2.0),
                Sample::new(2_000, 6.0),
                Sample::new(4_000, 10.0),
            ]
        );
    }

    #[test]
    fn mapped_numbers_and_durations_are_configuration_not_inputs() {
        let definitions = vec![
            KpiDefinition::new("scaled", "average(window(raw, width)) * factor")
                .map_text("raw", "pressure")
                .map_text("width", "2s")
                .map_number("factor", 10.0),
            KpiDefinition::new("shifted", "scaled + offset").map_number("offset", 1.0),
        ];
        let batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");

        let inputs = batch.required_inputs(&["shifted"]).expect("inputs");
        assert_eq!(
            inputs.into_iter().collect::<Vec<_>>(),
            vec!["pressure".to_owned()]
        );
    }

    #[test]
    fn mapping_redirects_identifiers_to_other_kpis() {
        let definitions = vec![
            KpiDefinition::new("base", "sum(sig)"),
            KpiDefinition::new("relay", "upstream").map_text("upstream", "base"),
        ];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
        assert_eq!(batch.order(), &["base", "relay"]);

        batch
            .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(0, &[2.0, 3.0])))
            .expect("chunk");
        let report = batch.report();
        assert_eq!(
            report["relay"],
            ReportValue::Scalar(kf_agg::AggValue::Number(5.0))
        );
    }

    #[test]
    fn nothing_results_skip_the_chunk_and_propagate_to_dependents() {
        let definitions = vec![
            KpiDefinition::new("guard", "1 if enabled else Nothing").map_number("enabled", 0.0),
            KpiDefinition::new("guarded", "guard * average(sig)"),
            KpiDefinition::new("mean", "average(sig)"),
        ];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
        batch
            .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(0, &[5.0, 7.0])))
            .expect("chunk");

        // The guard yields Nothing, so it and everything downstream of it
        // contribute nothing; unrelated KPIs still report.
        let report = batch.report();
        assert!(!report.contains_key("guard"));
        assert!(!report.contains_key("guarded"));
        assert_eq!(
            report["mean"],
            ReportValue::Scalar(kf_agg::AggValue::Number(6.0))
        );
    }

    #[test]
    fn unresolved_identifiers_abort_the_batch() {
        let definitions = vec![KpiDefinition::new("orphan", "average(missing_signal)")];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
        let err = batch
            .process_chunk(&Chunk::new())
            .expect_err("unbound identifier");
        assert!(matches!(err, BatchError::Eval { ref name, .. } if name == "orphan"));
    }

    #[test]
    fn duration_and_text_results_are_rejected() {
        let definitions = vec![KpiDefinition::new("width", "'2s'")];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
        let err = batch.process_chunk(&Chunk::new()).expect_err("unsupported");
        assert!(matches!(
            err,
            BatchError::UnsupportedResult { ref name, kind: "duration" } if name == "width"
        ));
    }

    #[test]
    fn report_serializes_and_omits_unpopulated_kpis() {
        let definitions = vec![
            KpiDefinition::new("mean", "average(sig)"),
            KpiDefinition::new("silent", "average(absent) if 0 else Nothing"),
        ];
        let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
        batch
            .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(0, &[4.0, 6.0])))
            .expect("chunk");

        let report = batch.report();
        assert!(!report.contains_key("silent"));
        let encoded = serde_json::to_string(&report).expect("encode");
        assert!(encoded.contains("\"mean\""));
    }
}
