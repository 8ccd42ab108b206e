//! Iteration reporting.
//!
//! The controller reports one [`IterationRecord`] per outer step and the
//! [`EventRelay`] forwards the line search's start and iteration
//! notifications as records tagged [`Phase::LineOptimizing`]. Observers only
//! ever see these records.

use std::fmt;

use crate::config::LevelConfig;
use crate::controller::{IterationState, LevelSummary};
use crate::lbfgs::euclidean_norm;
use crate::line_search::{LineSearchEvents, WolfeLineSearch};

/// Which loop produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Main,
    LineOptimizing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Main => f.write_str("Main"),
            Phase::LineOptimizing => f.write_str("LineOptimizing"),
        }
    }
}

/// Position inside a line search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchStep {
    /// The search has just been entered.
    Start,
    /// Inner iteration index. Main-phase records carry the index of the last
    /// inner iteration of the preceding search.
    Iteration(usize),
}

impl fmt::Display for LineSearchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineSearchStep::Start => f.write_str("start"),
            LineSearchStep::Iteration(n) => write!(f, "{n}"),
        }
    }
}

/// One row of the iteration report.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub search_direction_number: usize,
    pub line_search_iteration: LineSearchStep,
    pub metric_value: f64,
    pub step_length: f64,
    pub gradient_norm: f64,
    pub search_direction_norm: f64,
    pub directional_derivative: f64,
    pub phase: Phase,
    pub wolfe1: bool,
    pub wolfe2: bool,
}

/// Receives the iteration report of a run.
pub trait IterationObserver {
    fn on_iteration(&mut self, record: &IterationRecord);

    /// Called after a level's configuration has been applied.
    fn on_level_start(&mut self, _: usize, _: &LevelConfig) {}

    /// Called once a level has stopped.
    fn on_level_end(&mut self, _: &LevelSummary) {}
}

/// Discards every record.
impl IterationObserver for () {
    fn on_iteration(&mut self, _: &IterationRecord) {}
}

/// Collects every record.
impl IterationObserver for Vec<IterationRecord> {
    fn on_iteration(&mut self, record: &IterationRecord) {
        self.push(record.clone());
    }
}

/// Writes the iteration report as a tab-separated table through `log::info!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver {
    rows: usize,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn header() -> &'static str {
        "1a:SrchDirNr\t1b:LineItNr\t2:Metric\t3:StepLength\t4a:||Gradient||\t4b:||SearchDir||\t4c:DirGradient\t5:Phase\t6a:Wolfe1\t6b:Wolfe2"
    }

    pub fn format_row(record: &IterationRecord) -> String {
        format!(
            "{}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{}\t{}\t{}",
            record.search_direction_number,
            record.line_search_iteration,
            record.metric_value,
            record.step_length,
            record.gradient_norm,
            record.search_direction_norm,
            record.directional_derivative,
            record.phase,
            record.wolfe1,
            record.wolfe2
        )
    }
}

impl IterationObserver for LogObserver {
    fn on_iteration(&mut self, record: &IterationRecord) {
        self.rows += 1;
        log::info!("{}", Self::format_row(record));
    }

    fn on_level_start(&mut self, level: usize, config: &LevelConfig) {
        log::info!(
            "Resolution: {level} (MaximumNumberOfIterations = {}, LBFGSUpdateAccuracy = {})",
            config.max_iterations,
            config.update_accuracy
        );
        log::info!("{}", Self::header());
    }

    fn on_level_end(&mut self, summary: &LevelSummary) {
        log::info!("Stopping condition: {}.", summary.stop_condition);
    }
}

/// Adapts line-search notifications to the outer observer.
///
/// On the start notification it raises the start-of-line-search flag for the
/// duration of the forwarded record and caches the direction magnitude in the
/// controller's iteration state.
pub struct EventRelay<'a> {
    state: &'a mut IterationState,
    sink: &'a mut dyn IterationObserver,
}

impl<'a> EventRelay<'a> {
    pub fn new(state: &'a mut IterationState, sink: &'a mut dyn IterationObserver) -> Self {
        Self { state, sink }
    }

    fn forward(&mut self, step: LineSearchStep, search: &WolfeLineSearch) {
        let diag = search.diagnostics();
        let record = IterationRecord {
            search_direction_number: self.state.current_iteration,
            line_search_iteration: step,
            metric_value: diag.value,
            step_length: diag.step_length,
            gradient_norm: diag.gradient_norm(),
            search_direction_norm: self.state.search_direction_magnitude,
            directional_derivative: diag.directional_derivative,
            phase: Phase::LineOptimizing,
            wolfe1: diag.sufficient_decrease,
            wolfe2: diag.curvature,
        };
        self.sink.on_iteration(&record);
    }
}

impl LineSearchEvents for EventRelay<'_> {
    fn on_search_start(&mut self, search: &WolfeLineSearch) {
        self.state.start_of_line_search = true;
        self.state.search_direction_magnitude = euclidean_norm(search.direction());
        self.forward(LineSearchStep::Start, search);
        self.state.start_of_line_search = false;
    }

    fn on_search_iteration(&mut self, search: &WolfeLineSearch) {
        self.state.start_of_line_search = false;
        let step = LineSearchStep::Iteration(search.diagnostics().iteration);
        self.forward(step, search);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        EventRelay, IterationObserver, IterationRecord, LineSearchStep, LogObserver, Phase,
    };
    use crate::controller::IterationState;
    use crate::error::MetricError;
    use crate::line_search::WolfeLineSearch;
    use ndarray::{Array1, array};
    use spectral::prelude::*;

    #[test]
    fn test_relay_tags_line_search_records() {
        let mut oracle = |x: &Array1<f64>| -> Result<(f64, Array1<f64>), MetricError> {
            Ok((x.dot(x), 2.0 * x))
        };
        let x0 = array![3.0, 4.0];
        let (f0, g0) = oracle(&x0).unwrap();
        let d = array![-0.6, -0.8];

        let mut state = IterationState {
            current_iteration: 7,
            ..IterationState::default()
        };
        let mut records: Vec<IterationRecord> = Vec::new();
        let mut search = WolfeLineSearch::new();
        let outcome = {
            let mut relay = EventRelay::new(&mut state, &mut records);
            search.search(&mut oracle, &x0, &d, f0, &g0, &mut relay).unwrap()
        };

        assert_eq!(records.len(), outcome.iterations + 1);
        assert_eq!(records[0].line_search_iteration, LineSearchStep::Start);
        assert_that!(&records[0].metric_value).is_close_to(25.0, 1e-12);
        assert_eq!(records[1].line_search_iteration, LineSearchStep::Iteration(1));
        for record in records.iter() {
            assert_eq!(record.phase, Phase::LineOptimizing);
            assert_eq!(record.search_direction_number, 7);
            assert_that!(&record.search_direction_norm).is_close_to(1.0, 1e-12);
        }
        assert!(!state.start_of_line_search);
        assert_that!(&state.search_direction_magnitude).is_close_to(1.0, 1e-12);
    }

    #[test]
    fn test_single_start_record_per_search() {
        let mut oracle = |x: &Array1<f64>| -> Result<(f64, Array1<f64>), MetricError> {
            Ok(((x[0] - 3.0).powi(2), array![2.0 * (x[0] - 3.0)]))
        };
        let x0 = array![0.0];
        let (f0, g0) = oracle(&x0).unwrap();
        let mut state = IterationState::default();
        let mut records: Vec<IterationRecord> = Vec::new();
        let mut search = WolfeLineSearch::new();
        let config = crate::config::LevelConfig::default().with_wolfe_tolerances(1e-4, 0.1);
        search.configure(&config);
        let outcome = {
            let mut relay = EventRelay::new(&mut state, &mut records);
            search
                .search(&mut oracle, &x0, &array![1.0], f0, &g0, &mut relay)
                .unwrap()
        };
        let starts = records
            .iter()
            .filter(|r| r.line_search_iteration == LineSearchStep::Start)
            .count();
        assert_eq!(starts, 1);
        assert_eq!(
            records.last().map(|r| r.line_search_iteration),
            Some(LineSearchStep::Iteration(outcome.iterations))
        );
        assert!(records.last().is_some_and(|r| r.wolfe1 && r.wolfe2));
        assert!(!state.start_of_line_search);
    }

    #[test]
    fn test_log_rows_follow_header_columns() {
        let record = IterationRecord {
            search_direction_number: 2,
            line_search_iteration: LineSearchStep::Start,
            metric_value: 1.5,
            step_length: 0.25,
            gradient_norm: 3.0,
            search_direction_norm: 1.0,
            directional_derivative: -2.0,
            phase: Phase::LineOptimizing,
            wolfe1: true,
            wolfe2: false,
        };
        let row = LogObserver::format_row(&record);
        assert_eq!(
            row.split('\t').count(),
            LogObserver::header().split('\t').count()
        );
        assert!(row.starts_with("2\tstart\t1.500000\t0.250000"));
        assert!(row.ends_with("LineOptimizing\ttrue\tfalse"));

        let mut observer = LogObserver::new();
        observer.on_iteration(&record);
        assert_eq!(observer.rows(), 1);
    }
}
