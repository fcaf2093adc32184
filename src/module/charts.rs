//! Chart, dimension and variable definitions.
//!
//! Mirrors the host's chart model: a chart owns dimensions and chart-scoped
//! variables, and carries the emission state the job wrapper maintains
//! (created / updated / marked for removal).

use strum_macros::Display;
use thiserror::Error;

/// Chart rendering type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChartType {
    #[default]
    Line,
    Area,
    Stacked,
}

/// Dimension value algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum DimAlgo {
    #[default]
    #[strum(serialize = "absolute")]
    Absolute,
    #[strum(serialize = "incremental")]
    Incremental,
    #[strum(serialize = "percentage-of-absolute-row")]
    PercentOfAbsolute,
    #[strum(serialize = "percentage-of-incremental-row")]
    PercentOfIncremental,
}

/// Chart-level options rendered into the CHART directive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChartOpts {
    pub obsolete: bool,
    pub detail: bool,
    pub store_first: bool,
    pub hidden: bool,
}

impl std::fmt::Display for ChartOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opts = Vec::with_capacity(4);
        if self.obsolete {
            opts.push("obsolete");
        }
        if self.detail {
            opts.push("detail");
        }
        if self.store_first {
            opts.push("store_first");
        }
        if self.hidden {
            opts.push("hidden");
        }
        write!(f, "{}", opts.join(" "))
    }
}

/// One chart definition plus its emission state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chart {
    pub id: String,
    /// Overrides the job-derived type id when set.
    pub type_id: String,
    pub over_id: String,
    pub title: String,
    pub units: String,
    pub family: String,
    pub context: String,
    pub chart_type: ChartType,
    /// 0 means "assign from the job's priority counter".
    pub priority: i64,
    pub opts: ChartOpts,
    pub dims: Vec<Dim>,
    pub vars: Vec<Var>,

    pub(crate) created: bool,
    pub(crate) updated: bool,
    pub(crate) marked_remove: bool,
}

impl Chart {
    /// Flag the chart for removal; the job emits one final obsolete CHART
    /// directive and drops it on the next run.
    pub fn mark_remove(&mut self) {
        self.marked_remove = true;
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

/// One dimension of a chart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dim {
    pub id: String,
    pub name: String,
    pub algo: DimAlgo,
    /// 0 renders as empty (host default).
    pub mul: i64,
    /// 0 renders as empty (host default).
    pub div: i64,
    pub hidden: bool,
}

impl Dim {
    pub fn new(id: impl Into<String>) -> Self {
        Dim {
            id: id.into(),
            ..Dim::default()
        }
    }
}

/// A chart-scoped variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Var {
    pub id: String,
    pub value: i64,
}

/// Structural problems that make a chart set unusable.
#[derive(Debug, Error)]
pub enum ChartsError {
    #[error("chart has an empty id")]
    EmptyChartId,

    #[error("chart '{0}': empty {1}")]
    EmptyField(String, &'static str),

    #[error("duplicate chart id '{0}'")]
    DuplicateChart(String),

    #[error("chart '{0}': dimension has an empty id")]
    EmptyDimId(String),

    #[error("chart '{0}': duplicate dimension id '{1}'")]
    DuplicateDim(String, String),
}

/// An ordered set of charts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Charts {
    charts: Vec<Chart>,
}

impl Charts {
    pub fn new() -> Self {
        Charts::default()
    }

    pub fn add(&mut self, chart: Chart) {
        self.charts.push(chart);
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Chart> {
        self.charts.iter_mut().find(|c| c.id == id)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.charts.len();
        self.charts.retain(|c| c.id != id);
        self.charts.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chart> {
        self.charts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chart> {
        self.charts.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.charts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charts.is_empty()
    }

    /// Validate chart and dimension ids: non-empty, unique, with title and
    /// units present on every chart.
    pub fn check(&self) -> Result<(), ChartsError> {
        let mut seen = std::collections::HashSet::new();
        for chart in &self.charts {
            if chart.id.is_empty() {
                return Err(ChartsError::EmptyChartId);
            }
            if chart.title.is_empty() {
                return Err(ChartsError::EmptyField(chart.id.clone(), "title"));
            }
            if chart.units.is_empty() {
                return Err(ChartsError::EmptyField(chart.id.clone(), "units"));
            }
            if !seen.insert(&chart.id) {
                return Err(ChartsError::DuplicateChart(chart.id.clone()));
            }
            let mut dims = std::collections::HashSet::new();
            for dim in &chart.dims {
                if dim.id.is_empty() {
                    return Err(ChartsError::EmptyDimId(chart.id.clone()));
                }
                if !dims.insert(&dim.id) {
                    return Err(ChartsError::DuplicateDim(chart.id.clone(), dim.id.clone()));
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<Chart> for Charts {
    fn from_iter<T: IntoIterator<Item = Chart>>(iter: T) -> Self {
        Charts {
            charts: iter.into_iter().collect(),
        }
    }
}
