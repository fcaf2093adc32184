//! Line-oriented plugin output protocol.
//!
//! One directive per line, written to the stream shared with the parent
//! host process. The job wrapper renders into a private buffer and flushes
//! each complete `BEGIN … END` block contiguously.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::module::charts::{ChartOpts, ChartType, DimAlgo};

/// The stream shared by every job and the keep-alive writer.
pub type SharedOutput = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn shared_output(out: impl Write + Send + 'static) -> SharedOutput {
    Arc::new(Mutex::new(Box::new(out)))
}

/// Renders protocol directives into the wrapped writer.
#[derive(Debug)]
pub struct ApiWriter<W: Write> {
    out: W,
}

impl<W: Write> ApiWriter<W> {
    pub fn new(out: W) -> Self {
        ApiWriter { out }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Define a chart.
    #[allow(clippy::too_many_arguments)]
    pub fn chart(
        &mut self,
        type_id: &str,
        id: &str,
        name: &str,
        title: &str,
        units: &str,
        family: &str,
        context: &str,
        chart_type: ChartType,
        priority: i64,
        update_every: i64,
        opts: ChartOpts,
        plugin: &str,
        module: &str,
    ) -> io::Result<()> {
        writeln!(
            self.out,
            "CHART '{}.{}' '{}' '{}' '{}' '{}' '{}' '{}' '{}' '{}' '{}' '{}' '{}'",
            type_id, id, name, title, units, family, context, chart_type, priority, update_every,
            opts, plugin, module,
        )
    }

    /// Define a dimension for the last defined chart.
    pub fn dimension(
        &mut self,
        id: &str,
        name: &str,
        algo: DimAlgo,
        mul: i64,
        div: i64,
        hidden: bool,
    ) -> io::Result<()> {
        writeln!(
            self.out,
            "DIMENSION '{}' '{}' '{}' '{}' '{}' '{}'",
            id,
            name,
            algo,
            non_zero(mul),
            non_zero(div),
            if hidden { "hidden" } else { "" },
        )
    }

    /// Initialize data collection for a chart.
    pub fn begin(&mut self, type_id: &str, id: &str, ms_since: i64) -> io::Result<()> {
        if ms_since > 0 {
            writeln!(self.out, "BEGIN {}.{} {}", type_id, id, ms_since)
        } else {
            writeln!(self.out, "BEGIN {}.{}", type_id, id)
        }
    }

    /// Set the value of a dimension for the initialized chart.
    pub fn dim_set(&mut self, id: &str, value: i64) -> io::Result<()> {
        writeln!(self.out, "SET {} = {}", id, value)
    }

    /// Set the empty value of a dimension for the initialized chart.
    pub fn dim_set_empty(&mut self, id: &str) -> io::Result<()> {
        writeln!(self.out, "SET {} = ", id)
    }

    /// Set the value of a chart-scoped variable.
    pub fn var_set(&mut self, id: &str, value: i64) -> io::Result<()> {
        writeln!(self.out, "VARIABLE CHART {} = {}", id, value)
    }

    /// Complete data collection for the initialized chart.
    pub fn end(&mut self) -> io::Result<()> {
        writeln!(self.out, "END\n")
    }

    /// Discard the last collected values.
    pub fn flush(&mut self) -> io::Result<()> {
        writeln!(self.out, "FLUSH")
    }

    /// Ask the host to disable this plugin.
    pub fn disable(&mut self) -> io::Result<()> {
        writeln!(self.out, "DISABLE")
    }

    /// Keep-alive: a single blank line.
    pub fn empty_line(&mut self) -> io::Result<()> {
        writeln!(self.out)
    }
}

fn non_zero(value: i64) -> String {
    if value == 0 {
        String::new()
    } else {
        value.to_string()
    }
}
