// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use anyhow::Result;
use qbench::VariableExpander;

use crate::common::DriverContext;

/// Print every benchmark the config can see with its execution count.
pub fn list_command(context: &DriverContext, out: &mut impl Write) -> Result<()> {
    for benchmark in context.loader().load(&[])? {
        let combinations = VariableExpander::new(&benchmark.variables)?
            .combination_count()
            .max(1);
        let executions = combinations * benchmark.runs * benchmark.queries.len();
        writeln!(
            out,
            "{} datasource={} queries={} executions={}",
            benchmark.name,
            benchmark.data_source,
            benchmark.queries.join(","),
            executions
        )?;
    }
    Ok(())
}
