//! LP emission and external solver driving.
//!
//! The builder talks to the solver through this narrow interface: append constraints in the
//! solver's text format, run the binary on a pair of process-private temp files, and parse
//! the objective value (plus, on demand, the variable values) back out of its output.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

// ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("failed to run {solver}: {source}")]
    Spawn {
        solver: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{solver} exited with status {status}")]
    NonZeroExit { solver: &'static str, status: i32 },
    #[error("{solver} produced no objective value")]
    MissingObjective { solver: &'static str },
    #[error("the linear program has no integer optimal solution")]
    NotOptimal,
    #[error("i/o failure around the solver: {0}")]
    Io(#[from] std::io::Error),
}

// SOLUTION
// ================================================================================================

/// Parsed solver output: the objective value (the WCET bound) and, when requested, the value
/// of every variable of the solution.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub objective: u64,
    pub variables: Vec<(String, u64)>,
}

// SOLVER INTERFACE
// ================================================================================================

/// One supported ILP solver: text format plus process invocation.
pub trait LpSolver {
    fn name(&self) -> &'static str;

    /// Emits `MAXIMIZE sum(coefficient * variable)`.
    fn objective(&self, out: &mut String, terms: &[(String, i64)]);

    /// Emits `vars[0] = vars[1] + ... + vars[n]` (skipped without right-hand variables).
    fn flow_constraint(&self, out: &mut String, vars: &[String]);

    /// Emits `sum(vars) <= bound`.
    fn inequality(&self, out: &mut String, vars: &[String], bound: i64);

    /// Emits `sum(coefficient * variable) <= bound`.
    fn linear_inequality(&self, out: &mut String, terms: &[(String, i64)], bound: i64);

    /// Emits `sum(vars) = bound`.
    fn equality(&self, out: &mut String, vars: &[String], bound: i64);

    /// Emits the integer declarations and whatever trailer the solver needs.
    fn declarations(&self, out: &mut String, vars: &[String]);

    /// Runs the solver on `lp_file`, leaving its raw output in `out_file`.
    fn solve(&self, lp_file: &Path, out_file: &Path) -> Result<(), SolverError>;

    /// Parses the raw output; variable values are only collected when `want_variables`.
    fn parse_output(&self, text: &str, want_variables: bool) -> Result<Solution, SolverError>;
}

fn run_with_stdin(
    solver: &'static str,
    command: &mut Command,
    lp_file: &Path,
) -> Result<(), SolverError> {
    let stdin = fs::File::open(lp_file)?;
    let status = command
        .stdin(Stdio::from(stdin))
        .status()
        .map_err(|source| SolverError::Spawn { solver, source })?;
    if !status.success() {
        return Err(SolverError::NonZeroExit { solver, status: status.code().unwrap_or(-1) });
    }
    Ok(())
}

fn parse_numeric(token: &str) -> Option<u64> {
    token.parse::<f64>().ok().map(|v| v.round() as u64)
}

// LP_SOLVE
// ================================================================================================

pub struct LpSolve;

impl LpSolver for LpSolve {
    fn name(&self) -> &'static str {
        "lp_solve"
    }

    fn objective(&self, out: &mut String, terms: &[(String, i64)]) {
        out.push_str("MAX: \n");
        for (i, (var, coefficient)) in terms.iter().enumerate() {
            let _ = write!(out, "{coefficient}*{var} ");
            if i + 1 < terms.len() {
                out.push_str(" + ");
            } else {
                out.push_str(";\n");
            }
        }
    }

    fn flow_constraint(&self, out: &mut String, vars: &[String]) {
        if vars.len() < 2 {
            return;
        }
        for (i, var) in vars.iter().enumerate().skip(1) {
            out.push_str(var);
            if i + 1 < vars.len() {
                out.push_str(" + ");
            }
        }
        let _ = writeln!(out, " - {} = 0;", vars[0]);
    }

    fn inequality(&self, out: &mut String, vars: &[String], bound: i64) {
        for (i, var) in vars.iter().enumerate() {
            out.push_str(var);
            if i + 1 < vars.len() {
                out.push_str(" + ");
            }
        }
        let _ = writeln!(out, " <= {bound};");
    }

    fn linear_inequality(&self, out: &mut String, terms: &[(String, i64)], bound: i64) {
        for (i, (var, coefficient)) in terms.iter().enumerate() {
            let _ = write!(out, "{coefficient}*{var} ");
            if i + 1 < terms.len() {
                out.push_str(" + ");
            } else {
                out.push_str(" <= ");
            }
        }
        let _ = writeln!(out, "{bound};");
    }

    fn equality(&self, out: &mut String, vars: &[String], bound: i64) {
        for (i, var) in vars.iter().enumerate() {
            out.push_str(var);
            if i + 1 < vars.len() {
                out.push_str(" + ");
            }
        }
        let _ = writeln!(out, " = {bound};");
    }

    fn declarations(&self, out: &mut String, vars: &[String]) {
        out.push_str("int ");
        for (i, var) in vars.iter().enumerate() {
            out.push_str(var);
            if i + 1 < vars.len() {
                out.push_str(", ");
                if i % 10 == 0 {
                    out.push('\n');
                }
            } else {
                out.push_str(";\n");
            }
        }
    }

    fn solve(&self, lp_file: &Path, out_file: &Path) -> Result<(), SolverError> {
        let stdout = fs::File::create(out_file)?;
        run_with_stdin(
            self.name(),
            Command::new("lp_solve").stdout(Stdio::from(stdout)),
            lp_file,
        )
    }

    fn parse_output(&self, text: &str, want_variables: bool) -> Result<Solution, SolverError> {
        let mut objective = None;
        let mut variables = Vec::new();
        for line in text.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                // "Value of objective function: 42"
                ["Value", "of", _, _, value, ..] => {
                    objective = parse_numeric(value);
                },
                [name, value]
                    if want_variables && *name != "Actual" && *name != "Value" =>
                {
                    if let Some(value) = parse_numeric(value) {
                        variables.push((name.to_string(), value));
                    }
                },
                _ => {},
            }
        }
        let objective =
            objective.ok_or(SolverError::MissingObjective { solver: self.name() })?;
        Ok(Solution { objective, variables })
    }
}

// CPLEX
// ================================================================================================

pub struct Cplex;

impl Cplex {
    /// Extracts the first double-quoted value after `key` in `line`.
    fn quoted_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
        let start = line.find(key)? + key.len();
        let rest = &line[start..];
        let open = rest.find('"')? + 1;
        let close = rest[open..].find('"')? + open;
        Some(&rest[open..close])
    }
}

impl LpSolver for Cplex {
    fn name(&self) -> &'static str {
        "cplex"
    }

    fn objective(&self, out: &mut String, terms: &[(String, i64)]) {
        out.push_str("enter wcet\n\nMaximize\nobj: ");
        for (i, (var, coefficient)) in terms.iter().enumerate() {
            let _ = write!(out, "{coefficient} {var} ");
            if i + 1 < terms.len() {
                if terms[i + 1].1 >= 0 {
                    out.push_str(" + ");
                }
            } else {
                out.push('\n');
            }
        }
        out.push_str("\nSubject To\n");
    }

    fn flow_constraint(&self, out: &mut String, vars: &[String]) {
        if vars.len() < 2 {
            return;
        }
        for (i, var) in vars.iter().enumerate().skip(1) {
            out.push_str(var);
            if i + 1 < vars.len() {
                out.push_str(" + ");
            }
        }
        let _ = writeln!(out, " - {} = 0", vars[0]);
    }

    fn inequality(&self, out: &mut String, vars: &[String], bound: i64) {
        for (i, var) in vars.iter().enumerate() {
            out.push_str(var);
            if i + 1 < vars.len() {
                out.push_str(" + ");
            }
        }
        let _ = writeln!(out, " <= {bound}");
    }

    fn linear_inequality(&self, out: &mut String, terms: &[(String, i64)], bound: i64) {
        for (i, (var, coefficient)) in terms.iter().enumerate() {
            let _ = write!(out, "{coefficient} {var} ");
            if i + 1 < terms.len() {
                if terms[i + 1].1 >= 0 {
                    out.push_str(" + ");
                }
            } else {
                out.push_str(" <= ");
            }
        }
        let _ = writeln!(out, "{bound}");
    }

    fn equality(&self, out: &mut String, vars: &[String], bound: i64) {
        for (i, var) in vars.iter().enumerate() {
            out.push_str(var);
            if i + 1 < vars.len() {
                out.push_str(" + ");
            }
        }
        let _ = writeln!(out, " = {bound}");
    }

    fn declarations(&self, out: &mut String, vars: &[String]) {
        out.push_str("General \n");
        for var in vars {
            out.push_str(var);
            out.push('\n');
        }
        out.push_str("End\n\noptimize\n");
    }

    fn solve(&self, lp_file: &Path, out_file: &Path) -> Result<(), SolverError> {
        // CPLEX dumps the solution where the interactive script tells it to.
        let mut script = fs::read_to_string(lp_file)?;
        let _ = writeln!(script, "write {} sol", out_file.display());
        fs::write(lp_file, script)?;

        run_with_stdin(
            self.name(),
            Command::new("cplex").stdout(Stdio::null()),
            lp_file,
        )
    }

    fn parse_output(&self, text: &str, want_variables: bool) -> Result<Solution, SolverError> {
        let mut objective = None;
        let mut status_ok = false;
        let mut variables = Vec::new();

        for line in text.lines() {
            if line.contains("solutionStatusString") {
                if !line.contains("integer optimal solution") {
                    return Err(SolverError::NotOptimal);
                }
                status_ok = true;
            }
            if line.contains("objectiveValue") {
                objective = Self::quoted_value(line, "objectiveValue").and_then(parse_numeric);
            }
            if want_variables && line.contains("<variable name=") {
                let name = Self::quoted_value(line, "name");
                let value = Self::quoted_value(line, "value").and_then(parse_numeric);
                if let (Some(name), Some(value)) = (name, value) {
                    variables.push((name.to_string(), value));
                }
            }
        }

        if !status_ok {
            return Err(SolverError::NotOptimal);
        }
        let objective =
            objective.ok_or(SolverError::MissingObjective { solver: self.name() })?;
        Ok(Solution { objective, variables })
    }
}

// TESTS
// ================================================================================================
