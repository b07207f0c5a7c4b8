//! Turning raw run artifacts into an [`ExecutionResult`]
//!
//! Everything here is pure: the orchestrator reads files and hands over
//! bytes, and gets back the structured result.

use crate::error::ExecutionError;
use crate::result::{ExecutionResult, Outcome};
use crate::workspace::Artifact;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Artifacts and output of a child that exited cleanly
#[derive(Debug, Clone)]
pub struct Collected {
    pub stdout: String,
    pub stats: Artifact<Vec<u8>>,
    pub memory: Artifact<String>,
}

/// Merge a run's collected artifacts, or its failure, into one result.
#[must_use]
pub fn aggregate(run: Result<Collected, ExecutionError>, elapsed: Duration) -> ExecutionResult {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

    match run {
        Ok(collected) => {
            let profiling_stats = match collected.stats.contents {
                Some(raw) => ProfileReport::parse(&String::from_utf8_lossy(&raw)).render(),
                None => format!(
                    "Profile output file not found: {}",
                    collected.stats.path.display()
                ),
            };
            let memory_usage = match collected.memory.contents {
                Some(text) => text.trim().to_owned(),
                None => format!(
                    "Memory output file not found: {}",
                    collected.memory.path.display()
                ),
            };

            ExecutionResult {
                output: Some(collected.stdout.trim().to_owned()),
                profiling_stats: Some(profiling_stats),
                memory_usage: Some(memory_usage),
                error: None,
                cleanup_error: None,
                outcome: Outcome::Success,
                elapsed_ms,
            }
        }
        Err(err) => ExecutionResult {
            output: None,
            profiling_stats: None,
            memory_usage: None,
            outcome: Outcome::from(&err),
            error: Some(err.to_string()),
            cleanup_error: None,
            elapsed_ms,
        },
    }
}

/// One profiled function after directory stripping
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionStat {
    pub file: String,
    pub line: u32,
    pub name: String,
    /// Total calls, including recursive ones
    pub calls: u64,
    /// Calls that were not induced by recursion
    pub primitive_calls: u64,
    /// Time spent in the function itself
    pub tottime: f64,
    /// Time spent in the function and everything it called
    pub cumtime: f64,
}

impl FunctionStat {
    fn location(&self) -> String {
        if self.file == "~" && self.line == 0 {
            if let Some(inner) = self.name.strip_prefix('<').and_then(|n| n.strip_suffix('>')) {
                return format!("{{{inner}}}");
            }
        }
        format!("{}:{}({})", self.file, self.line, self.name)
    }
}

/// Ranked profiler table: sorted by cumulative time, then internal time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileReport {
    pub functions: Vec<FunctionStat>,
}

impl ProfileReport {
    /// Parse the harness's tab-separated table. Rows that do not parse are
    /// skipped; file paths are reduced to their final component and rows that
    /// collide after that are merged.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut merged: HashMap<(String, u32, String), FunctionStat> = HashMap::new();

        for row in raw.lines().filter_map(parse_row) {
            let key = (row.file.clone(), row.line, row.name.clone());
            merged
                .entry(key)
                .and_modify(|existing| {
                    existing.calls += row.calls;
                    existing.primitive_calls += row.primitive_calls;
                    existing.tottime += row.tottime;
                    existing.cumtime += row.cumtime;
                })
                .or_insert(row);
        }

        let mut functions: Vec<FunctionStat> = merged.into_values().collect();
        functions.sort_by(|a, b| {
            b.cumtime
                .total_cmp(&a.cumtime)
                .then_with(|| b.tottime.total_cmp(&a.tottime))
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.file.cmp(&b.file))
                .then_with(|| a.line.cmp(&b.line))
        });

        Self { functions }
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.functions.iter().map(|f| f.calls).sum()
    }

    #[must_use]
    pub fn primitive_calls(&self) -> u64 {
        self.functions.iter().map(|f| f.primitive_calls).sum()
    }

    #[must_use]
    pub fn total_time(&self) -> f64 {
        self.functions.iter().map(|f| f.tottime).sum()
    }

    /// Render as a human-readable ranked report.
    #[must_use]
    pub fn render(&self) -> String {
        if self.functions.is_empty() {
            return "Profile output is empty".to_owned();
        }

        let mut out = String::new();
        let total = self.total_calls();
        let primitive = self.primitive_calls();
        let _ = write!(out, "         {total} function calls");
        if total != primitive {
            let _ = write!(out, " ({primitive} primitive calls)");
        }
        let _ = writeln!(out, " in {:.3} seconds", self.total_time());
        out.push('\n');
        out.push_str("   Ordered by: cumulative time, internal time\n\n");
        out.push_str("   ncalls  tottime  percall  cumtime  percall filename:lineno(function)\n");

        for f in &self.functions {
            let ncalls = if f.calls == f.primitive_calls {
                f.calls.to_string()
            } else {
                format!("{}/{}", f.calls, f.primitive_calls)
            };
            let _ = writeln!(
                out,
                "{ncalls:>9} {:8.3} {} {:8.3} {} {}",
                f.tottime,
                per_call(f.tottime, f.calls),
                f.cumtime,
                per_call(f.cumtime, f.primitive_calls),
                f.location()
            );
        }
        out
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_call(time: f64, calls: u64) -> String {
    if calls == 0 {
        " ".repeat(8)
    } else {
        format!("{:8.3}", time / calls as f64)
    }
}

/// `file \t line \t name \t primitive_calls \t calls \t tottime \t cumtime`
fn parse_row(line: &str) -> Option<FunctionStat> {
    let mut fields = line.split('\t');
    let file = fields.next()?;
    let line_no = fields.next()?.trim().parse().ok()?;
    let name = fields.next()?;
    let primitive_calls = fields.next()?.trim().parse().ok()?;
    let calls = fields.next()?.trim().parse().ok()?;
    let tottime: f64 = fields.next()?.trim().parse().ok()?;
    let cumtime: f64 = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() || !tottime.is_finite() || !cumtime.is_finite() {
        return None;
    }

    Some(FunctionStat {
        file: strip_dir(file).to_owned(),
        line: line_no,
        name: name.to_owned(),
        calls,
        primitive_calls,
        tottime,
        cumtime,
    })
}

fn strip_dir(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TABLE: &str = "\
/tmp/sandprof-abc/untrusted_code.py\t5\tsandbox_entry\t1\t1\t0.000010000\t0.250000000
/usr/lib/python3.12/json/encoder.py\t183\tencode\t2\t2\t0.020000000\t0.030000000
/tmp/sandprof-abc/untrusted_code.py\t7\tfib\t1\t177\t0.200000000\t0.240000000
~\t0\t<built-in method builtins.print>\t3\t3\t0.001000000\t0.001000000
~\t0\t<method 'disable' of '_lsprof.Profiler' objects>\t1\t1\t0.000000000\t0.000000000
";

    fn artifact<T>(name: &str, contents: Option<T>) -> Artifact<T> {
        Artifact {
            path: PathBuf::from("/tmp/ws").join(name),
            contents,
        }
    }

    #[test]
    fn parse_strips_dirs_and_sorts_by_cumulative_time() {
        let report = ProfileReport::parse(TABLE);
        let names: Vec<&str> = report.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "sandbox_entry",
                "fib",
                "encode",
                "<built-in method builtins.print>",
                "<method 'disable' of '_lsprof.Profiler' objects>",
            ]
        );
        assert_eq!(report.functions[0].file, "untrusted_code.py");
        assert_eq!(report.functions[2].file, "encoder.py");
        assert_eq!(report.total_calls(), 184);
        assert_eq!(report.primitive_calls(), 8);
    }

    #[test]
    fn render_matches_ranked_layout() {
        let text = ProfileReport::parse(TABLE).render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "         184 function calls (8 primitive calls) in 0.221 seconds"
        );
        assert_eq!(lines[2], "   Ordered by: cumulative time, internal time");
        assert_eq!(
            lines[4],
            "   ncalls  tottime  percall  cumtime  percall filename:lineno(function)"
        );
        assert_eq!(
            lines[5],
            "        1    0.000    0.000    0.250    0.250 untrusted_code.py:5(sandbox_entry)"
        );
        assert_eq!(
            lines[6],
            "    177/1    0.200    0.001    0.240    0.240 untrusted_code.py:7(fib)"
        );
        assert!(text.contains("{built-in method builtins.print}"));
        assert!(text.contains("untrusted_code.py:5(sandbox_entry)"));
        assert!(!text.contains("/tmp/"));
    }

    #[test]
    fn rows_colliding_after_strip_are_merged() {
        let raw = "/a/mod.py\t1\tf\t1\t1\t0.5\t0.5\n/b/mod.py\t1\tf\t2\t2\t0.25\t0.25\n";
        let report = ProfileReport::parse(raw);
        assert_eq!(report.functions.len(), 1);
        assert_eq!(report.functions[0].calls, 3);
        assert!((report.functions[0].tottime - 0.75).abs() < 1e-9);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let raw = "garbage\n/a.py\tx\tf\t1\t1\t0.1\t0.1\n/a.py\t3\tg\t1\t1\t0.1\t0.1\n/a.py\t4\th\t1\t1\tnan\t0.1\n";
        let report = ProfileReport::parse(raw);
        assert_eq!(report.functions.len(), 1);
        assert_eq!(report.functions[0].name, "g");
    }

    #[test]
    fn empty_table_renders_placeholder() {
        assert_eq!(ProfileReport::parse("").render(), "Profile output is empty");
    }

    #[test]
    fn success_populates_output_stats_and_memory() {
        let result = aggregate(
            Ok(Collected {
                stdout: "hello\n".into(),
                stats: artifact("profile.stats", Some(TABLE.as_bytes().to_vec())),
                memory: artifact("memory.txt", Some("Memory Usage (in MB): 9.87\n".into())),
            }),
            Duration::from_millis(42),
        );

        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.output.as_deref(), Some("hello"));
        assert!(result.profiling_stats.as_deref().unwrap().contains("sandbox_entry"));
        assert_eq!(result.memory_usage.as_deref(), Some("Memory Usage (in MB): 9.87"));
        assert_eq!(result.memory_mb(), Some(9.87));
        assert!(result.error.is_none());
        assert_eq!(result.elapsed_ms, 42);
    }

    #[test]
    fn missing_artifacts_become_placeholders() {
        let result = aggregate(
            Ok(Collected {
                stdout: String::new(),
                stats: artifact("profile.stats", None),
                memory: artifact("memory.txt", None),
            }),
            Duration::ZERO,
        );

        assert_eq!(
            result.profiling_stats.as_deref(),
            Some("Profile output file not found: /tmp/ws/profile.stats")
        );
        assert_eq!(
            result.memory_usage.as_deref(),
            Some("Memory output file not found: /tmp/ws/memory.txt")
        );
        assert!(result.error.is_none());
        assert_eq!(result.memory_mb(), None);
    }

    #[test]
    fn failure_populates_only_error() {
        let result = aggregate(Err(ExecutionError::Timeout { seconds: 10 }), Duration::ZERO);
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert_eq!(
            result.error.as_deref(),
            Some("Error: The untrusted code execution timed out.")
        );
        assert!(result.output.is_none());
        assert!(result.profiling_stats.is_none());
        assert!(result.memory_usage.is_none());
    }
}
