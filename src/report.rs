//! Aggregate statistics and the exported form of a collection run.

use crate::model::{Environment, RunResult, TestResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Totals for a run, always recomputed from its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl RunStats {
    /// Fold `results` into totals.
    ///
    /// 2xx counts as a success, an error or a status of 400 and above
    /// as a failure; anything else is neither.
    pub fn from_results(
        results: &[RunResult],
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let mut stats = Self {
            total_requests: results.len(),
            successful_requests: 0,
            failed_requests: 0,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            start_time,
            end_time,
        };
        for result in results {
            match (&result.error, &result.response) {
                (Some(_), _) | (None, None) => stats.failed_requests += 1,
                (None, Some(response)) if (200..300).contains(&response.status) => {
                    stats.successful_requests += 1
                }
                (None, Some(response)) if response.status >= 400 => {
                    stats.failed_requests += 1
                }
                _ => {}
            }
            stats.total_tests += result.test_results.len();
            stats.passed_tests += result.passed_tests();
            stats.failed_tests += result.failed_tests();
        }
        stats
    }

    /// Wall-clock duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }

    /// True when no request and no test failed.
    pub fn all_passed(&self) -> bool {
        self.failed_requests == 0 && self.failed_tests == 0
    }
}

/// Everything a finished (or stopped) run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub collection_id: String,
    pub collection_name: String,
    pub environment_name: Option<String>,
    pub results: Vec<RunResult>,
    pub stats: RunStats,
    /// The run ended because it was cancelled.
    pub stopped: bool,
    /// Final state of the run's environment snapshot.
    pub environment: Option<Environment>,
}

impl RunReport {
    pub fn export(&self) -> RunExport {
        RunExport::from_report(self)
    }

    /// Human-readable summary, one line per request.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Collection: {}", self.collection_name);
        if let Some(env) = &self.environment_name {
            let _ = writeln!(out, "Environment: {env}");
        }
        for result in &self.results {
            let mark = if result.error.is_none()
                && result.status() < 400
                && result.failed_tests() == 0
            {
                "PASS"
            } else {
                "FAIL"
            };
            let _ = writeln!(
                out,
                "[{mark}] {} status={} {}ms",
                result.request_name,
                result.status(),
                result.duration
            );
            if let Some(error) = &result.error {
                let _ = writeln!(out, "    error: {error}");
            }
            for test in &result.test_results {
                let _ = match (&test.passed, &test.message) {
                    (true, _) => writeln!(out, "    ok   {}", test.name),
                    (false, Some(message)) => {
                        writeln!(out, "    fail {}: {message}", test.name)
                    }
                    (false, None) => writeln!(out, "    fail {}", test.name),
                };
            }
        }
        let s = &self.stats;
        let _ = writeln!(
            out,
            "Requests: {} total, {} succeeded, {} failed",
            s.total_requests, s.successful_requests, s.failed_requests
        );
        let _ = writeln!(
            out,
            "Tests: {} total, {} passed, {} failed",
            s.total_tests, s.passed_tests, s.failed_tests
        );
        let _ = write!(out, "Duration: {}ms", s.duration_ms());
        if self.stopped {
            out.push_str(" (stopped)");
        }
        out.push('\n');
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCollection {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTest {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    pub name: String,
    /// 0 when the request errored.
    pub status: u16,
    pub duration: u64,
    pub error: Option<String>,
    pub tests: Vec<ExportTest>,
}

/// Shareable JSON document describing a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunExport {
    pub collection: ExportCollection,
    /// RFC 3339 export time.
    pub timestamp: String,
    pub environment: Option<String>,
    pub summary: ExportSummary,
    pub results: Vec<ExportResult>,
}

impl RunExport {
    pub fn from_report(report: &RunReport) -> Self {
        Self::at(report, Utc::now())
    }

    fn at(report: &RunReport, now: DateTime<Utc>) -> Self {
        let stats = &report.stats;
        Self {
            collection: ExportCollection {
                name: report.collection_name.clone(),
                id: report.collection_id.clone(),
            },
            timestamp: now.to_rfc3339(),
            environment: report.environment_name.clone(),
            summary: ExportSummary {
                total_requests: stats.total_requests,
                successful_requests: stats.successful_requests,
                failed_requests: stats.failed_requests,
                total_tests: stats.total_tests,
                passed_tests: stats.passed_tests,
                duration: stats.duration_ms(),
            },
            results: report.results.iter().map(export_result).collect(),
        }
    }
}

fn export_result(result: &RunResult) -> ExportResult {
    ExportResult {
        name: result.request_name.clone(),
        status: result.status(),
        duration: result.duration,
        error: result.error.clone(),
        tests: result.test_results.iter().map(export_test).collect(),
    }
}

fn export_test(test: &TestResult) -> ExportTest {
    ExportTest {
        name: test.name.clone(),
        passed: test.passed,
        message: test.message.clone(),
    }
}
