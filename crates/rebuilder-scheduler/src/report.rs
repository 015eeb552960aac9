//! Result classification and the final run report.

use std::path::{Path, PathBuf};

/// Final classification for one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// The build succeeded.
    Passing,
    /// The build failed, and an unmodified recheck build failed too, so
    /// the breakage predates the injected changes.
    AlreadyBroken,
    /// The build failed and either no recheck was run or the recheck
    /// succeeded.
    Failing,
}

/// Classifies a finished job from its primary build result and, if a
/// recheck pass ran, its secondary result.
pub fn classify(build_failed: bool, recheck_failed: Option<bool>) -> Outcome {
    match (build_failed, recheck_failed) {
        (false, _) => Outcome::Passing,
        (true, Some(true)) => Outcome::AlreadyBroken,
        (true, _) => Outcome::Failing,
    }
}

/// One classified package, with pointers to the captured logs for
/// non-passing results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageResult {
    pub package: String,
    pub outcome: Outcome,
    pub log: Option<PathBuf>,
    pub recheck_log: Option<PathBuf>,
    /// Set when the job died of a transport or worker failure rather
    /// than a build result.
    pub error: Option<String>,
}

impl PackageResult {
    pub fn passing(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            outcome: Outcome::Passing,
            log: None,
            recheck_log: None,
            error: None,
        }
    }

    pub fn failing(package: impl Into<String>, log: PathBuf) -> Self {
        Self {
            package: package.into(),
            outcome: Outcome::Failing,
            log: Some(log),
            recheck_log: None,
            error: None,
        }
    }

    pub fn already_broken(package: impl Into<String>, log: PathBuf, recheck_log: PathBuf) -> Self {
        Self {
            package: package.into(),
            outcome: Outcome::AlreadyBroken,
            log: Some(log),
            recheck_log: Some(recheck_log),
            error: None,
        }
    }

    pub fn errored(package: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            outcome: Outcome::Failing,
            log: None,
            recheck_log: None,
            error: Some(error.into()),
        }
    }

    /// The report line for this package.
    pub fn line(&self) -> String {
        match self.outcome {
            Outcome::Passing => format!("PASSED: {}", self.package),
            Outcome::AlreadyBroken => format!(
                "FAILED: {}, but maybe unrelated to new changes (see {} and {})",
                self.package,
                self.log.as_deref().unwrap_or(Path::new("?")).display(),
                self.recheck_log.as_deref().unwrap_or(Path::new("?")).display(),
            ),
            Outcome::Failing => match (&self.log, &self.error) {
                (Some(log), _) => format!("FAILED: {} (see {})", self.package, log.display()),
                (None, Some(error)) => format!("FAILED: {} ({})", self.package, error),
                (None, None) => format!("FAILED: {}", self.package),
            },
        }
    }
}

/// The run summary: every package under exactly one outcome, passing
/// results reported first.
#[derive(Debug, Clone)]
pub struct Report {
    results: Vec<PackageResult>,
}

impl Report {
    pub fn new(mut results: Vec<PackageResult>) -> Self {
        results.sort_by(|a, b| {
            a.outcome
                .cmp(&b.outcome)
                .then_with(|| a.package.cmp(&b.package))
        });
        Self { results }
    }

    pub fn results(&self) -> &[PackageResult] {
        &self.results
    }

    /// (passing, already broken, failing)
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for result in &self.results {
            match result.outcome {
                Outcome::Passing => counts.0 += 1,
                Outcome::AlreadyBroken => counts.1 += 1,
                Outcome::Failing => counts.2 += 1,
            }
        }
        counts
    }

    /// Whether the process should exit with a failure indication.
    pub fn has_failing(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.outcome == Outcome::Failing)
    }

    pub fn render(&self) -> String {
        let (passing, broken, failing) = self.counts();
        let mut out = String::new();
        for result in &self.results {
            out.push_str(&result.line());
            out.push('\n');
        }
        out.push_str(&format!(
            "{} Passing, {} Already broken, {} Failing\n",
            passing, broken, failing
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matrix() {
        assert_eq!(classify(false, None), Outcome::Passing);
        // A successful build passes regardless of recheck configuration.
        assert_eq!(classify(false, Some(true)), Outcome::Passing);
        assert_eq!(classify(false, Some(false)), Outcome::Passing);

        assert_eq!(classify(true, None), Outcome::Failing);
        assert_eq!(classify(true, Some(false)), Outcome::Failing);
        assert_eq!(classify(true, Some(true)), Outcome::AlreadyBroken);
    }

    #[test]
    fn lines_match_expected_formats() {
        assert_eq!(
            PackageResult::passing("hello_2.10-1").line(),
            "PASSED: hello_2.10-1"
        );
        assert_eq!(
            PackageResult::failing("hello_2.10-1", "/tmp/logs/hello_2.10-1/STDOUT".into()).line(),
            "FAILED: hello_2.10-1 (see /tmp/logs/hello_2.10-1/STDOUT)"
        );
        assert_eq!(
            PackageResult::already_broken(
                "hello_2.10-1",
                "/tmp/logs/hello_2.10-1/STDOUT".into(),
                "/tmp/logs/hello_2.10-1_recheck/STDOUT".into(),
            )
            .line(),
            "FAILED: hello_2.10-1, but maybe unrelated to new changes \
             (see /tmp/logs/hello_2.10-1/STDOUT and /tmp/logs/hello_2.10-1_recheck/STDOUT)"
        );
        assert_eq!(
            PackageResult::errored("hello_2.10-1", "connection error: reset").line(),
            "FAILED: hello_2.10-1 (connection error: reset)"
        );
    }

    #[test]
    fn report_sorts_passing_first_and_counts() {
        let report = Report::new(vec![
            PackageResult::failing("c_1", "/l/c_1/STDOUT".into()),
            PackageResult::passing("b_1"),
            PackageResult::already_broken("d_1", "/l/d_1/STDOUT".into(), "/l/d_1_recheck/STDOUT".into()),
            PackageResult::passing("a_1"),
        ]);

        let order: Vec<&str> = report.results().iter().map(|r| r.package.as_str()).collect();
        assert_eq!(order, vec!["a_1", "b_1", "d_1", "c_1"]);
        assert_eq!(report.counts(), (2, 1, 1));
        assert!(report.has_failing());
        assert!(report
            .render()
            .ends_with("2 Passing, 1 Already broken, 1 Failing\n"));
    }

    #[test]
    fn a_run_without_failures_exits_cleanly() {
        let report = Report::new(vec![
            PackageResult::passing("a_1"),
            PackageResult::already_broken("b_1", "/l/b_1/STDOUT".into(), "/l/b_1_recheck/STDOUT".into()),
        ]);
        assert!(!report.has_failing());
    }
}
