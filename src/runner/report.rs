//! Session results.

use colored::Colorize;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::Outcome;

/// Result of one test item.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    /// Item name
    pub name: String,
    /// Topology name, if the item had one
    pub topology: Option<String>,
    /// Outcome
    pub outcome: Outcome,
    /// Failure, error or skip message
    pub message: Option<String>,
    /// Wall time spent on the item
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// Result of a session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    /// Reports of the items that ran, in run order
    pub tests: Vec<TestReport>,
    /// Names of deselected items
    pub deselected: Vec<String>,
    /// Session, host and topology level errors
    pub errors: Vec<String>,
    /// True if the session was stopped by SIGINT
    pub interrupted: bool,
}

impl SessionReport {
    /// Number of tests with `outcome`.
    pub fn count(&self, outcome: Outcome) -> usize {
        self.tests.iter().filter(|t| t.outcome == outcome).count()
    }

    /// Report of the test `name`.
    pub fn test(&self, name: &str) -> Option<&TestReport> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// True if nothing failed and the session was not interrupted.
    pub fn success(&self) -> bool {
        self.errors.is_empty()
            && !self.interrupted
            && self
                .tests
                .iter()
                .all(|t| matches!(t.outcome, Outcome::Passed | Outcome::Skipped))
    }

    /// Exit code for a test harness binary.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    /// Prints a colored summary to stdout.
    pub fn print_summary(&self) {
        for test in &self.tests {
            let outcome = match test.outcome {
                Outcome::Passed => "PASSED".green(),
                Outcome::Failed => "FAILED".red(),
                Outcome::Skipped => "SKIPPED".yellow(),
                Outcome::Error => "ERROR".red().bold(),
                Outcome::Unknown => "UNKNOWN".dimmed(),
            };
            match test.message {
                Some(ref message) if test.outcome != Outcome::Passed => {
                    println!("{outcome} {} - {}", test.name, message.lines().next().unwrap_or(""))
                }
                _ => println!("{outcome} {}", test.name),
            }
        }

        for error in &self.errors {
            println!("{} {error}", "SESSION ERROR".red().bold());
        }

        println!("{self}");
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped, {} errors, {} deselected",
            self.count(Outcome::Passed),
            self.count(Outcome::Failed),
            self.count(Outcome::Skipped),
            self.count(Outcome::Error),
            self.deselected.len()
        )?;
        if self.interrupted {
            write!(f, " (interrupted)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, outcome: Outcome) -> TestReport {
        TestReport {
            name: name.to_string(),
            topology: None,
            outcome,
            message: None,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_summary() {
        let mut session = SessionReport {
            tests: vec![report("a", Outcome::Passed), report("b", Outcome::Skipped)],
            deselected: vec!["c".to_string()],
            ..Default::default()
        };
        assert!(session.success());
        assert_eq!(session.exit_code(), 0);
        assert_eq!(
            session.to_string(),
            "1 passed, 0 failed, 1 skipped, 0 errors, 1 deselected"
        );

        session.tests.push(report("d", Outcome::Failed));
        assert!(!session.success());
        assert_eq!(session.test("d").unwrap().outcome, Outcome::Failed);
    }

    #[test]
    fn test_serialize() {
        let session = SessionReport {
            tests: vec![report("a", Outcome::Error)],
            ..Default::default()
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["tests"][0]["outcome"], "error");
        assert_eq!(value["tests"][0]["duration"], "5ms");
    }
}
