//! Interrupt detection and the pass/fail verdict

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::browser::BrowserSession;
use crate::error::SmokeError;
use crate::matcher::Matcher;
use crate::spec::InterruptExpectation;

pub const INTERRUPT_DIAGNOSTIC: &str = "Graph was not interrupted with human feedback";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TestVerdict {
    Passed,
    Failed { diagnostic: String },
}

impl TestVerdict {
    /// Verdict from what the detector saw; the first error explains a failure
    pub fn from_observations(marker: Result<(), String>, affordance: Result<(), String>) -> Self {
        match marker.and(affordance) {
            Ok(()) => TestVerdict::Passed,
            Err(cause) => TestVerdict::interrupt_missing(cause),
        }
    }

    pub fn interrupt_missing(cause: impl std::fmt::Display) -> Self {
        TestVerdict::Failed {
            diagnostic: format!("{}: {}", INTERRUPT_DIAGNOSTIC, cause),
        }
    }

    /// A run that failed before reaching the interrupt check
    pub fn from_error(error: &SmokeError) -> Self {
        TestVerdict::Failed { diagnostic: error.to_string() }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, TestVerdict::Passed)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            TestVerdict::Passed => 0,
            TestVerdict::Failed { .. } => 1,
        }
    }
}

/// Waits for the interrupt marker and a resume control
pub struct InterruptDetector {
    expectation: InterruptExpectation,
}

impl InterruptDetector {
    pub fn new(expectation: InterruptExpectation) -> Self {
        Self { expectation }
    }

    pub async fn await_interrupt(&self, session: &mut BrowserSession) -> TestVerdict {
        info!("Waiting for interrupt marker {}", self.expectation.marker);

        let marker = session
            .wait_for_marker(&self.expectation.marker, self.expectation.marker_timeout())
            .await
            .map_err(|e| {
                warn!("Interrupt marker not seen: {}", e);
                SmokeError::InterruptNotObserved(format!("marker {} ({})", self.expectation.marker, e)).to_string()
            });

        // no point looking for a resume control without the marker
        let affordance = match marker {
            Ok(()) => self.find_affordance(session).await,
            Err(_) => Ok(()),
        };

        TestVerdict::from_observations(marker, affordance)
    }

    async fn find_affordance(&self, session: &mut BrowserSession) -> Result<(), String> {
        let mut causes = Vec::new();

        for affordance in &self.expectation.affordances {
            match session
                .wait_for_marker(affordance, self.expectation.affordance_timeout())
                .await
            {
                Ok(()) => {
                    info!("Found resume control {}", affordance);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Resume control {} not found: {}", affordance, e);
                    causes.push(e);
                }
            }
        }

        Err(SmokeError::InterruptNotObserved(format!(
            "no resume control among {} ({})",
            describe(&self.expectation.affordances),
            causes.last().map(|e| e.to_string()).unwrap_or_default()
        ))
        .to_string())
    }
}

fn describe(matchers: &[Matcher]) -> String {
    matchers.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(true, true => 0 ; "marker and affordance pass")]
    #[test_case(true, false => 1 ; "missing affordance fails")]
    #[test_case(false, true => 1 ; "missing marker fails")]
    #[test_case(false, false => 1 ; "nothing observed fails")]
    fn test_verdict_exit_code(marker: bool, affordance: bool) -> i32 {
        let observe = |seen: bool, what: &str| if seen { Ok(()) } else { Err(format!("{} missing", what)) };
        TestVerdict::from_observations(observe(marker, "marker"), observe(affordance, "affordance")).exit_code()
    }

    #[test_case(Err("marker missing".into()), Ok(()), "marker missing" ; "marker cause")]
    #[test_case(Ok(()), Err("no button".into()), "no button" ; "affordance cause")]
    #[test_case(Err("marker missing".into()), Err("no button".into()), "marker missing" ; "marker cause wins")]
    fn test_failure_keeps_cause(marker: Result<(), String>, affordance: Result<(), String>, cause: &str) {
        let verdict = TestVerdict::from_observations(marker, affordance);
        assert_eq!(
            verdict,
            TestVerdict::Failed { diagnostic: format!("Graph was not interrupted with human feedback: {}", cause) }
        );
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let a = TestVerdict::from_observations(Ok(()), Err("x".to_string()));
        let b = TestVerdict::from_observations(Ok(()), Err("x".to_string()));
        assert_eq!(a, b);
        assert!(TestVerdict::from_observations(Ok(()), Ok(())).is_passed());
    }

    #[test]
    fn test_verdict_serializes_tagged() {
        let json = serde_json::to_value(TestVerdict::interrupt_missing("timeout")).unwrap();
        assert_eq!(json["verdict"], "failed");
        assert!(json["diagnostic"].as_str().unwrap().starts_with(INTERRUPT_DIAGNOSTIC));
    }
}
