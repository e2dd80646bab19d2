//! Declarative YAML scenarios: the interaction script and the interrupt expectation

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::browser::ReadinessCondition;
use crate::error::{SmokeError, SmokeResult};
use crate::matcher::Matcher;

const BUILTIN_SCENARIO: &str = include_str!("../scenarios/orchestrator_interrupt.yaml");

/// A complete scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name for this scenario
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Steps to execute in order
    pub steps: Vec<InteractionStep>,

    /// What must appear once the steps are done
    pub interrupt: InterruptExpectation,
}

/// A single scripted action against the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InteractionStep {
    /// Navigate to a URL. `{target}` and `{base_url}` are expanded at run time.
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: ReadinessCondition,
        #[serde(default = "default_navigation_timeout")]
        timeout_ms: u64,
    },

    /// Wait for an element to appear
    WaitFor {
        matcher: Matcher,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    /// Click an element that must already be present
    Click { target: Matcher },

    /// Type into an element that must already be present
    Type { target: Matcher, text: String },

    /// Capture the page to the run's screenshot artifact
    Screenshot { label: String },

    /// Wait for a fixed amount of time
    Sleep { ms: u64 },

    /// Log the page title
    LogTitle,
}

/// The interrupt marker and the controls that let an operator resume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptExpectation {
    pub marker: Matcher,

    #[serde(default = "default_marker_timeout")]
    pub marker_timeout_ms: u64,

    /// Accepted resume controls, tried in order; any one satisfies the check
    pub affordances: Vec<Matcher>,

    #[serde(default = "default_wait_timeout")]
    pub affordance_timeout_ms: u64,
}

fn default_navigation_timeout() -> u64 {
    30_000
}

fn default_wait_timeout() -> u64 {
    10_000
}

fn default_marker_timeout() -> u64 {
    30_000
}

impl InteractionStep {
    /// Short name used in logs and reports
    pub fn name(&self) -> String {
        match self {
            InteractionStep::Navigate { url, .. } => format!("navigate:{}", url),
            InteractionStep::WaitFor { matcher, .. } => format!("wait_for:{}", matcher),
            InteractionStep::Click { target } => format!("click:{}", target),
            InteractionStep::Type { target, .. } => format!("type:{}", target),
            InteractionStep::Screenshot { label } => format!("screenshot:{}", label),
            InteractionStep::Sleep { ms } => format!("sleep:{}ms", ms),
            InteractionStep::LogTitle => "log_title".to_string(),
        }
    }
}

impl InterruptExpectation {
    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }

    pub fn affordance_timeout(&self) -> Duration {
        Duration::from_millis(self.affordance_timeout_ms)
    }
}

impl Scenario {
    /// Parse a scenario from a YAML string
    pub fn from_yaml(yaml: &str) -> SmokeResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> SmokeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// The orchestrator interrupt scenario shipped with the harness
    pub fn builtin() -> SmokeResult<Self> {
        Self::from_yaml(BUILTIN_SCENARIO)
    }

    fn validate(&self) -> SmokeResult<()> {
        if self.steps.is_empty() {
            return Err(SmokeError::Scenario(format!("scenario '{}' has no steps", self.name)));
        }

        let first_page_step = self
            .steps
            .iter()
            .find(|step| !matches!(step, InteractionStep::Sleep { .. }));
        if !matches!(first_page_step, Some(InteractionStep::Navigate { .. })) {
            return Err(SmokeError::Scenario(format!(
                "scenario '{}' must navigate before touching the page",
                self.name
            )));
        }

        if self.interrupt.affordances.is_empty() {
            return Err(SmokeError::Scenario(format!(
                "scenario '{}' lists no resume affordances",
                self.name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scenario_parses() {
        let scenario = Scenario::builtin().unwrap();
        assert_eq!(scenario.name, "orchestrator-interrupt");
        assert!(matches!(
            scenario.steps[0],
            InteractionStep::Navigate { wait_until: ReadinessCondition::NetworkIdle, timeout_ms: 30_000, .. }
        ));
        assert_eq!(scenario.interrupt.marker, Matcher::text_within("span", "Interrupt"));
        assert_eq!(
            scenario.interrupt.affordances,
            vec![
                Matcher::text_within("button", "Continue"),
                Matcher::text_within("button", "Resume"),
            ]
        );
        assert_eq!(scenario.interrupt.affordance_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_builtin_types_into_the_message_editor() {
        let scenario = Scenario::builtin().unwrap();
        let typed = scenario.steps.iter().find_map(|step| match step {
            InteractionStep::Type { target, text } => Some((target.clone(), text.clone())),
            _ => None,
        });
        assert_eq!(
            typed,
            Some((Matcher::css("div[contenteditable=true]"), "I want to build a website".to_string()))
        );
    }

    #[test]
    fn test_defaults_fill_in() {
        let yaml = r#"
name: minimal
steps:
  - action: navigate
    url: "{base_url}"
  - action: wait_for
    matcher: "text=Ready"
interrupt:
  marker: "text=Interrupt"
  affordances: ["text=Resume"]
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        assert_eq!(
            scenario.steps[0],
            InteractionStep::Navigate {
                url: "{base_url}".to_string(),
                wait_until: ReadinessCondition::Load,
                timeout_ms: 30_000,
            }
        );
        assert_eq!(
            scenario.steps[1],
            InteractionStep::WaitFor { matcher: Matcher::text("Ready"), timeout_ms: 10_000 }
        );
        assert_eq!(scenario.interrupt.marker_timeout_ms, 30_000);
    }

    #[test]
    fn test_rejects_click_before_navigate() {
        let yaml = r#"
name: bad
steps:
  - action: sleep
    ms: 10
  - action: click
    target: "text=Go"
interrupt:
  marker: "text=Interrupt"
  affordances: ["text=Resume"]
"#;
        assert!(matches!(Scenario::from_yaml(yaml), Err(SmokeError::Scenario(_))));
    }

    #[test]
    fn test_rejects_missing_affordances() {
        let yaml = r#"
name: bad
steps:
  - action: navigate
    url: "{target}"
interrupt:
  marker: "text=Interrupt"
  affordances: []
"#;
        assert!(matches!(Scenario::from_yaml(yaml), Err(SmokeError::Scenario(_))));
    }

    #[test]
    fn test_invalid_matcher_is_a_yaml_error() {
        let yaml = r#"
name: bad
steps:
  - action: navigate
    url: "{target}"
  - action: click
    target: "text="
interrupt:
  marker: "text=Interrupt"
  affordances: ["text=Resume"]
"#;
        assert!(matches!(Scenario::from_yaml(yaml), Err(SmokeError::Yaml(_))));
    }
}
