//! Groups and the authoring wizard that takes them from draft to deployed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{CertError, CertResult},
    layout::FieldKind,
    template::Template,
};

pub const DEFAULT_MAX_LEARNERS: u32 = 100;
pub const MAX_LEARNERS_LIMIT: u32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Draft,
    Active,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub max_learners: u32,
    pub learner_count: u32,
    pub created_by: String,
    pub join_code: Option<String>,
    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn new(
        name: &str,
        description: Option<&str>,
        max_learners: u32,
        created_by: &str,
    ) -> CertResult<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CertError::InvalidInput("group name must not be empty".into()));
        }
        if !(1..=MAX_LEARNERS_LIMIT).contains(&max_learners) {
            return Err(CertError::InvalidInput(format!(
                "max_learners must be between 1 and {MAX_LEARNERS_LIMIT}"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.unwrap_or_default().trim().to_string(),
            max_learners,
            learner_count: 0,
            created_by: created_by.to_string(),
            join_code: None,
            status: GroupStatus::Draft,
            created_at: Utc::now(),
            deployed_at: None,
        })
    }

    pub fn seats_remaining(&self) -> u32 {
        self.max_learners.saturating_sub(self.learner_count)
    }

    pub fn is_full(&self) -> bool {
        self.learner_count >= self.max_learners
    }

    /// Move a deployable draft to Active under `join_code`.
    pub fn deploy(&mut self, template: Option<&Template>, join_code: String) -> CertResult<()> {
        ensure_deployable(self, template)?;
        self.join_code = Some(join_code);
        self.status = GroupStatus::Active;
        self.deployed_at = Some(Utc::now());
        Ok(())
    }

    pub fn close(&mut self) -> CertResult<()> {
        if self.status != GroupStatus::Active {
            return Err(CertError::InvalidInput(format!(
                "only active groups can be closed, group is {:?}",
                self.status
            )));
        }
        self.status = GroupStatus::Completed;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    GroupDetails,
    TemplateDesigner,
    FinalizeDeploy,
    Deployed,
}

impl WizardStep {
    pub fn as_str(self) -> &'static str {
        match self {
            WizardStep::GroupDetails => "group_details",
            WizardStep::TemplateDesigner => "template_designer",
            WizardStep::FinalizeDeploy => "finalize_deploy",
            WizardStep::Deployed => "deployed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WizardState {
    pub step: WizardStep,
    /// Why the wizard cannot advance past `step`, if anything blocks it.
    pub blocker: Option<String>,
}

impl WizardState {
    pub fn for_group(group: &Group, template: Option<&Template>) -> Self {
        if group.status != GroupStatus::Draft {
            return Self {
                step: WizardStep::Deployed,
                blocker: None,
            };
        }
        match ensure_deployable(group, template) {
            Ok(()) => Self {
                step: WizardStep::FinalizeDeploy,
                blocker: None,
            },
            Err(CertError::Wizard { step, reason }) => {
                let step = match step {
                    "group_details" => WizardStep::GroupDetails,
                    "finalize_deploy" => WizardStep::FinalizeDeploy,
                    _ => WizardStep::TemplateDesigner,
                };
                Self {
                    step,
                    blocker: Some(reason),
                }
            }
            Err(other) => Self {
                step: WizardStep::TemplateDesigner,
                blocker: Some(other.to_string()),
            },
        }
    }
}

fn blocked(step: WizardStep, reason: impl Into<String>) -> CertError {
    CertError::Wizard {
        step: step.as_str(),
        reason: reason.into(),
    }
}

/// Check every precondition for deploying `group`.
pub fn ensure_deployable(group: &Group, template: Option<&Template>) -> CertResult<()> {
    if group.name.trim().is_empty() {
        return Err(blocked(WizardStep::GroupDetails, "group name is required"));
    }
    if group.status != GroupStatus::Draft {
        return Err(blocked(
            WizardStep::FinalizeDeploy,
            "group has already been deployed",
        ));
    }
    let Some(template) = template else {
        return Err(blocked(
            WizardStep::TemplateDesigner,
            "upload a certificate template first",
        ));
    };
    if template.canvas.width <= 0.0 || template.canvas.height <= 0.0 {
        return Err(blocked(
            WizardStep::TemplateDesigner,
            "template canvas has no size",
        ));
    }
    if template.fields.is_empty() {
        return Err(blocked(
            WizardStep::TemplateDesigner,
            "place at least one field on the template",
        ));
    }
    if !template.fields.iter().any(|f| f.kind == FieldKind::Text) {
        return Err(blocked(
            WizardStep::TemplateDesigner,
            "the template needs at least one text field",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Group {
        Group::new("Rust 101", Some("Spring cohort"), 30, "user-1").unwrap()
    }

    #[test]
    fn new_group_validates_inputs() {
        assert!(Group::new("  ", None, 10, "u").is_err());
        assert!(Group::new("G", None, 0, "u").is_err());
        assert!(Group::new("G", None, MAX_LEARNERS_LIMIT + 1, "u").is_err());
        let g = group();
        assert_eq!(g.status, GroupStatus::Draft);
        assert_eq!(g.seats_remaining(), 30);
    }

    #[test]
    fn wizard_walks_through_steps() {
        let mut g = group();
        assert_eq!(WizardState::for_group(&g, None).step, WizardStep::TemplateDesigner);

        let mut t = Template::new(g.id, "https://img.example/c.png", None);
        assert_eq!(
            WizardState::for_group(&g, Some(&t)).step,
            WizardStep::TemplateDesigner
        );

        t.add_field("QR", FieldKind::Qr, None).unwrap();
        let state = WizardState::for_group(&g, Some(&t));
        assert_eq!(state.step, WizardStep::TemplateDesigner);
        assert!(state.blocker.unwrap().contains("text field"));

        t.add_field("Name", FieldKind::Text, None).unwrap();
        assert_eq!(
            WizardState::for_group(&g, Some(&t)).step,
            WizardStep::FinalizeDeploy
        );

        g.deploy(Some(&t), "ABCD1234".into()).unwrap();
        assert_eq!(g.status, GroupStatus::Active);
        assert_eq!(WizardState::for_group(&g, Some(&t)).step, WizardStep::Deployed);
    }

    #[test]
    fn blank_name_blocks_at_group_details() {
        let mut g = group();
        g.name = String::new();
        assert_eq!(WizardState::for_group(&g, None).step, WizardStep::GroupDetails);
    }

    #[test]
    fn deploy_requires_template_and_draft() {
        let mut g = group();
        let err = g.deploy(None, "ABCD1234".into()).unwrap_err();
        assert_eq!(err.error_code(), "WIZARD_INCOMPLETE");
        assert!(g.join_code.is_none());

        let mut t = Template::new(g.id, "img", None);
        t.add_field("Name", FieldKind::Text, None).unwrap();
        g.deploy(Some(&t), "ABCD1234".into()).unwrap();
        assert!(g.deploy(Some(&t), "ZZZZ9999".into()).is_err());
        assert_eq!(g.join_code.as_deref(), Some("ABCD1234"));
    }

    #[test]
    fn only_active_groups_close() {
        let mut g = group();
        assert!(g.close().is_err());
        g.status = GroupStatus::Active;
        g.close().unwrap();
        assert_eq!(g.status, GroupStatus::Completed);
    }
}
