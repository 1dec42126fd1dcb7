use chrono::NaiveDate;
use concierge_core::flows::{ReservationPeriod, SpaceStep};
use concierge_core::{ApplicationError, LocalUser, WorkflowType};
use serde::Serialize;
use tera::{Context, Tera};

const ROUTER: &str = "router";
const SPACE_STEP: &str = "space_step";

/// Instruction templates for the router and every agent.
pub struct PromptLibrary {
    tera: Tera,
}

/// Reservation state rendered into the step instructions.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SpaceStepPrompt {
    pub step: SpaceStep,
    pub space_id: Option<String>,
    pub period: Option<ReservationPeriod>,
    pub selected_number: Option<u32>,
    pub selected_space: Option<String>,
}

#[derive(Serialize)]
struct WorkflowEntry {
    name: &'static str,
    description: &'static str,
}

impl PromptLibrary {
    pub fn builtin() -> Result<Self, ApplicationError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (ROUTER, include_str!("../templates/prompts/router.txt")),
            ("general", include_str!("../templates/prompts/general.txt")),
            ("resident_info", include_str!("../templates/prompts/resident_info.txt")),
            ("help", include_str!("../templates/prompts/help.txt")),
            ("support", include_str!("../templates/prompts/support.txt")),
            (SPACE_STEP, include_str!("../templates/prompts/space_step.txt")),
        ])
        .map_err(|error| ApplicationError::Configuration(format!("prompt templates: {error}")))?;
        Ok(Self { tera })
    }

    pub fn router(
        &self,
        current_workflow: Option<WorkflowType>,
        history: &str,
    ) -> Result<String, ApplicationError> {
        let workflows = WorkflowType::ALL
            .iter()
            .map(|workflow| WorkflowEntry { name: workflow.as_str(), description: workflow.description() })
            .collect::<Vec<_>>();
        let mut context = Context::new();
        context.insert("workflows", &workflows);
        context.insert("current_workflow", &current_workflow.map(|workflow| workflow.as_str()));
        context.insert("history", history);
        self.render(ROUTER, &context)
    }

    /// Instructions for the single-turn agents (everything but SPACE).
    pub fn agent(
        &self,
        workflow: WorkflowType,
        user: Option<&LocalUser>,
        today: NaiveDate,
    ) -> Result<String, ApplicationError> {
        let template = match workflow {
            WorkflowType::General | WorkflowType::Space => "general",
            WorkflowType::ResidentInfo => "resident_info",
            WorkflowType::Help => "help",
            WorkflowType::Support => "support",
        };
        self.render(template, &Self::base_context(user, today))
    }

    pub fn space_step(
        &self,
        prompt: &SpaceStepPrompt,
        user: Option<&LocalUser>,
        today: NaiveDate,
    ) -> Result<String, ApplicationError> {
        let mut context = Self::base_context(user, today);
        context.insert("step", prompt.step.as_str());
        context.insert("space_id", &prompt.space_id);
        context.insert("period", &prompt.period);
        context.insert("selected_number", &prompt.selected_number);
        context.insert("selected_space", &prompt.selected_space);
        self.render(SPACE_STEP, &context)
    }

    fn base_context(user: Option<&LocalUser>, today: NaiveDate) -> Context {
        let mut context = Context::new();
        context.insert("today", &today.format("%Y-%m-%d").to_string());
        context.insert("user_name", &user.map(|user| user.display_name.as_str()));
        context
    }

    fn render(&self, template: &str, context: &Context) -> Result<String, ApplicationError> {
        self.tera
            .render(template, context)
            .map(|rendered| rendered.trim().to_owned())
            .map_err(|error| ApplicationError::Configuration(format!("prompt `{template}`: {error}")))
    }
}
