use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::flows::engine::FlowTransitionError;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpaceStep {
    #[default]
    RequestSpaceInfo,
    ChooseSpace,
    ConfirmReservationSummary,
    CompleteReservation,
    PaymentInstructions,
}

impl SpaceStep {
    pub const ALL: [SpaceStep; 5] = [
        Self::RequestSpaceInfo,
        Self::ChooseSpace,
        Self::ConfirmReservationSummary,
        Self::CompleteReservation,
        Self::PaymentInstructions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestSpaceInfo => "REQUEST_SPACE_INFO",
            Self::ChooseSpace => "CHOOSE_SPACE",
            Self::ConfirmReservationSummary => "CONFIRM_RESERVATION_SUMMARY",
            Self::CompleteReservation => "COMPLETE_RESERVATION",
            Self::PaymentInstructions => "PAYMENT_INSTRUCTIONS",
        }
    }

    /// Steps that may only be entered once a space and a period are known.
    pub fn requires_reservation_data(&self) -> bool {
        matches!(self, Self::ConfirmReservationSummary | Self::CompleteReservation)
    }
}

impl fmt::Display for SpaceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpaceStep {
    type Err = FlowTransitionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == normalized)
            .ok_or(FlowTransitionError::UnknownStep(normalized))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[serde(alias = "ANSWER_USER")]
    Pending,
    AskUser,
    SwitchStep,
    Completed,
    #[serde(alias = "CANCEL", alias = "CANCELLED")]
    Canceled,
}

/// Requested reservation window. Dates are kept as the model wrote them and
/// checked on demand, so a sloppy date never discards the whole step result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationPeriod {
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

impl ReservationPeriod {
    pub fn new(start_date: impl Into<String>, end_date: impl Into<String>) -> Self {
        Self { start_date: start_date.into(), end_date: end_date.into(), ..Self::default() }
    }

    pub fn is_complete(&self) -> bool {
        !self.start_date.trim().is_empty() && !self.end_date.trim().is_empty()
    }

    pub fn parsed_dates(&self) -> Option<(NaiveDate, NaiveDate)> {
        let start = NaiveDate::parse_from_str(self.start_date.trim(), "%Y-%m-%d").ok()?;
        let end = NaiveDate::parse_from_str(self.end_date.trim(), "%Y-%m-%d").ok()?;
        (start <= end).then_some((start, end))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<ReservationPeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub available_spaces: BTreeMap<u32, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
}

impl StepResult {
    pub fn pending(response: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Pending,
            response: response.into(),
            space_id: None,
            period: None,
            next_step: None,
            available_spaces: BTreeMap::new(),
            internal_message: None,
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_next_step(mut self, step: SpaceStep) -> Self {
        self.next_step = Some(step.as_str().to_owned());
        self
    }
}

/// Reservation data already known for the room, merged with what the current
/// step result carries before a transition is validated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub space_id: Option<String>,
    pub period: Option<ReservationPeriod>,
}

impl FlowContext {
    pub fn merged_with(&self, result: &StepResult) -> Self {
        Self {
            space_id: result.space_id.clone().or_else(|| self.space_id.clone()),
            period: result.period.clone().or_else(|| self.period.clone()),
        }
    }

    pub fn missing_reservation_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.space_id.as_deref().map(str::trim).map_or(true, str::is_empty) {
            missing.push("spaceId".to_owned());
        }
        if !self.period.as_ref().is_some_and(ReservationPeriod::is_complete) {
            missing.push("period".to_owned());
        }
        missing
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDisposition {
    Stay,
    Advance,
    ClearWorkflow,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: SpaceStep,
    /// `None` once the workflow is cleared.
    pub to: Option<SpaceStep>,
    pub status: StepStatus,
    pub disposition: StepDisposition,
}
