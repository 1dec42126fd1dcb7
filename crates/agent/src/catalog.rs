use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use concierge_core::flows::engine::{
    CHECK_SPACE_AVAILABILITY, CREATE_RESERVATION, GENERATE_PAYMENT_LINK, GET_SPACE_INFO,
    LIST_SPACES, SUBMIT_RESERVATION_STEP,
};
use concierge_core::flows::{SpaceStep, StepResult};
use concierge_core::{AuthContext, WorkflowType};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::portal::{NewReservation, PortalBackend, PortalError, ReservationStatus, SpaceKind};
use crate::tools::{parse_arguments, Tool, ToolCallResult, ToolDescriptor, ToolError, ToolInvocationBridge};

pub const GET_MY_RESERVATIONS: &str = "get_my_reservations";
pub const GET_RESIDENT_INFO: &str = "get_resident_info";
pub const GET_INFOS: &str = "get_infos";
pub const GET_EMERGENCY_NUMBERS: &str = "get_emergency_numbers";

/// Registers every portal-backed tool plus the reservation step output tool.
pub fn register_portal_tools(bridge: &mut ToolInvocationBridge, portal: Arc<dyn PortalBackend>) {
    bridge.register(ListSpacesTool { portal: portal.clone() });
    bridge.register(GetSpaceInfoTool { portal: portal.clone() });
    bridge.register(CheckAvailabilityTool { portal: portal.clone() });
    bridge.register(SubmitReservationStepTool);
    bridge.register(CreateReservationTool { portal: portal.clone() });
    bridge.register(GeneratePaymentLinkTool { portal: portal.clone() });
    bridge.register(MyReservationsTool { portal: portal.clone() });
    bridge.register(ResidentInfoTool { portal: portal.clone() });
    bridge.register(BuildingInfosTool { portal: portal.clone() });
    bridge.register(EmergencyNumbersTool { portal });
}

impl From<PortalError> for ToolError {
    fn from(value: PortalError) -> Self {
        match value {
            PortalError::UnknownSpace(_) | PortalError::UnknownReservation(_) => {
                Self::NotFound(value.to_string())
            }
            PortalError::Unavailable { .. } => Self::InvalidArguments(value.to_string()),
            PortalError::Backend(message) => Self::Backend(message),
        }
    }
}

fn period_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "spaceId": {"type": "string"},
            "startDate": {"type": "string", "format": "date"},
            "endDate": {"type": "string", "format": "date"}
        },
        "required": ["spaceId", "startDate", "endDate"]
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpacePeriodArgs {
    space_id: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

impl SpacePeriodArgs {
    fn checked(self) -> Result<Self, ToolError> {
        if self.end_date < self.start_date {
            return Err(ToolError::InvalidArguments("endDate is before startDate".to_string()));
        }
        Ok(self)
    }
}

struct ListSpacesTool {
    portal: Arc<dyn PortalBackend>,
}

#[derive(Debug, Default, Deserialize)]
struct ListSpacesArgs {
    #[serde(default, rename = "type")]
    kind: Option<SpaceKind>,
}

#[async_trait]
impl Tool for ListSpacesTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            LIST_SPACES,
            "Liste les espaces réservables (parkings, salle commune, chambre d'amis), numérotés.",
            json!({
                "type": "object",
                "properties": {
                    "type": {"type": "string", "enum": ["PARKING", "COMMON_ROOM", "GUEST_ROOM", "COWORKING"]}
                }
            }),
        )
        .for_reservation_steps()
    }

    async fn execute(&self, input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let args: ListSpacesArgs = if input.is_null() { ListSpacesArgs::default() } else { parse_arguments(input)? };
        let spaces = self.portal.list_spaces(args.kind).await?;
        if spaces.is_empty() {
            return Ok(ToolCallResult::text("Aucun espace réservable ne correspond."));
        }

        let numbered = spaces
            .iter()
            .enumerate()
            .map(|(index, space)| {
                json!({
                    "number": index + 1,
                    "spaceId": space.id,
                    "name": space.name,
                    "type": space.kind,
                    "pricePerDayCents": space.price_per_day_cents,
                })
            })
            .collect::<Vec<_>>();
        let summary = spaces
            .iter()
            .enumerate()
            .map(|(index, space)| format!("{}. {} ({})", index + 1, space.name, space.id))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolCallResult::structured(json!({ "spaces": numbered })).with_text(summary))
    }
}

struct GetSpaceInfoTool {
    portal: Arc<dyn PortalBackend>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpaceIdArgs {
    space_id: String,
}

#[async_trait]
impl Tool for GetSpaceInfoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            GET_SPACE_INFO,
            "Donne la description et le tarif d'un espace.",
            json!({
                "type": "object",
                "properties": {"spaceId": {"type": "string"}},
                "required": ["spaceId"]
            }),
        )
        .for_reservation_steps()
    }

    async fn execute(&self, input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let args: SpaceIdArgs = parse_arguments(input)?;
        let space = self
            .portal
            .get_space(&args.space_id)
            .await?
            .ok_or_else(|| ToolError::NotFound(format!("space `{}`", args.space_id)))?;
        Ok(ToolCallResult::structured(json!(space)))
    }
}

struct CheckAvailabilityTool {
    portal: Arc<dyn PortalBackend>,
}

#[async_trait]
impl Tool for CheckAvailabilityTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            CHECK_SPACE_AVAILABILITY,
            "Vérifie si un espace est libre sur une période (dates incluses).",
            period_schema(),
        )
        .for_reservation_steps()
    }

    async fn execute(&self, input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let args = parse_arguments::<SpacePeriodArgs>(input)?.checked()?;
        let available = self.portal.is_available(&args.space_id, args.start_date, args.end_date).await?;
        Ok(ToolCallResult::structured(json!({
            "spaceId": args.space_id,
            "startDate": args.start_date,
            "endDate": args.end_date,
            "available": available,
        })))
    }
}

/// Structured output of the CHOOSE_SPACE step. The reservation agent reads the
/// arguments directly; executing it only validates their shape.
struct SubmitReservationStepTool;

#[async_trait]
impl Tool for SubmitReservationStepTool {
    fn descriptor(&self) -> ToolDescriptor {
        let steps = SpaceStep::ALL.iter().map(SpaceStep::as_str).collect::<Vec<_>>();
        ToolDescriptor::new(
            SUBMIT_RESERVATION_STEP,
            "Soumet le résultat de l'étape de réservation en cours.",
            json!({
                "type": "object",
                "properties": {
                    "status": {"type": "string", "enum": ["PENDING", "ASK_USER", "SWITCH_STEP", "COMPLETED", "CANCELED"]},
                    "response": {"type": "string"},
                    "spaceId": {"type": "string"},
                    "period": {
                        "type": "object",
                        "properties": {
                            "startDate": {"type": "string"},
                            "endDate": {"type": "string"},
                            "startTime": {"type": "string"},
                            "endTime": {"type": "string"}
                        }
                    },
                    "nextStep": {"type": "string", "enum": steps},
                    "availableSpaces": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["status", "response"]
            }),
        )
        .for_reservation_steps()
    }

    async fn execute(&self, input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let result: StepResult = parse_arguments(input)?;
        Ok(ToolCallResult::text(format!("step result accepted ({:?})", result.status)))
    }
}

struct CreateReservationTool {
    portal: Arc<dyn PortalBackend>,
}

#[async_trait]
impl Tool for CreateReservationTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            CREATE_RESERVATION,
            "Crée la réservation confirmée par le résident. Ne jamais appeler sans confirmation explicite.",
            period_schema(),
        )
        .for_reservation_steps()
        .mutating()
    }

    async fn execute(&self, input: Value, auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let user = auth.require_user().map_err(|error| ToolError::Forbidden(error.to_string()))?;
        let args = parse_arguments::<SpacePeriodArgs>(input)?.checked()?;

        // The model may call this twice for one confirmation.
        if let Some(existing) =
            self.portal.find_pending_reservation(&user.id, &args.space_id, args.start_date).await?
        {
            info!(
                event_name = "tool.reservation_reused",
                reservation_id = %existing.id,
                room_id = %auth.room_id,
                "pending reservation already exists"
            );
            return Ok(ToolCallResult::structured(json!({
                "reservation": existing,
                "alreadyExisted": true,
            })));
        }

        let reservation = self
            .portal
            .create_reservation(NewReservation {
                space_id: args.space_id,
                user_id: user.id.clone(),
                start_date: args.start_date,
                end_date: args.end_date,
            })
            .await?;
        info!(
            event_name = "tool.reservation_created",
            reservation_id = %reservation.id,
            room_id = %auth.room_id,
            "reservation created"
        );
        Ok(ToolCallResult::structured(json!({ "reservation": reservation, "alreadyExisted": false })))
    }
}

struct GeneratePaymentLinkTool {
    portal: Arc<dyn PortalBackend>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentLinkArgs {
    #[serde(default)]
    reservation_id: Option<String>,
}

#[async_trait]
impl Tool for GeneratePaymentLinkTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            GENERATE_PAYMENT_LINK,
            "Génère le lien de paiement d'une réservation en attente de paiement.",
            json!({
                "type": "object",
                "properties": {"reservationId": {"type": "string"}}
            }),
        )
        .for_reservation_steps()
        .mutating()
    }

    async fn execute(&self, input: Value, auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let user = auth.require_user().map_err(|error| ToolError::Forbidden(error.to_string()))?;
        let args: PaymentLinkArgs =
            if input.is_null() { PaymentLinkArgs::default() } else { parse_arguments(input)? };

        let reservation = match args.reservation_id {
            Some(id) => self
                .portal
                .get_reservation(&id)
                .await?
                .ok_or_else(|| ToolError::NotFound(format!("reservation `{id}`")))?,
            None => self
                .portal
                .list_reservations(&user.id)
                .await?
                .into_iter()
                .filter(|reservation| reservation.status == ReservationStatus::PendingPayment)
                .last()
                .ok_or_else(|| ToolError::NotFound("no reservation awaiting payment".to_string()))?,
        };

        if reservation.user_id != user.id {
            return Err(ToolError::Forbidden(format!(
                "reservation `{}` belongs to another resident",
                reservation.id
            )));
        }
        if reservation.status != ReservationStatus::PendingPayment {
            return Err(ToolError::InvalidArguments(format!(
                "reservation `{}` is not awaiting payment",
                reservation.id
            )));
        }

        let link = self.portal.create_payment_link(&reservation).await?;
        Ok(ToolCallResult::structured(json!(link)).with_text(link.url.clone()))
    }
}

struct MyReservationsTool {
    portal: Arc<dyn PortalBackend>,
}

#[async_trait]
impl Tool for MyReservationsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            GET_MY_RESERVATIONS,
            "Liste les réservations du résident.",
            json!({"type": "object", "properties": {}}),
        )
        .for_workflows([WorkflowType::General, WorkflowType::Help, WorkflowType::Support])
    }

    async fn execute(&self, _input: Value, auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let user = auth.require_user().map_err(|error| ToolError::Forbidden(error.to_string()))?;
        let reservations = self.portal.list_reservations(&user.id).await?;
        Ok(ToolCallResult::structured(json!({ "reservations": reservations })))
    }
}

struct ResidentInfoTool {
    portal: Arc<dyn PortalBackend>,
}

#[derive(Debug, Default, Deserialize)]
struct ResidentQueryArgs {
    #[serde(default)]
    query: String,
}

#[async_trait]
impl Tool for ResidentInfoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            GET_RESIDENT_INFO,
            "Recherche un résident par nom ou numéro de logement.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        )
        .for_workflows([WorkflowType::ResidentInfo])
    }

    async fn execute(&self, input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let args: ResidentQueryArgs = parse_arguments(input)?;
        let residents = self.portal.find_residents(&args.query).await?;
        Ok(ToolCallResult::structured(json!({ "residents": residents })))
    }
}

struct BuildingInfosTool {
    portal: Arc<dyn PortalBackend>,
}

#[async_trait]
impl Tool for BuildingInfosTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            GET_INFOS,
            "Informations pratiques sur la copropriété.",
            json!({"type": "object", "properties": {}}),
        )
        .for_workflows([WorkflowType::General, WorkflowType::ResidentInfo, WorkflowType::Help])
    }

    async fn execute(&self, _input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        Ok(ToolCallResult::text(self.portal.building_infos().await?.join("\n")))
    }
}

struct EmergencyNumbersTool {
    portal: Arc<dyn PortalBackend>,
}

#[async_trait]
impl Tool for EmergencyNumbersTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            GET_EMERGENCY_NUMBERS,
            "Numéros d'urgence et contacts du gardien.",
            json!({"type": "object", "properties": {}}),
        )
        .for_workflows([
            WorkflowType::General,
            WorkflowType::ResidentInfo,
            WorkflowType::Help,
            WorkflowType::Support,
        ])
    }

    async fn execute(&self, _input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
        let contacts = self.portal.emergency_contacts().await?;
        Ok(ToolCallResult::structured(json!({ "contacts": contacts })))
    }
}
