use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use concierge_core::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpaceKind {
    Parking,
    CommonRoom,
    GuestRoom,
    Coworking,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub id: String,
    pub name: String,
    pub kind: SpaceKind,
    pub description: String,
    pub price_per_day_cents: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    PendingPayment,
    Confirmed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub space_id: String,
    pub user_id: UserId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: ReservationStatus,
    pub total_price_cents: i64,
}

impl Reservation {
    fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.status != ReservationStatus::Cancelled && self.start_date <= end && start <= self.end_date
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewReservation {
    pub space_id: String,
    pub user_id: UserId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLink {
    pub reservation_id: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resident {
    pub display_name: String,
    pub unit: String,
    pub floor: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContact {
    pub label: String,
    pub phone: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PortalError {
    #[error("unknown space `{0}`")]
    UnknownSpace(String),
    #[error("unknown reservation `{0}`")]
    UnknownReservation(String),
    #[error("space `{space_id}` is not available from {start} to {end}")]
    Unavailable { space_id: String, start: NaiveDate, end: NaiveDate },
    #[error("portal backend failure: {0}")]
    Backend(String),
}

/// Business operations of the residents portal consumed by the assistant.
#[async_trait]
pub trait PortalBackend: Send + Sync {
    async fn list_spaces(&self, kind: Option<SpaceKind>) -> Result<Vec<Space>, PortalError>;
    async fn get_space(&self, space_id: &str) -> Result<Option<Space>, PortalError>;
    async fn is_available(
        &self,
        space_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<bool, PortalError>;
    async fn find_pending_reservation(
        &self,
        user_id: &UserId,
        space_id: &str,
        start: NaiveDate,
    ) -> Result<Option<Reservation>, PortalError>;
    async fn create_reservation(&self, request: NewReservation) -> Result<Reservation, PortalError>;
    async fn get_reservation(&self, reservation_id: &str) -> Result<Option<Reservation>, PortalError>;
    async fn list_reservations(&self, user_id: &UserId) -> Result<Vec<Reservation>, PortalError>;
    async fn create_payment_link(&self, reservation: &Reservation) -> Result<PaymentLink, PortalError>;
    async fn find_residents(&self, query: &str) -> Result<Vec<Resident>, PortalError>;
    async fn building_infos(&self) -> Result<Vec<String>, PortalError>;
    async fn emergency_contacts(&self) -> Result<Vec<EmergencyContact>, PortalError>;
}

#[derive(Default)]
struct PortalState {
    spaces: Vec<Space>,
    reservations: Vec<Reservation>,
    residents: Vec<Resident>,
    infos: Vec<String>,
    contacts: Vec<EmergencyContact>,
}

/// Process-local portal used by tests and by the server when no portal
/// backend is wired.
#[derive(Default)]
pub struct InMemoryPortal {
    state: Mutex<PortalState>,
    payment_base_url: String,
}

impl InMemoryPortal {
    pub fn new(spaces: Vec<Space>) -> Self {
        Self {
            state: Mutex::new(PortalState { spaces, ..PortalState::default() }),
            payment_base_url: "https://pay.neohoods.local/checkout".to_string(),
        }
    }

    pub fn seeded() -> Self {
        let space = |id: &str, name: &str, kind: SpaceKind, description: &str, price: i64| Space {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            description: description.to_string(),
            price_per_day_cents: price,
        };
        let portal = Self::new(vec![
            space("parking-12", "Place de parking 12", SpaceKind::Parking, "Sous-sol -1, accès badge", 500),
            space("parking-14", "Place de parking 14", SpaceKind::Parking, "Sous-sol -1, proche ascenseur", 500),
            space("salle-commune", "Salle commune", SpaceKind::CommonRoom, "Rez-de-chaussée, 30 personnes", 2500),
            space("chambre-amis", "Chambre d'amis", SpaceKind::GuestRoom, "2e étage, lit double", 4000),
        ]);
        portal.with_state(|state| {
            state.residents = vec![
                Resident { display_name: "Alice Martin".to_string(), unit: "A12".to_string(), floor: Some(1) },
                Resident { display_name: "Karim Benali".to_string(), unit: "B03".to_string(), floor: Some(0) },
            ];
            state.infos = vec![
                "Le local vélos est accessible avec le badge résident.".to_string(),
                "Les encombrants sont collectés le premier lundi du mois.".to_string(),
            ];
            state.contacts = vec![
                EmergencyContact { label: "Urgences européennes".to_string(), phone: "112".to_string() },
                EmergencyContact { label: "Gardien".to_string(), phone: "01 23 45 67 89".to_string() },
            ];
        });
        portal
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.with_state(|state| state.reservations.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut PortalState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl PortalBackend for InMemoryPortal {
    async fn list_spaces(&self, kind: Option<SpaceKind>) -> Result<Vec<Space>, PortalError> {
        Ok(self.with_state(|state| {
            state
                .spaces
                .iter()
                .filter(|space| kind.map_or(true, |kind| space.kind == kind))
                .cloned()
                .collect()
        }))
    }

    async fn get_space(&self, space_id: &str) -> Result<Option<Space>, PortalError> {
        Ok(self.with_state(|state| state.spaces.iter().find(|space| space.id == space_id).cloned()))
    }

    async fn is_available(
        &self,
        space_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<bool, PortalError> {
        self.with_state(|state| {
            if !state.spaces.iter().any(|space| space.id == space_id) {
                return Err(PortalError::UnknownSpace(space_id.to_string()));
            }
            Ok(!state
                .reservations
                .iter()
                .any(|reservation| reservation.space_id == space_id && reservation.overlaps(start, end)))
        })
    }

    async fn find_pending_reservation(
        &self,
        user_id: &UserId,
        space_id: &str,
        start: NaiveDate,
    ) -> Result<Option<Reservation>, PortalError> {
        Ok(self.with_state(|state| {
            state
                .reservations
                .iter()
                .find(|reservation| {
                    reservation.status == ReservationStatus::PendingPayment
                        && &reservation.user_id == user_id
                        && reservation.space_id == space_id
                        && reservation.start_date == start
                })
                .cloned()
        }))
    }

    async fn create_reservation(&self, request: NewReservation) -> Result<Reservation, PortalError> {
        self.with_state(|state| {
            let space = state
                .spaces
                .iter()
                .find(|space| space.id == request.space_id)
                .ok_or_else(|| PortalError::UnknownSpace(request.space_id.clone()))?;
            let taken = state.reservations.iter().any(|reservation| {
                reservation.space_id == request.space_id
                    && reservation.overlaps(request.start_date, request.end_date)
            });
            if taken {
                return Err(PortalError::Unavailable {
                    space_id: request.space_id.clone(),
                    start: request.start_date,
                    end: request.end_date,
                });
            }

            let days = (request.end_date - request.start_date).num_days() + 1;
            let reservation = Reservation {
                id: format!("res-{}", Uuid::new_v4().simple()),
                space_id: request.space_id,
                user_id: request.user_id,
                start_date: request.start_date,
                end_date: request.end_date,
                status: ReservationStatus::PendingPayment,
                total_price_cents: space.price_per_day_cents.saturating_mul(days),
            };
            state.reservations.push(reservation.clone());
            Ok(reservation)
        })
    }

    async fn get_reservation(&self, reservation_id: &str) -> Result<Option<Reservation>, PortalError> {
        Ok(self.with_state(|state| {
            state.reservations.iter().find(|reservation| reservation.id == reservation_id).cloned()
        }))
    }

    async fn list_reservations(&self, user_id: &UserId) -> Result<Vec<Reservation>, PortalError> {
        Ok(self.with_state(|state| {
            state
                .reservations
                .iter()
                .filter(|reservation| &reservation.user_id == user_id)
                .cloned()
                .collect()
        }))
    }

    async fn create_payment_link(&self, reservation: &Reservation) -> Result<PaymentLink, PortalError> {
        Ok(PaymentLink {
            reservation_id: reservation.id.clone(),
            url: format!("{}/{}", self.payment_base_url, reservation.id),
        })
    }

    async fn find_residents(&self, query: &str) -> Result<Vec<Resident>, PortalError> {
        let needle = query.trim().to_lowercase();
        Ok(self.with_state(|state| {
            state
                .residents
                .iter()
                .filter(|resident| {
                    needle.is_empty()
                        || resident.display_name.to_lowercase().contains(&needle)
                        || resident.unit.to_lowercase() == needle
                })
                .cloned()
                .collect()
        }))
    }

    async fn building_infos(&self) -> Result<Vec<String>, PortalError> {
        Ok(self.with_state(|state| state.infos.clone()))
    }

    async fn emergency_contacts(&self) -> Result<Vec<EmergencyContact>, PortalError> {
        Ok(self.with_state(|state| state.contacts.clone()))
    }
}
