use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use concierge_core::flows::{FlowContext, ReservationPeriod, SpaceStep};
use concierge_core::{RoomId, WorkflowType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

pub const RESERVATION_STEP_KEY: &str = "reservationStep";
pub const SPACE_ID_KEY: &str = "spaceId";
pub const PERIOD_KEY: &str = "period";
pub const AVAILABLE_SPACES_KEY: &str = "availableSpaces";

/// Per-room workflow memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub room_id: RoomId,
    pub current_workflow: Option<WorkflowType>,
    pub workflow_state: BTreeMap<String, Value>,
    pub last_updated: DateTime<Utc>,
    pub last_interaction_time: DateTime<Utc>,
}

impl AgentContext {
    pub fn new(room_id: RoomId, now: DateTime<Utc>) -> Self {
        Self {
            room_id,
            current_workflow: None,
            workflow_state: BTreeMap::new(),
            last_updated: now,
            last_interaction_time: now,
        }
    }

    /// Stored reservation step. Unknown or missing values fall back to the
    /// initial step.
    pub fn reservation_step(&self) -> SpaceStep {
        self.workflow_state
            .get(RESERVATION_STEP_KEY)
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    pub fn flow_context(&self) -> FlowContext {
        FlowContext {
            space_id: self
                .workflow_state
                .get(SPACE_ID_KEY)
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .map(str::to_owned),
            period: self
                .workflow_state
                .get(PERIOD_KEY)
                .and_then(|value| serde_json::from_value::<ReservationPeriod>(value.clone()).ok()),
        }
    }

    /// Space id offered under `number` by the last listing, if any.
    pub fn offered_space(&self, number: u32) -> Option<String> {
        self.workflow_state
            .get(AVAILABLE_SPACES_KEY)
            .and_then(Value::as_object)
            .and_then(|spaces| spaces.get(&number.to_string()))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.last_updated = now;
        self.last_interaction_time = now;
    }
}

/// Concurrent map of room contexts. Every mutation goes through the DashMap
/// entry lock of its room, so concurrent updates to one room never interleave.
pub struct AgentContextStore {
    contexts: DashMap<RoomId, AgentContext>,
    clock: Arc<dyn Clock>,
}

impl Default for AgentContextStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl AgentContextStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { contexts: DashMap::new(), clock }
    }

    pub fn get(&self, room_id: &RoomId) -> Option<AgentContext> {
        self.contexts.get(room_id).map(|context| context.value().clone())
    }

    pub fn get_or_create(&self, room_id: &RoomId) -> AgentContext {
        let now = self.clock.now();
        self.contexts
            .entry(room_id.clone())
            .or_insert_with(|| AgentContext::new(room_id.clone(), now))
            .value()
            .clone()
    }

    /// Replaces workflow and state. The caller keeps ownership of `state`.
    pub fn update(
        &self,
        room_id: &RoomId,
        workflow: Option<WorkflowType>,
        state: &BTreeMap<String, Value>,
    ) -> AgentContext {
        self.modify(room_id, |context| {
            context.current_workflow = workflow;
            context.workflow_state = state.clone();
        })
    }

    pub fn set_workflow(&self, room_id: &RoomId, workflow: Option<WorkflowType>) -> AgentContext {
        self.modify(room_id, |context| context.current_workflow = workflow)
    }

    pub fn update_state_key(
        &self,
        room_id: &RoomId,
        key: impl Into<String>,
        value: Value,
    ) -> AgentContext {
        let key = key.into();
        self.modify(room_id, |context| {
            context.workflow_state.insert(key, value);
        })
    }

    /// Read-modify-write of the state map under the room lock.
    pub fn update_state<F>(&self, room_id: &RoomId, f: F) -> AgentContext
    where
        F: FnOnce(&mut BTreeMap<String, Value>),
    {
        self.modify(room_id, |context| f(&mut context.workflow_state))
    }

    pub fn state_value(&self, room_id: &RoomId, key: &str) -> Option<Value> {
        self.contexts.get(room_id).and_then(|context| context.workflow_state.get(key).cloned())
    }

    /// Puts the room back to `snapshot` untouched, timestamps included. A
    /// room that had no context before is dropped.
    pub fn restore(&self, room_id: &RoomId, snapshot: Option<AgentContext>) {
        match snapshot {
            Some(context) => {
                self.contexts.insert(room_id.clone(), context);
            }
            None => {
                self.contexts.remove(room_id);
            }
        }
        debug!(event_name = "context.restored", room_id = %room_id, "agent context restored");
    }

    pub fn clear(&self, room_id: &RoomId) -> bool {
        let removed = self.contexts.remove(room_id).is_some();
        if removed {
            debug!(event_name = "context.cleared", room_id = %room_id, "agent context cleared");
        }
        removed
    }

    pub fn clear_all(&self) -> usize {
        let mut purged = 0;
        self.contexts.retain(|_, _| {
            purged += 1;
            false
        });
        purged
    }

    /// Development reset run once at startup.
    pub fn purge_on_startup(&self, dev_mode: bool) -> usize {
        if !dev_mode {
            return 0;
        }
        let purged = self.clear_all();
        info!(event_name = "context.startup_purge", purged, "purged agent contexts (dev mode)");
        purged
    }

    /// Admin debugging view of one room.
    pub fn dump(&self, room_id: &RoomId) -> String {
        let Some(context) = self.get(room_id) else {
            return format!("Aucun contexte pour le salon {room_id}.");
        };
        let workflow = context.current_workflow.map_or("aucun", |workflow| workflow.as_str());
        let state = serde_json::to_string_pretty(&context.workflow_state)
            .unwrap_or_else(|_| "{}".to_owned());
        format!(
            "Contexte du salon {room_id}\n\
             Workflow courant : {workflow}\n\
             Dernière mise à jour : {}\n\
             Dernière interaction : {}\n\
             État :\n{state}",
            context.last_updated.to_rfc3339(),
            context.last_interaction_time.to_rfc3339(),
        )
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.contexts.contains_key(room_id)
    }

    fn modify(&self, room_id: &RoomId, f: impl FnOnce(&mut AgentContext)) -> AgentContext {
        let now = self.clock.now();
        let mut entry = self
            .contexts
            .entry(room_id.clone())
            .or_insert_with(|| AgentContext::new(room_id.clone(), now));
        f(entry.value_mut());
        entry.bump(now);
        entry.value().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use concierge_core::flows::{ReservationPeriod, SpaceStep};
    use concierge_core::{RoomId, WorkflowType};
    use serde_json::{json, Value};

    use super::{AgentContextStore, PERIOD_KEY, RESERVATION_STEP_KEY, SPACE_ID_KEY};
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, AgentContextStore) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().expect("valid instant"),
        ));
        (clock.clone(), AgentContextStore::new(clock))
    }

    #[test]
    fn get_or_create_is_stable_and_update_bumps_timestamps() {
        let (clock, store) = store();
        let room = RoomId::new("!a");

        let created = store.get_or_create(&room);
        assert!(created.current_workflow.is_none());
        clock.advance(Duration::seconds(30));
        assert_eq!(store.get_or_create(&room).last_updated, created.last_updated);

        let updated = store.set_workflow(&room, Some(WorkflowType::Space));
        assert_eq!(updated.current_workflow, Some(WorkflowType::Space));
        assert_eq!(updated.last_interaction_time, created.last_interaction_time + Duration::seconds(30));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_keeps_a_copy_of_the_callers_state() {
        let (_, store) = store();
        let room = RoomId::new("!a");
        let mut state = BTreeMap::new();
        state.insert(SPACE_ID_KEY.to_owned(), json!("parking-12"));

        store.update(&room, Some(WorkflowType::Space), &state);
        state.insert(SPACE_ID_KEY.to_owned(), json!("salle-commune"));

        assert_eq!(store.state_value(&room, SPACE_ID_KEY), Some(json!("parking-12")));
    }

    #[test]
    fn reservation_helpers_read_typed_state() {
        let (_, store) = store();
        let room = RoomId::new("!a");
        assert_eq!(store.get_or_create(&room).reservation_step(), SpaceStep::RequestSpaceInfo);

        store.update_state(&room, |state| {
            state.insert(RESERVATION_STEP_KEY.to_owned(), json!("CHOOSE_SPACE"));
            state.insert(SPACE_ID_KEY.to_owned(), json!("parking-14"));
            state.insert(PERIOD_KEY.to_owned(), json!({"startDate": "2026-10-20", "endDate": "2026-10-21"}));
            state.insert("availableSpaces".to_owned(), json!({"1": "parking-12", "2": "parking-14"}));
        });

        let context = store.get(&room).expect("context");
        assert_eq!(context.reservation_step(), SpaceStep::ChooseSpace);
        let flow = context.flow_context();
        assert_eq!(flow.space_id.as_deref(), Some("parking-14"));
        assert_eq!(flow.period, Some(ReservationPeriod::new("2026-10-20", "2026-10-21")));
        assert_eq!(context.offered_space(2).as_deref(), Some("parking-14"));
        assert_eq!(context.offered_space(3), None);
    }

    #[test]
    fn clear_all_reports_purged_rooms_and_dev_purge_is_gated() {
        let (_, store) = store();
        for room in ["!a", "!b", "!c"] {
            store.get_or_create(&RoomId::new(room));
        }

        assert_eq!(store.purge_on_startup(false), 0);
        assert_eq!(store.len(), 3);
        assert!(store.clear(&RoomId::new("!a")));
        assert!(!store.clear(&RoomId::new("!a")));
        assert_eq!(store.purge_on_startup(true), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn restore_puts_back_the_snapshot_or_drops_a_new_room() {
        let (clock, store) = store();
        let known = RoomId::new("!known");
        store.update_state_key(&known, SPACE_ID_KEY, json!("parking-12"));
        let snapshot = store.get(&known);

        clock.advance(Duration::minutes(5));
        store.set_workflow(&known, Some(WorkflowType::Support));
        store.restore(&known, snapshot.clone());
        assert_eq!(store.get(&known), snapshot);

        let fresh = RoomId::new("!fresh");
        store.set_workflow(&fresh, Some(WorkflowType::General));
        store.restore(&fresh, None);
        assert!(!store.contains(&fresh));
    }

    #[test]
    fn dump_renders_state_for_admins() {
        let (_, store) = store();
        let room = RoomId::new("!a");
        assert!(store.dump(&room).starts_with("Aucun contexte"));

        store.update_state_key(&room, SPACE_ID_KEY, json!("parking-12"));
        let dump = store.dump(&room);
        assert!(dump.contains("Workflow courant : aucun"));
        assert!(dump.contains("\"spaceId\": \"parking-12\""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_key_updates_are_not_lost() {
        let (_, store) = store();
        let store = Arc::new(store);
        let room = RoomId::new("!busy");

        let mut handles = Vec::new();
        for index in 0..64 {
            let store = store.clone();
            let room = room.clone();
            handles.push(tokio::spawn(async move {
                store.update_state_key(&room, format!("key-{index}"), Value::from(index));
                store.update_state(&room, |state| {
                    let counter = state.get("counter").and_then(Value::as_u64).unwrap_or(0);
                    state.insert("counter".to_owned(), Value::from(counter + 1));
                });
            }));
        }
        for handle in handles {
            handle.await.expect("task joined");
        }

        let context = store.get(&room).expect("context");
        assert_eq!(context.workflow_state.len(), 65);
        assert_eq!(context.workflow_state.get("counter"), Some(&json!(64)));
    }
}
