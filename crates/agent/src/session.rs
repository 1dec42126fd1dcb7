use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use concierge_core::{AgentId, ApplicationError, ConversationId, RoomId};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::llm::{ConversationApi, ConversationReply, ConversationRequest};

/// Binding between a chat room and a conversation on the provider side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationMapping {
    pub room_id: RoomId,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub store: bool,
    pub last_interaction_time: DateTime<Utc>,
}

impl ConversationMapping {
    /// The boundary instant itself is still live.
    pub fn is_expired(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        now > self.last_interaction_time + expiration
    }
}

pub struct ConversationSessionManager {
    api: Arc<dyn ConversationApi>,
    clock: Arc<dyn Clock>,
    mappings: DashMap<RoomId, ConversationMapping>,
    expiration: Duration,
    store_default: bool,
}

impl ConversationSessionManager {
    pub fn new(api: Arc<dyn ConversationApi>, expiration: Duration) -> Self {
        Self::with_clock(api, expiration, Arc::new(SystemClock))
    }

    pub fn with_clock(api: Arc<dyn ConversationApi>, expiration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { api, clock, mappings: DashMap::new(), expiration, store_default: true }
    }

    pub fn with_store_default(mut self, store: bool) -> Self {
        self.store_default = store;
        self
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Starts a fresh provider conversation and replaces any prior mapping.
    pub async fn start_conversation(
        &self,
        room_id: &RoomId,
        agent_id: &AgentId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        let reply = self.api.start_conversation(agent_id, request, store).await?;
        let mapping = ConversationMapping {
            room_id: room_id.clone(),
            conversation_id: reply.conversation_id.clone(),
            agent_id: agent_id.clone(),
            store,
            last_interaction_time: self.clock.now(),
        };
        if let Some(replaced) = self.mappings.insert(room_id.clone(), mapping) {
            if replaced.conversation_id != reply.conversation_id {
                self.api.release_conversation(&replaced.conversation_id);
            }
        }
        info!(
            event_name = "session.conversation_started",
            room_id = %room_id,
            agent_id = %agent_id,
            conversation_id = %reply.conversation_id,
            "conversation started"
        );
        Ok(reply)
    }

    /// Appends to the room's conversation. An expired mapping is restarted
    /// with the same agent and store flag instead of being appended to.
    pub async fn append_conversation(
        &self,
        room_id: &RoomId,
        request: &ConversationRequest,
    ) -> Result<ConversationReply, ApplicationError> {
        let mapping = self
            .mappings
            .get(room_id)
            .map(|mapping| mapping.value().clone())
            .ok_or_else(|| ApplicationError::NoConversation { room_id: room_id.to_string() })?;

        if mapping.is_expired(self.clock.now(), self.expiration) {
            info!(
                event_name = "session.conversation_expired",
                room_id = %room_id,
                conversation_id = %mapping.conversation_id,
                "conversation expired, restarting"
            );
            return self.start_conversation(room_id, &mapping.agent_id, request, mapping.store).await;
        }

        let reply = self.api.append_conversation(&mapping.conversation_id, request, mapping.store).await?;
        let now = self.clock.now();
        // The room may have been restarted, cleared or swept while the
        // provider answered. Only the mapping this append was made on moves.
        let advanced = match self.mappings.get_mut(room_id) {
            Some(mut current)
                if current.conversation_id == mapping.conversation_id && current.agent_id == mapping.agent_id =>
            {
                current.conversation_id = reply.conversation_id.clone();
                current.last_interaction_time = now;
                true
            }
            _ => false,
        };
        if !advanced {
            info!(
                event_name = "session.append_superseded",
                room_id = %room_id,
                conversation_id = %reply.conversation_id,
                "room mapping changed during append, keeping the newer one"
            );
            if self.conversation_id(room_id).as_ref() != Some(&reply.conversation_id) {
                self.api.release_conversation(&reply.conversation_id);
            }
            return Ok(reply);
        }
        debug!(
            event_name = "session.conversation_appended",
            room_id = %room_id,
            conversation_id = %reply.conversation_id,
            "conversation appended"
        );
        Ok(reply)
    }

    pub fn should_create_new_conversation(&self, room_id: &RoomId, agent_id: &AgentId) -> bool {
        match self.mappings.get(room_id) {
            None => true,
            Some(mapping) => {
                mapping.is_expired(self.clock.now(), self.expiration) || &mapping.agent_id != agent_id
            }
        }
    }

    /// Start-or-append entry point used by the agents.
    pub async fn converse(
        &self,
        room_id: &RoomId,
        agent_id: &AgentId,
        request: &ConversationRequest,
    ) -> Result<ConversationReply, ApplicationError> {
        if self.should_create_new_conversation(room_id, agent_id) {
            self.start_conversation(room_id, agent_id, request, self.store_default).await
        } else {
            self.append_conversation(room_id, request).await
        }
    }

    pub fn conversation_id(&self, room_id: &RoomId) -> Option<ConversationId> {
        self.mappings.get(room_id).map(|mapping| mapping.conversation_id.clone())
    }

    pub fn agent_id(&self, room_id: &RoomId) -> Option<AgentId> {
        self.mappings.get(room_id).map(|mapping| mapping.agent_id.clone())
    }

    pub fn mapping(&self, room_id: &RoomId) -> Option<ConversationMapping> {
        self.mappings.get(room_id).map(|mapping| mapping.value().clone())
    }

    pub fn has_active_conversation(&self, room_id: &RoomId) -> bool {
        self.mappings
            .get(room_id)
            .is_some_and(|mapping| !mapping.is_expired(self.clock.now(), self.expiration))
    }

    pub fn clear_conversation(&self, room_id: &RoomId) -> bool {
        match self.mappings.remove(room_id) {
            Some((_, mapping)) => {
                self.api.release_conversation(&mapping.conversation_id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Drops every mapping expired at call time. Expiry is re-checked under
    /// each entry's lock so a concurrent append keeps its mapping.
    pub fn expire_idle(&self) -> usize {
        let now = self.clock.now();
        let candidates = self
            .mappings
            .iter()
            .filter(|mapping| mapping.is_expired(now, self.expiration))
            .map(|mapping| mapping.key().clone())
            .collect::<Vec<_>>();

        let mut removed = 0;
        for room_id in candidates {
            let dropped = self.mappings.remove_if(&room_id, |_, mapping| mapping.is_expired(now, self.expiration));
            if let Some((_, mapping)) = dropped {
                self.api.release_conversation(&mapping.conversation_id);
                removed += 1;
                debug!(event_name = "session.mapping_expired", room_id = %room_id, "mapping expired");
            }
        }
        if removed > 0 {
            info!(event_name = "session.sweep_completed", removed, "expired idle conversations");
        }
        removed
    }

    /// Runs `expire_idle` every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, interval: StdDuration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(event_name = "session.sweeper_stopped", "conversation sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.expire_idle();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use concierge_core::{AgentId, ApplicationError, ConversationId, RoomId};
    use tokio::sync::{Mutex, Notify};
    use tokio_util::sync::CancellationToken;

    use super::ConversationSessionManager;
    use crate::clock::ManualClock;
    use crate::llm::{ConversationApi, ConversationOutput, ConversationReply, ConversationRequest};

    #[derive(Debug, Default)]
    struct CountingState {
        next: u32,
        calls: VecDeque<String>,
    }

    #[derive(Default)]
    struct CountingApi {
        state: Mutex<CountingState>,
        released: std::sync::Mutex<Vec<String>>,
    }

    impl CountingApi {
        async fn calls(&self) -> Vec<String> {
            self.state.lock().await.calls.iter().cloned().collect()
        }

        fn released(&self) -> Vec<String> {
            self.released.lock().map(|released| released.clone()).unwrap_or_default()
        }

        async fn reply(&self, call: String) -> ConversationReply {
            let mut state = self.state.lock().await;
            state.next += 1;
            state.calls.push_back(call);
            ConversationReply {
                conversation_id: ConversationId::new(format!("conv-{}", state.next)),
                outputs: vec![ConversationOutput::Message("ok".to_owned())],
            }
        }
    }

    #[async_trait]
    impl ConversationApi for CountingApi {
        async fn start_conversation(
            &self,
            agent_id: &AgentId,
            _request: &ConversationRequest,
            store: bool,
        ) -> Result<ConversationReply, ApplicationError> {
            Ok(self.reply(format!("start:{agent_id}:{store}")).await)
        }

        async fn append_conversation(
            &self,
            conversation_id: &ConversationId,
            _request: &ConversationRequest,
            _store: bool,
        ) -> Result<ConversationReply, ApplicationError> {
            Ok(self.reply(format!("append:{conversation_id}")).await)
        }

        fn release_conversation(&self, conversation_id: &ConversationId) {
            if let Ok(mut released) = self.released.lock() {
                released.push(conversation_id.to_string());
            }
        }
    }

    /// Appends park until `release` fires so a test can interleave other calls.
    #[derive(Default)]
    struct GatedApi {
        append_entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ConversationApi for GatedApi {
        async fn start_conversation(
            &self,
            agent_id: &AgentId,
            _request: &ConversationRequest,
            _store: bool,
        ) -> Result<ConversationReply, ApplicationError> {
            Ok(ConversationReply {
                conversation_id: ConversationId::new(format!("conv-of-{agent_id}")),
                outputs: Vec::new(),
            })
        }

        async fn append_conversation(
            &self,
            conversation_id: &ConversationId,
            _request: &ConversationRequest,
            _store: bool,
        ) -> Result<ConversationReply, ApplicationError> {
            self.append_entered.notify_one();
            self.release.notified().await;
            Ok(ConversationReply {
                conversation_id: ConversationId::new(format!("{conversation_id}-next")),
                outputs: Vec::new(),
            })
        }
    }

    fn gated_manager() -> (Arc<GatedApi>, Arc<ConversationSessionManager>) {
        let api = Arc::new(GatedApi::default());
        let manager = Arc::new(ConversationSessionManager::new(api.clone(), Duration::minutes(10)));
        (api, manager)
    }

    fn manager() -> (Arc<CountingApi>, Arc<ManualClock>, ConversationSessionManager) {
        let api = Arc::new(CountingApi::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).single().expect("valid instant"),
        ));
        let manager = ConversationSessionManager::with_clock(api.clone(), Duration::minutes(10), clock.clone());
        (api, clock, manager)
    }

    fn request() -> ConversationRequest {
        ConversationRequest::user_message("bonjour", None, Vec::new())
    }

    #[tokio::test]
    async fn append_without_mapping_is_an_error() {
        let (_, _, manager) = manager();
        let error = manager.append_conversation(&RoomId::new("!a"), &request()).await;
        assert!(matches!(error, Err(ApplicationError::NoConversation { .. })));
    }

    #[tokio::test]
    async fn expiry_boundary_is_inclusive() {
        let (_, clock, manager) = manager();
        let room = RoomId::new("!a");
        manager
            .start_conversation(&room, &AgentId::new("agent-space"), &request(), true)
            .await
            .expect("started");
        let mapping = manager.mapping(&room).expect("mapping");
        let ten_minutes = Duration::minutes(10);

        let start = mapping.last_interaction_time;
        assert!(!mapping.is_expired(start + ten_minutes - Duration::seconds(1), ten_minutes));
        assert!(!mapping.is_expired(start + ten_minutes, ten_minutes));
        assert!(mapping.is_expired(start + ten_minutes + Duration::seconds(1), ten_minutes));

        clock.advance(ten_minutes);
        assert!(manager.has_active_conversation(&room));
        clock.advance(Duration::seconds(1));
        assert!(!manager.has_active_conversation(&room));
    }

    #[tokio::test]
    async fn should_create_truth_table() {
        let (_, clock, manager) = manager();
        let room = RoomId::new("!a");
        let space = AgentId::new("agent-space");
        let general = AgentId::new("agent-general");

        assert!(manager.should_create_new_conversation(&room, &space));
        manager.start_conversation(&room, &space, &request(), true).await.expect("started");
        assert!(!manager.should_create_new_conversation(&room, &space));
        assert!(manager.should_create_new_conversation(&room, &general));
        clock.advance(Duration::minutes(11));
        assert!(manager.should_create_new_conversation(&room, &space));
    }

    #[tokio::test]
    async fn append_replaces_the_conversation_id_and_expired_append_restarts() {
        let (api, clock, manager) = manager();
        let room = RoomId::new("!a");
        let agent = AgentId::new("agent-space");

        manager.start_conversation(&room, &agent, &request(), false).await.expect("started");
        clock.advance(Duration::minutes(5));
        let appended = manager.append_conversation(&room, &request()).await.expect("appended");
        assert_eq!(appended.conversation_id.as_str(), "conv-2");
        assert_eq!(manager.conversation_id(&room), Some(ConversationId::new("conv-2")));

        clock.advance(Duration::minutes(12));
        let restarted = manager.append_conversation(&room, &request()).await.expect("restarted");
        assert_eq!(restarted.conversation_id.as_str(), "conv-3");
        assert_eq!(
            api.calls().await,
            vec!["start:agent-space:false", "append:conv-1", "start:agent-space:false"]
        );
        assert_eq!(manager.agent_id(&room), Some(agent));
    }

    #[tokio::test]
    async fn slow_append_does_not_overwrite_a_restart_for_another_agent() {
        let (api, manager) = gated_manager();
        let room = RoomId::new("!a");
        manager.start_conversation(&room, &AgentId::new("general"), &request(), true).await.expect("started");

        let pending = tokio::spawn({
            let manager = manager.clone();
            let room = room.clone();
            async move { manager.append_conversation(&room, &request()).await }
        });
        api.append_entered.notified().await;
        manager.start_conversation(&room, &AgentId::new("space"), &request(), true).await.expect("restarted");
        api.release.notify_one();

        let appended = pending.await.expect("joined").expect("appended");
        assert_eq!(appended.conversation_id.as_str(), "conv-of-general-next");
        assert_eq!(manager.agent_id(&room), Some(AgentId::new("space")));
        assert_eq!(manager.conversation_id(&room), Some(ConversationId::new("conv-of-space")));
    }

    #[tokio::test]
    async fn slow_append_does_not_resurrect_a_cleared_room() {
        let (api, manager) = gated_manager();
        let room = RoomId::new("!a");
        manager.start_conversation(&room, &AgentId::new("space"), &request(), true).await.expect("started");

        let pending = tokio::spawn({
            let manager = manager.clone();
            let room = room.clone();
            async move { manager.append_conversation(&room, &request()).await }
        });
        api.append_entered.notified().await;
        assert!(manager.clear_conversation(&room));
        api.release.notify_one();

        pending.await.expect("joined").expect("appended");
        assert!(manager.mapping(&room).is_none());
    }

    #[tokio::test]
    async fn dropped_and_replaced_conversations_are_released() {
        let (api, clock, manager) = manager();
        let agent = AgentId::new("agent-general");
        manager.start_conversation(&RoomId::new("!a"), &agent, &request(), true).await.expect("started");
        manager.start_conversation(&RoomId::new("!b"), &agent, &request(), true).await.expect("started");
        manager.start_conversation(&RoomId::new("!c"), &agent, &request(), true).await.expect("started");

        manager
            .start_conversation(&RoomId::new("!a"), &AgentId::new("agent-space"), &request(), true)
            .await
            .expect("restarted");
        assert!(manager.clear_conversation(&RoomId::new("!b")));
        clock.advance(Duration::minutes(11));
        assert_eq!(manager.expire_idle(), 2);

        let mut released = api.released();
        assert_eq!(released[..2], ["conv-1", "conv-2"]);
        released.sort();
        assert_eq!(released, vec!["conv-1", "conv-2", "conv-3", "conv-4"]);
    }

    #[tokio::test]
    async fn expire_idle_only_drops_stale_mappings() {
        let (_, clock, manager) = manager();
        let agent = AgentId::new("agent-general");
        manager.start_conversation(&RoomId::new("!old"), &agent, &request(), true).await.expect("started");
        clock.advance(Duration::minutes(8));
        manager.start_conversation(&RoomId::new("!new"), &agent, &request(), true).await.expect("started");
        clock.advance(Duration::minutes(3));

        assert_eq!(manager.expire_idle(), 1);
        assert!(manager.conversation_id(&RoomId::new("!old")).is_none());
        assert!(manager.conversation_id(&RoomId::new("!new")).is_some());
    }

    #[tokio::test]
    async fn sweeper_expires_mappings_until_cancelled() {
        let (_, clock, manager) = manager();
        let manager = Arc::new(manager);
        manager
            .start_conversation(&RoomId::new("!a"), &AgentId::new("agent-general"), &request(), true)
            .await
            .expect("started");
        clock.advance(Duration::minutes(30));

        let cancel = CancellationToken::new();
        let handle = manager.clone().spawn_sweeper(StdDuration::from_millis(10), cancel.clone());
        for _ in 0..100 {
            if manager.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert!(manager.is_empty());

        cancel.cancel();
        tokio::time::timeout(StdDuration::from_secs(1), handle)
            .await
            .expect("sweeper stops")
            .expect("sweeper joined");
    }
}
