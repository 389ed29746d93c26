use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use concierge_core::domain::context::{
    sort_guides, ContextBaseEntry, DatabaseAccessPolicy, QuickHelpItem, QuickHelpSet, RoleContext,
    SystemGuide, UpsertAction,
};
use concierge_core::domain::message::{chronological_window, ChatMessage};
use concierge_core::domain::session::{Session, SessionId, SessionSummary};
use concierge_core::domain::user::UserId;
use concierge_core::rate_limit::{window_start, ConsumeOutcome, RateWindow, RoleRateLimit};

use super::{ContextRepository, RateWindowRepository, RepositoryError, SessionRepository};

#[derive(Default)]
struct SessionStore {
    sessions: HashMap<String, Session>,
    /// Per session, in append order.
    messages: HashMap<String, Vec<ChatMessage>>,
}

impl SessionStore {
    /// Chronological by creation time; equal instants keep append order.
    fn ordered_messages(&self, session_id: &SessionId) -> Vec<ChatMessage> {
        let mut messages = self.messages.get(&session_id.0).cloned().unwrap_or_default();
        messages.sort_by_key(|message| message.created_at);
        messages
    }
}

#[derive(Default)]
pub struct InMemorySessionRepository {
    store: RwLock<SessionStore>,
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: Session) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        store.messages.entry(session.id.0.clone()).or_default();
        store.sessions.insert(session.id.0.clone(), session);
        Ok(())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.sessions.get(&id.0).cloned())
    }

    async fn find_active_for_user(
        &self,
        id: &SessionId,
        user_id: &UserId,
    ) -> Result<Option<Session>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .sessions
            .get(&id.0)
            .filter(|session| session.is_active && session.is_owned_by(user_id))
            .cloned())
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<SessionSummary>, RepositoryError> {
        let store = self.store.read().await;
        let mut summaries: Vec<SessionSummary> = store
            .sessions
            .values()
            .filter(|session| session.is_owned_by(user_id))
            .map(SessionSummary::from)
            .collect();
        summaries.sort_by(|left, right| {
            right.updated_at.cmp(&left.updated_at).then(right.created_at.cmp(&left.created_at))
        });
        Ok(summaries)
    }

    async fn append_message(&self, message: ChatMessage) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        let Some(session) = store.sessions.get_mut(&message.session_id.0) else {
            return Err(RepositoryError::NotFound(format!("session {}", message.session_id.0)));
        };
        session.message_ids.push(message.id.clone());
        session.updated_at = message.created_at;
        store.messages.entry(message.session_id.0.clone()).or_default().push(message);
        Ok(())
    }

    async fn recent_window(
        &self,
        session_id: &SessionId,
        window: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let store = self.store.read().await;
        let newest_first: Vec<ChatMessage> = store
            .ordered_messages(session_id)
            .into_iter()
            .rev()
            .take(window.saturating_mul(2))
            .collect();
        Ok(chronological_window(newest_first, window))
    }

    async fn transcript(&self, session_id: &SessionId) -> Result<Vec<ChatMessage>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.ordered_messages(session_id))
    }

    async fn close(
        &self,
        id: &SessionId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut store = self.store.write().await;
        match store.sessions.get_mut(&id.0) {
            Some(session) if session.is_active && session.is_owned_by(user_id) => {
                session.is_active = false;
                session.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &SessionId, user_id: &UserId) -> Result<bool, RepositoryError> {
        let mut store = self.store.write().await;
        let owned = store.sessions.get(&id.0).map(|s| s.is_owned_by(user_id)).unwrap_or(false);
        if !owned {
            return Ok(false);
        }
        store.messages.remove(&id.0);
        store.sessions.remove(&id.0);
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryRateWindowRepository {
    windows: RwLock<HashMap<(String, DateTime<Utc>), RateWindow>>,
}

#[async_trait::async_trait]
impl RateWindowRepository for InMemoryRateWindowRepository {
    async fn find(
        &self,
        user_id: &UserId,
        window_start: DateTime<Utc>,
    ) -> Result<Option<RateWindow>, RepositoryError> {
        let windows = self.windows.read().await;
        Ok(windows.get(&(user_id.0.clone(), window_start)).cloned())
    }

    async fn save(&self, window: RateWindow) -> Result<(), RepositoryError> {
        let mut windows = self.windows.write().await;
        windows.insert((window.user_id.0.clone(), window.window_start), window);
        Ok(())
    }

    async fn consume(
        &self,
        user_id: &UserId,
        points: u32,
        limits: &RoleRateLimit,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, RepositoryError> {
        let mut windows = self.windows.write().await;
        let window = windows
            .entry((user_id.0.clone(), window_start(now)))
            .or_insert_with(|| RateWindow::open(user_id.clone(), now));
        Ok(window.consume(points, limits, now))
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, window| window.window_start >= cutoff);
        Ok((before - windows.len()) as u64)
    }

    async fn delete_for_user(&self, user_id: &UserId) -> Result<u64, RepositoryError> {
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|(owner, _), _| owner != &user_id.0);
        Ok((before - windows.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryContextRepository {
    role_contexts: RwLock<HashMap<String, RoleContext>>,
    guides: RwLock<HashMap<String, SystemGuide>>,
    policies: RwLock<HashMap<String, DatabaseAccessPolicy>>,
    context_base: RwLock<HashMap<String, ContextBaseEntry>>,
    quick_help: RwLock<QuickHelpStore>,
}

#[derive(Default)]
struct QuickHelpStore {
    items: Vec<QuickHelpItem>,
    next_id: i64,
}

#[async_trait::async_trait]
impl ContextRepository for InMemoryContextRepository {
    async fn role_context(&self, role_code: &str) -> Result<Option<RoleContext>, RepositoryError> {
        let contexts = self.role_contexts.read().await;
        Ok(contexts.get(role_code).filter(|context| context.is_active).cloned())
    }

    async fn guides_for_role(&self, role_code: &str) -> Result<Vec<SystemGuide>, RepositoryError> {
        let guides = self.guides.read().await;
        let mut matching: Vec<SystemGuide> = guides
            .values()
            .filter(|guide| guide.is_active && guide.applies_to(role_code))
            .cloned()
            .collect();
        sort_guides(&mut matching);
        Ok(matching)
    }

    async fn guide_by_key(&self, key: &str) -> Result<Option<SystemGuide>, RepositoryError> {
        let guides = self.guides.read().await;
        Ok(guides.get(key).filter(|guide| guide.is_active).cloned())
    }

    async fn access_policy(
        &self,
        role_code: &str,
    ) -> Result<Option<DatabaseAccessPolicy>, RepositoryError> {
        let policies = self.policies.read().await;
        Ok(policies.get(role_code).filter(|policy| policy.is_active).cloned())
    }

    async fn context_base(&self, key: &str) -> Result<Option<ContextBaseEntry>, RepositoryError> {
        let entries = self.context_base.read().await;
        Ok(entries.get(key).filter(|entry| entry.is_active).cloned())
    }

    async fn active_context_base(&self) -> Result<Vec<ContextBaseEntry>, RepositoryError> {
        let entries = self.context_base.read().await;
        let mut active: Vec<ContextBaseEntry> =
            entries.values().filter(|entry| entry.is_active).cloned().collect();
        active.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(active)
    }

    async fn quick_help_for_role(
        &self,
        role_code: &str,
    ) -> Result<Vec<QuickHelpItem>, RepositoryError> {
        let store = self.quick_help.read().await;
        let mut items: Vec<QuickHelpItem> = store
            .items
            .iter()
            .filter(|item| item.is_active && item.role_code == role_code)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.order, item.id));
        Ok(items)
    }

    async fn upsert_role_context(
        &self,
        context: RoleContext,
    ) -> Result<UpsertAction, RepositoryError> {
        let mut contexts = self.role_contexts.write().await;
        let previous = contexts.insert(context.role_code.clone(), context);
        Ok(UpsertAction::from_existing(previous.is_some()))
    }

    async fn upsert_guide(&self, guide: SystemGuide) -> Result<UpsertAction, RepositoryError> {
        let mut guides = self.guides.write().await;
        let previous = guides.insert(guide.key.clone(), guide);
        Ok(UpsertAction::from_existing(previous.is_some()))
    }

    async fn upsert_access_policy(
        &self,
        policy: DatabaseAccessPolicy,
    ) -> Result<UpsertAction, RepositoryError> {
        let mut policies = self.policies.write().await;
        let previous = policies.insert(policy.role_code.clone(), policy);
        Ok(UpsertAction::from_existing(previous.is_some()))
    }

    async fn upsert_context_base(
        &self,
        mut entry: ContextBaseEntry,
    ) -> Result<UpsertAction, RepositoryError> {
        let mut entries = self.context_base.write().await;
        let previous = entries.get(&entry.key);
        if entry.description.is_none() {
            entry.description = previous.and_then(|stored| stored.description.clone());
        }
        let existed = previous.is_some();
        entries.insert(entry.key.clone(), entry);
        Ok(UpsertAction::from_existing(existed))
    }

    async fn replace_quick_help(
        &self,
        set: QuickHelpSet,
    ) -> Result<Vec<QuickHelpItem>, RepositoryError> {
        let mut store = self.quick_help.write().await;
        store.items.retain(|item| item.role_code != set.role_code);

        let mut created = Vec::with_capacity(set.questions.len());
        for (index, question) in set.questions.into_iter().enumerate() {
            store.next_id += 1;
            created.push(QuickHelpItem {
                id: store.next_id,
                role_code: set.role_code.clone(),
                question,
                order: u32::try_from(index + 1).unwrap_or(u32::MAX),
                keywords: set.keywords.clone(),
                is_active: true,
            });
        }
        store.items.extend(created.iter().cloned());
        Ok(created)
    }
}
