use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::backend::Conversation;
use super::loader::ModelLoader;
use crate::error::ModelError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// One conversation over the shared executor.
///
/// A session minted before an unload keeps its handle but its conversation
/// fails with `BackendError::Unloaded`; the manager stops handing it out.
pub struct Session {
    id: SessionId,
    epoch: u64,
    conversation: Mutex<Box<dyn Conversation>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Run `f` against this session's conversation. Calls on the same
    /// session are serialized.
    pub fn with_conversation<R>(&self, f: impl FnOnce(&mut dyn Conversation) -> R) -> R {
        let mut conversation = self
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(conversation.as_mut())
    }
}

/// Hands out sessions backed by the loaded model.
pub struct SessionManager {
    loader: ModelLoader,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(loader: ModelLoader) -> Self {
        Self {
            loader,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new session.
    ///
    /// Waits out a load in progress. Returns `None` unless a model is loaded.
    pub async fn start_session(&self) -> Option<Arc<Session>> {
        self.start_session_with_id(SessionId::new()).await
    }

    pub(crate) async fn start_session_with_id(&self, id: SessionId) -> Option<Arc<Session>> {
        self.loader.wait_until_settled().await;

        let Some((executor, epoch)) = self.loader.executor_with_epoch() else {
            debug!("Cannot start session: model is {}", self.loader.status());
            return None;
        };

        let conversation = match executor.create_conversation() {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!("Failed to create conversation: {}", e);
                return None;
            }
        };

        let session = Arc::new(Session {
            id,
            epoch,
            conversation: Mutex::new(conversation),
        });

        let stale = {
            let mut sessions = self.lock_sessions();
            let stale = Self::take_stale(&mut sessions, Some(epoch));
            match sessions.entry(id) {
                Entry::Occupied(_) => {
                    drop(sessions);
                    drop(stale);
                    error!("Session id collision on {}, discarding new session", id);
                    return None;
                }
                Entry::Vacant(slot) => {
                    slot.insert(session.clone());
                }
            }
            stale
        };
        drop(stale);

        self.loader.reset_idle_timer();
        info!("Started session {}", id);
        Some(session)
    }

    /// Look up a session. Sessions from an unloaded model are dropped and
    /// reported as absent.
    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let current = self.loader.loaded_epoch();

        let stale = {
            let mut sessions = self.lock_sessions();
            let epoch = sessions.get(&id)?.epoch;
            if Some(epoch) == current {
                return sessions.get(&id).cloned();
            }
            sessions.remove(&id)
        };

        debug!("Session {} outlived its model", id);
        drop(stale);
        None
    }

    /// End a session and release its conversation. Unknown ids are ignored.
    pub fn end_session(&self, id: SessionId) -> bool {
        let removed = self.lock_sessions().remove(&id);
        match removed {
            Some(session) => {
                drop(session);
                info!("Ended session {}", id);
                true
            }
            None => false,
        }
    }

    /// Run `f` against a live session's conversation and defer idle eviction.
    pub fn with_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut dyn Conversation) -> R,
    ) -> Result<R, ModelError> {
        let session = self
            .get_session(id)
            .ok_or_else(|| ModelError::SessionUnavailable(format!("no live session {}", id)))?;

        let result = session.with_conversation(f);
        self.loader.reset_idle_timer();
        Ok(result)
    }

    /// Sessions over the loaded model. Sessions that outlived their model
    /// are dropped first.
    pub fn session_count(&self) -> usize {
        let current = self.loader.loaded_epoch();
        let (count, stale) = {
            let mut sessions = self.lock_sessions();
            let stale = Self::take_stale(&mut sessions, current);
            (sessions.len(), stale)
        };
        drop(stale);
        count
    }

    /// End every session.
    pub fn end_all_sessions(&self) {
        let sessions: Vec<_> = self.lock_sessions().drain().collect();
        if !sessions.is_empty() {
            info!("Ending {} sessions", sessions.len());
        }
        drop(sessions);
    }

    /// Remove sessions minted from a model other than `current`. They are
    /// handed back so their conversations are released outside the lock.
    fn take_stale(
        sessions: &mut HashMap<SessionId, Arc<Session>>,
        current: Option<u64>,
    ) -> Vec<Arc<Session>> {
        let ids: Vec<_> = sessions
            .iter()
            .filter(|(_, session)| Some(session.epoch) != current)
            .map(|(id, _)| *id)
            .collect();
        if !ids.is_empty() {
            debug!("Dropping {} sessions that outlived their model", ids.len());
        }
        ids.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalModelSettings;
    use crate::models::backend::fake::FakeBackend;
    use crate::models::backend::BackendError;
    use crate::models::ModelStatus;
    use crate::notify::Notifier;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn settings_for(dir: &tempfile::TempDir) -> LocalModelSettings {
        let path = dir.path().join("model-q4.gguf");
        std::fs::write(&path, b"GGUF").unwrap();
        LocalModelSettings {
            model_path: Some(path),
            auto_unload: false,
            ..Default::default()
        }
    }

    fn manager_with(backend: FakeBackend) -> (SessionManager, ModelLoader, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let loader = ModelLoader::new(backend.clone(), Notifier::new());
        (SessionManager::new(loader.clone()), loader, backend)
    }

    #[tokio::test]
    async fn test_no_session_without_loaded_model() {
        let (sessions, loader, backend) = manager_with(FakeBackend::new());

        assert!(sessions.start_session().await.is_none());
        assert_eq!(sessions.session_count(), 0);

        backend.fail_weights.store(true, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        loader.load_model(&settings_for(&dir)).await;
        assert_eq!(loader.status(), ModelStatus::Error);

        assert!(sessions.start_session().await.is_none());
        assert_eq!(sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, loader, backend) = manager_with(FakeBackend::new());
        loader.load_model(&settings_for(&dir)).await;

        let first = sessions.start_session().await.unwrap();
        let second = sessions.start_session().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(sessions.session_count(), 2);
        assert_eq!(loader.executor().unwrap().active_conversations(), 2);

        let tokens = sessions
            .with_session(first.id(), |conversation| {
                conversation.prompt("hello there").unwrap();
                conversation.token_count()
            })
            .unwrap();
        assert_eq!(tokens, 2);
        assert_eq!(second.with_conversation(|c| c.token_count()), 0);

        assert!(Arc::ptr_eq(&sessions.get_session(first.id()).unwrap(), &first));

        drop(first);
        let id = second.id();
        drop(second);
        assert!(sessions.end_session(id));
        assert!(!sessions.end_session(id));
        assert!(sessions.get_session(id).is_none());
        assert_eq!(sessions.session_count(), 1);

        sessions.end_all_sessions();
        assert_eq!(sessions.session_count(), 0);
        assert_eq!(backend.counters.live_conversations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_id_collision_discards_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, loader, backend) = manager_with(FakeBackend::new());
        loader.load_model(&settings_for(&dir)).await;

        let id = SessionId::new();
        let original = sessions.start_session_with_id(id).await.unwrap();
        assert!(sessions.start_session_with_id(id).await.is_none());

        assert_eq!(sessions.session_count(), 1);
        assert_eq!(backend.counters.live_conversations.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&sessions.get_session(id).unwrap(), &original));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_session_waits_for_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&dir);
        let (sessions, loader, _backend) =
            manager_with(FakeBackend::with_delay(Duration::from_millis(100)));

        let mut status = loader.watch_status();
        let load = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load_model(&settings).await })
        };
        status
            .wait_for(|s| *s == ModelStatus::Loading)
            .await
            .unwrap();

        assert!(sessions.start_session().await.is_some());
        assert_eq!(loader.status(), ModelStatus::Loaded);
        load.await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_do_not_survive_unload() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&dir);
        let (sessions, loader, backend) = manager_with(FakeBackend::new());
        loader.load_model(&settings).await;

        let session = sessions.start_session().await.unwrap();
        loader.unload_model();

        // The model is gone even though a session handle is still held
        assert_eq!(backend.counters.live_executors.load(Ordering::SeqCst), 0);
        assert!(matches!(
            session.with_conversation(|c| c.prompt("hi")),
            Err(BackendError::Unloaded)
        ));

        loader.load_model(&settings).await;
        assert!(sessions.get_session(session.id()).is_none());
        assert!(matches!(
            sessions.with_session(session.id(), |c| c.token_count()),
            Err(ModelError::SessionUnavailable(_))
        ));
        assert_eq!(sessions.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_prunes_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LocalModelSettings {
            auto_unload: true,
            idle_timeout_minutes: 1,
            ..settings_for(&dir)
        };
        let (sessions, loader, backend) = manager_with(FakeBackend::new());
        loader.load_model(&settings).await;
        sessions.start_session().await.unwrap();
        sessions.start_session().await.unwrap();
        assert_eq!(sessions.session_count(), 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(loader.status(), ModelStatus::Unloaded);
        assert_eq!(sessions.session_count(), 0);
        assert_eq!(backend.counters.live_conversations.load(Ordering::SeqCst), 0);

        // A new load cycle starts from a clean map
        loader.load_model(&settings).await;
        let fresh = sessions.start_session().await.unwrap();
        assert_eq!(sessions.session_count(), 1);
        assert!(Arc::ptr_eq(&sessions.get_session(fresh.id()).unwrap(), &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_activity_defers_idle_unload() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, loader, _backend) = manager_with(FakeBackend::new());
        loader
            .load_model(&LocalModelSettings {
                auto_unload: true,
                idle_timeout_minutes: 1,
                ..settings_for(&dir)
            })
            .await;

        let session = sessions.start_session().await.unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(45)).await;
            sessions
                .with_session(session.id(), |c| c.prompt("still here"))
                .unwrap()
                .unwrap();
        }
        assert_eq!(loader.status(), ModelStatus::Loaded);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(loader.status(), ModelStatus::Unloaded);
    }
}
