use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::transport::sse::SseServerTransport;

/// Live SSE sessions keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<SseServerTransport>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SseServerTransport>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, transport: Arc<SseServerTransport>) {
        self.sessions()
            .insert(transport.session_id().to_string(), transport);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SseServerTransport>> {
        self.sessions().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SseServerTransport>> {
        self.sessions().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn tracks_sessions_by_id() {
        let (sink, _events) = mpsc::channel(1);
        let transport = Arc::new(SseServerTransport::new("/message", sink, 1024).expect("session"));
        let id = transport.session_id().to_string();

        let registry = SessionRegistry::new();
        registry.insert(transport);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());
        assert!(registry.get("other").is_none());

        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
    }
}
