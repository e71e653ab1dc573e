//! Process-wide session registry.
//!
//! Sessions are keyed by user SID. Creation is gated by the
//! disabled-by-policy flag and by shutdown (`sessions == None` means the
//! server is stopping). The termination lock is always acquired before the
//! map lock; a session's inner lock is never held while calling in here.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use lxhost_shared::errors::{LxError, LxResult};

use crate::netfilter::IpTablesEmulator;
use crate::plugin::PluginManager;

use super::{SessionConfig, SessionPlatform, ShutdownBehavior, UserSession};

pub struct SessionFactory {
    /// Ordered before the map lock.
    termination_lock: ReentrantMutex<()>,
    sessions: Mutex<Option<Vec<UserSession>>>,
    disabled_by_policy: AtomicBool,
    plugins: Arc<PluginManager>,
    platform: SessionPlatform,
    config: SessionConfig,
    next_cookie: AtomicU32,
}

impl SessionFactory {
    pub fn new(
        platform: SessionPlatform,
        config: SessionConfig,
        plugins: Arc<PluginManager>,
    ) -> Self {
        // Clean up host rules left behind by an abnormal exit of a previous
        // service process.
        IpTablesEmulator::cleanup_remnants(&platform.nat, &platform.firewall);

        Self {
            termination_lock: ReentrantMutex::new(()),
            sessions: Mutex::new(Some(Vec::new())),
            disabled_by_policy: AtomicBool::new(false),
            plugins,
            platform,
            config,
            next_cookie: AtomicU32::new(1),
        }
    }

    /// Find the caller's session or create one.
    pub fn get_or_create(&self, user_sid: &str, session_id: u32) -> LxResult<UserSession> {
        let _termination = self.termination_lock.lock();

        if self.disabled_by_policy.load(Ordering::SeqCst) {
            return Err(LxError::AccessDenied("disabled by policy".into()));
        }

        let mut sessions = self.sessions.lock();
        let sessions = sessions.as_mut().ok_or(LxError::ServerStopping)?;

        if let Some(session) = sessions
            .iter()
            .find(|session| session.user_sid() == user_sid)
        {
            return Ok(session.clone());
        }

        let cookie = self.next_cookie.fetch_add(1, Ordering::SeqCst);
        let session = UserSession::new(
            user_sid,
            session_id,
            cookie,
            self.config.clone(),
            self.platform.clone(),
            self.plugins.clone(),
        )?;
        sessions.push(session.clone());
        tracing::info!(user_sid, session_id, cookie, "created session");
        Ok(session)
    }

    pub fn find_by_cookie(&self, cookie: u32) -> Option<UserSession> {
        let sessions = self.sessions.lock();
        sessions
            .as_ref()?
            .iter()
            .find(|session| session.cookie() == cookie)
            .cloned()
    }

    /// Terminate the session for an interactive logon session. The entry is
    /// removed under the lock; shutdown runs outside it.
    pub fn terminate_session(&self, session_id: u32) {
        let _termination = self.termination_lock.lock();

        let session = {
            let mut sessions = self.sessions.lock();
            let Some(sessions) = sessions.as_mut() else {
                return;
            };
            let index = sessions
                .iter()
                .position(|session| session.session_id() == session_id);
            index.map(|index| sessions.remove(index))
        };

        if let Some(session) = session {
            session.shutdown(true, ShutdownBehavior::Wait);
        }
    }

    /// Enable or disable session creation by policy. Disabling drains all
    /// existing sessions.
    pub fn set_policy(&self, enabled: bool) {
        let _termination = self.termination_lock.lock();

        if enabled {
            let mut sessions = self.sessions.lock();
            if sessions.is_none() {
                *sessions = Some(Vec::new());
            }
        } else {
            self.clear_all_and_block();
        }

        self.disabled_by_policy.store(!enabled, Ordering::SeqCst);
    }

    /// Drain all sessions and block new session creation until re-enabled.
    pub fn clear_all_and_block(&self) {
        let sessions = {
            let mut slot = self.sessions.lock();
            slot.take()
        };

        let _termination = self.termination_lock.lock();
        if let Some(sessions) = sessions {
            for session in sessions {
                session.shutdown(true, ShutdownBehavior::ForceAfter30Seconds);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .as_ref()
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }
}
