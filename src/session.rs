use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;

use crate::newsblur;
use crate::storage::{self, Account};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("account not found")]
    AccountNotFound,
    #[error("no stored session for account")]
    SessionNotFound,
    #[error("not logged in; run `newsblur-fix login` first")]
    NotLoggedIn,
}

/// Ties the API client's session cookie to the accounts kept on disk.
pub struct Manager {
    store: Arc<storage::Store>,
    client: Arc<newsblur::Client>,
    server: String,
    active: RwLock<Option<Account>>,
}

impl Manager {
    pub fn new(store: Arc<storage::Store>, client: Arc<newsblur::Client>) -> Self {
        let server = client.base_url().to_string();
        Self {
            store,
            client,
            server,
            active: RwLock::new(None),
        }
    }

    /// Resumes the most recently used account of this server that still has
    /// a stored session.
    pub fn load_existing(&self) -> Result<Option<Account>> {
        for account in self.store.list_accounts()? {
            if account.server != self.server {
                continue;
            }
            if let Some(session) = self.store.get_session(account.id)? {
                self.client.set_session_cookie(Some(session.cookie));
                *self.active.write() = Some(account.clone());
                tracing::debug!(username = %account.username, "resumed stored session");
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    pub fn active(&self) -> Option<Account> {
        self.active.read().clone()
    }

    pub fn require_active(&self) -> Result<Account> {
        match self.active() {
            Some(account) => Ok(account),
            None => bail!(SessionError::NotLoggedIn),
        }
    }

    pub fn login(&self, username: &str, password: &str) -> Result<Account> {
        let cookie = self.client.login(username, password)?;
        let account_id = self
            .store
            .upsert_account(&self.server, username.trim())
            .context("session: save account")?;
        self.store
            .upsert_session(account_id, &cookie)
            .context("session: save cookie")?;
        let account = self
            .store
            .get_account_by_id(account_id)?
            .ok_or(SessionError::AccountNotFound)?;
        *self.active.write() = Some(account.clone());
        Ok(account)
    }

    pub fn switch(&self, username: &str) -> Result<Account> {
        let account = self
            .store
            .find_account(&self.server, username)?
            .ok_or(SessionError::AccountNotFound)?;
        let session = self
            .store
            .get_session(account.id)?
            .ok_or(SessionError::SessionNotFound)?;
        self.client.set_session_cookie(Some(session.cookie));
        self.store.touch_account(account.id)?;
        *self.active.write() = Some(account.clone());
        Ok(account)
    }

    /// Ends the server session and forgets the stored cookie. The local
    /// cookie is dropped even when the server call fails.
    pub fn logout(&self) -> Result<Account> {
        let account = self.require_active()?;
        if let Err(err) = self.client.logout() {
            tracing::warn!(error = %err, "server logout failed; dropping local session anyway");
        }
        self.client.set_session_cookie(None);
        self.store.delete_session(account.id)?;
        *self.active.write() = None;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok, serve, status, with_session};
    use tempfile::tempdir;

    fn setup(base: &str, dir: &tempfile::TempDir) -> (Arc<storage::Store>, Arc<newsblur::Client>) {
        let store = Arc::new(
            storage::Store::open(storage::Options {
                path: Some(dir.path().join("state.db")),
            })
            .unwrap(),
        );
        let client = Arc::new(
            newsblur::Client::new(newsblur::ClientConfig {
                user_agent: "test".into(),
                base_url: Some(base.to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        (store, client)
    }

    #[test]
    fn login_persists_and_resumes() {
        let dir = tempdir().unwrap();
        let (base, _rx) = serve(vec![with_session(
            r#"{"code": 1}"#,
            "newsblur_sessionid=cookie-1; Path=/",
        )]);
        let (store, client) = setup(&base, &dir);
        let manager = Manager::new(store.clone(), client);
        let account = manager.login("reader", "pw").unwrap();
        assert_eq!(account.username, "reader");
        assert_eq!(manager.active().unwrap().id, account.id);

        let (_, fresh_client) = setup(&base, &dir);
        let resumed = Manager::new(store, fresh_client.clone());
        let account = resumed.load_existing().unwrap().unwrap();
        assert_eq!(account.username, "reader");
        assert_eq!(fresh_client.session_cookie().as_deref(), Some("cookie-1"));
    }

    #[test]
    fn nothing_to_resume_without_login() {
        let dir = tempdir().unwrap();
        let (store, client) = setup("http://127.0.0.1:9/", &dir);
        let manager = Manager::new(store, client);
        assert!(manager.load_existing().unwrap().is_none());
        let err = manager.require_active().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::NotLoggedIn)
        ));
        assert!(manager.switch("nobody").is_err());
    }

    #[test]
    fn logout_drops_cookie_even_if_server_fails() {
        let dir = tempdir().unwrap();
        let (base, rx) = serve(vec![
            with_session(r#"{"code": 1}"#, "newsblur_sessionid=c; Path=/"),
            status(500, "oops"),
        ]);
        let (store, client) = setup(&base, &dir);
        let manager = Manager::new(store.clone(), client.clone());
        let account = manager.login("reader", "pw").unwrap();
        manager.logout().unwrap();

        assert!(manager.active().is_none());
        assert!(client.session_cookie().is_none());
        assert!(store.get_session(account.id).unwrap().is_none());
        rx.recv().unwrap();
        let logout = rx.recv().unwrap();
        assert_eq!(logout.url, "/api/logout");
        assert_eq!(logout.cookie.as_deref(), Some("newsblur_sessionid=c"));
    }

    #[test]
    fn switch_restores_stored_cookie() {
        let dir = tempdir().unwrap();
        let (base, _rx) = serve(vec![
            with_session(r#"{"code": 1}"#, "newsblur_sessionid=first; Path=/"),
            with_session(r#"{"code": 1}"#, "newsblur_sessionid=second; Path=/"),
            ok(r#"{"feeds": {}, "folders": []}"#),
        ]);
        let (store, client) = setup(&base, &dir);
        let manager = Manager::new(store, client.clone());
        manager.login("alice", "pw").unwrap();
        manager.login("bob", "pw").unwrap();
        assert_eq!(client.session_cookie().as_deref(), Some("second"));

        let account = manager.switch("alice").unwrap();
        assert_eq!(account.username, "alice");
        assert_eq!(client.session_cookie().as_deref(), Some("first"));
        client.feeds().unwrap();
    }
}
