//! User accounts and browser sessions.

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use std::str::FromStr;
use tracing::info;
use volute_core::types::{UserKind, UserRole};

use crate::error::{Result, StoreError};
use crate::store::{now_rfc3339, StateStore};
use crate::types::{Session, User};

const USER_SELECT: &str = "SELECT id, username, password_hash, role, user_type, created_at FROM users";

pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: UserRole::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
        user_type: UserKind::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
        created_at: row.get(5)?,
    })
}

impl StateStore {
    /// Register a human account. The first one becomes `admin`; later
    /// registrations start as `pending` until an admin promotes them.
    pub fn create_user(&self, username: &str, password: &str) -> Result<User> {
        let hash = hash_password(password)?;
        let now = now_rfc3339();

        let db = self.db.lock().unwrap();
        let brains: i64 = db.query_row(
            "SELECT COUNT(*) FROM users WHERE user_type = 'brain'",
            [],
            |row| row.get(0),
        )?;
        let role = if brains == 0 {
            UserRole::Admin
        } else {
            UserRole::Pending
        };

        let inserted = db.execute(
            "INSERT OR IGNORE INTO users (username, password_hash, role, user_type, created_at)
             VALUES (?1, ?2, ?3, 'brain', ?4)",
            rusqlite::params![username, hash, role.to_string(), now],
        )?;
        if inserted == 0 {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }
        let id = db.last_insert_rowid();
        info!(username, %role, "user registered");

        Ok(User {
            id,
            username: username.to_string(),
            password_hash: hash,
            role,
            user_type: UserKind::Brain,
            created_at: now,
        })
    }

    /// Return the mind's own account, creating it on first use. Mind
    /// accounts carry an empty password hash and can never log in.
    pub fn ensure_mind_user(&self, mind: &str) -> Result<User> {
        if let Some(user) = self.find_user_by_username(mind)? {
            return Ok(user);
        }
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO users (username, password_hash, role, user_type, created_at)
             VALUES (?1, '', 'user', 'mind', ?2)",
            rusqlite::params![mind, now],
        )?;
        drop(db);
        self.find_user_by_username(mind)?
            .ok_or_else(|| StoreError::not_found(format!("mind user {}", mind)))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        optional(db.query_row(
            &format!("{} WHERE id = ?1", USER_SELECT),
            [id],
            row_to_user,
        ))
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        optional(db.query_row(
            &format!("{} WHERE username = ?1", USER_SELECT),
            [username],
            row_to_user,
        ))
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{} ORDER BY id", USER_SELECT))?;
        let users = stmt
            .query_map([], row_to_user)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(users)
    }

    /// Check a username/password pair. Pending accounts verify fine; route
    /// guards decide what a pending user may do.
    pub fn verify_password(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .find_user_by_username(username)?
            .ok_or(StoreError::InvalidCredentials)?;
        if user.password_hash.is_empty() {
            return Err(StoreError::InvalidCredentials);
        }
        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| StoreError::PasswordHash(e.to_string()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| StoreError::InvalidCredentials)?;
        Ok(user)
    }

    pub fn set_user_role(&self, id: i64, role: UserRole) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            rusqlite::params![role.to_string(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(format!("user {}", id)));
        }
        Ok(())
    }

    // --- sessions ----------------------------------------------------------

    /// Issue a new session for the user. The returned id is the cookie value.
    pub fn create_session(&self, user_id: i64) -> Result<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions (id, user_id, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, user_id, created_at],
        )?;
        Ok(Session {
            id,
            user_id,
            created_at,
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        optional(db.query_row(
            "SELECT id, user_id, created_at FROM sessions WHERE id = ?1",
            [id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        ))
    }

    /// Explicit revocation (logout). Missing sessions are not an error.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StoreError::PasswordHash(e.to_string()))
}

/// Collapse `QueryReturnedNoRows` into `None`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::from_connection(rusqlite::Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn first_user_becomes_admin() {
        let store = store();
        let first = store.create_user("root", "hunter2").unwrap();
        assert_eq!(first.role, UserRole::Admin);

        let second = store.create_user("guest", "password").unwrap();
        assert_eq!(second.role, UserRole::Pending);
    }

    #[test]
    fn duplicate_username_rejected() {
        let store = store();
        store.create_user("root", "a").unwrap();
        assert!(matches!(
            store.create_user("root", "b"),
            Err(StoreError::UsernameTaken(_))
        ));
    }

    #[test]
    fn password_verification() {
        let store = store();
        store.create_user("root", "hunter2").unwrap();

        let user = store.verify_password("root", "hunter2").unwrap();
        assert_eq!(user.username, "root");
        assert!(matches!(
            store.verify_password("root", "wrong"),
            Err(StoreError::InvalidCredentials)
        ));
        assert!(matches!(
            store.verify_password("ghost", "hunter2"),
            Err(StoreError::InvalidCredentials)
        ));
    }

    #[test]
    fn mind_user_auto_creation_is_idempotent() {
        let store = store();
        let a = store.ensure_mind_user("alice").unwrap();
        let b = store.ensure_mind_user("alice").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.user_type, UserKind::Mind);
        // A mind account can never log in.
        assert!(store.verify_password("alice", "").is_err());
    }

    #[test]
    fn mind_user_does_not_claim_admin() {
        let store = store();
        store.ensure_mind_user("alice").unwrap();
        // First *human* registration still becomes admin.
        let user = store.create_user("root", "hunter2").unwrap();
        assert_eq!(user.role, UserRole::Admin);
    }

    #[test]
    fn session_lifecycle() {
        let store = store();
        let user = store.create_user("root", "hunter2").unwrap();

        let session = store.create_session(user.id).unwrap();
        let loaded = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.user_id, user.id);

        store.delete_session(&session.id).unwrap();
        assert!(store.get_session(&session.id).unwrap().is_none());
    }
}
