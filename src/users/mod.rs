//! In-memory user directory.
//!
//! Users are created on their first message and never removed. All state
//! is lost on restart.

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Price seeded into every new user's exclusion list.
pub const POISON_PRICE: i64 = 666;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    #[error("user was not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub polling: bool,
    /// Minimum island price to notify about, 0 when unset.
    pub sell_price: i64,
    /// Maximum island price to notify about, 0 when unset.
    pub buy_price: i64,
    pub exclude_prices: Vec<i64>,
    /// Maximum visitors already queued, -1 for no limit.
    pub max_in_queue: i64,
}

impl User {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            polling: false,
            sell_price: 0,
            buy_price: 0,
            exclude_prices: vec![POISON_PRICE],
            max_in_queue: -1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: Arc<DashMap<String, User>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Result<User, UserError> {
        self.users
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| UserError::NotFound(id.to_string()))
    }

    pub fn put(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn create_with_name(&self, id: &str, name: &str) -> User {
        let user = User::new(id, name);
        self.put(user.clone());
        info!(user = %id, name = %name, "created user");
        user
    }

    pub fn create_default(&self, id: &str) -> User {
        self.create_with_name(id, id)
    }

    /// Fetch a user, creating a default entry on first contact.
    pub fn get_or_create(&self, id: &str, name: &str) -> User {
        let mut created = false;
        let user = self
            .users
            .entry(id.to_string())
            .or_insert_with(|| {
                created = true;
                User::new(id, name)
            })
            .value()
            .clone();
        if created {
            info!(user = %id, name = %name, "created user");
        }
        user
    }

    /// Apply `f` to a stored user while holding its entry lock and return
    /// the updated copy.
    pub fn update<F>(&self, id: &str, f: F) -> Result<User, UserError>
    where
        F: FnOnce(&mut User),
    {
        let mut entry = self
            .users
            .get_mut(id)
            .ok_or_else(|| UserError::NotFound(id.to_string()))?;
        f(entry.value_mut());
        Ok(entry.value().clone())
    }

    pub fn active_users(&self) -> Vec<User> {
        self.users
            .iter()
            .filter(|entry| entry.polling)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_with_name_seeds_defaults() {
        let dir = UserDirectory::new();
        let user = dir.create_with_name("foo", "bar");

        assert_eq!(user.id, "foo");
        assert_eq!(user.name, "bar");
        assert!(!user.polling);
        assert_eq!(user.sell_price, 0);
        assert_eq!(user.buy_price, 0);
        assert_eq!(user.exclude_prices, vec![POISON_PRICE]);
        assert_eq!(user.max_in_queue, -1);
        assert_eq!(dir.get("foo").unwrap(), user);
    }

    #[test]
    fn test_create_default_uses_id_as_name() {
        let dir = UserDirectory::new();
        dir.create_with_name("bar", "bar user");
        let user = dir.create_default("foo");

        assert_eq!(user.name, "foo");
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_get_unknown_user() {
        let dir = UserDirectory::new();
        assert_eq!(dir.get("ghost"), Err(UserError::NotFound("ghost".to_string())));
    }

    #[test]
    fn test_put_replaces_user() {
        let dir = UserDirectory::new();
        let mut user = dir.create_default("foo");
        user.sell_price = 300;
        dir.put(user);

        assert_eq!(dir.get("foo").unwrap().sell_price, 300);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_get_or_create_keeps_existing_state() {
        let dir = UserDirectory::new();
        let mut user = dir.create_with_name("foo", "Foo");
        user.polling = true;
        dir.put(user);

        let again = dir.get_or_create("foo", "Renamed");
        assert!(again.polling);
        assert_eq!(again.name, "Foo");
    }

    #[test]
    fn test_update_and_active_users() {
        let dir = UserDirectory::new();
        dir.create_default("a");
        dir.create_default("b");
        dir.create_default("c");

        dir.update("a", |u| u.polling = true).unwrap();
        dir.update("c", |u| u.polling = true).unwrap();
        assert!(dir.update("zzz", |u| u.polling = true).is_err());

        let mut active: Vec<String> = dir.active_users().into_iter().map(|u| u.id).collect();
        active.sort();
        assert_eq!(active, vec!["a".to_string(), "c".to_string()]);
    }
}
