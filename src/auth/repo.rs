use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, User, UserRow};
use crate::error::AppError;

const USER_COLUMNS: &str = "id, name, email, password_hash, role, password_changed_at, \
     password_reset_token, password_reset_expires, active, created_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unique constraint violated; carries the offending field.
    #[error("duplicate {0}")]
    Conflict(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                // unique_violation
                Some("23505") => {
                    let field = match db.constraint() {
                        Some(c) if c.contains("email") => "email",
                        Some(c) => c,
                        None => "value",
                    };
                    return StoreError::Conflict(field.to_string());
                }
                // not_null_violation | check_violation
                Some("23502") | Some("23514") => {
                    return StoreError::Constraint(db.message().to_string());
                }
                _ => {}
            }
        }
        StoreError::Other(err.into())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(field) => AppError::Conflict(field),
            StoreError::Constraint(msg) => AppError::Validation(msg),
            StoreError::Other(e) => AppError::Unknown(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for credential records. Every lookup ignores inactive records.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    async fn create(&self, user: NewUser) -> StoreResult<User>;

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<User>>;

    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> StoreResult<()>;

    /// Clears the reset token only while `token_hash` is still the stored one.
    async fn clear_reset_token(&self, id: Uuid, token_hash: &str) -> StoreResult<()>;

    /// Atomically matches an unexpired reset token, replaces the password and
    /// clears the token. Returns `None` when nothing matched.
    async fn consume_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
        password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> StoreResult<Option<User>>;

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> StoreResult<Option<User>>;

    async fn update_profile(&self, id: Uuid, name: &str, email: &str) -> StoreResult<Option<User>>;

    async fn deactivate(&self, id: Uuid) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn fetch_optional(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, UserRow, sqlx::postgres::PgArguments>,
    ) -> StoreResult<Option<User>> {
        match query.fetch_optional(&self.db).await? {
            Some(row) => Ok(Some(User::try_from(row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND active");
        self.fetch_optional(sqlx::query_as::<_, UserRow>(&sql).bind(email))
            .await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND active");
        self.fetch_optional(sqlx::query_as::<_, UserRow>(&sql).bind(id))
            .await
    }

    async fn create(&self, user: NewUser) -> StoreResult<User> {
        let sql = format!(
            r#"
            INSERT INTO users (name, email, password_hash, role)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(&user.name)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.role.as_str())
            .fetch_one(&self.db)
            .await?;
        Ok(User::try_from(row)?)
    }

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<User>> {
        let sql = format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE active
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#
        );
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter()
            .map(|r| User::try_from(r).map_err(StoreError::from))
            .collect()
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET password_reset_token = $2, password_reset_expires = $3
             WHERE id = $1 AND active
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid, token_hash: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET password_reset_token = NULL, password_reset_expires = NULL
             WHERE id = $1 AND password_reset_token = $2
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
        password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> StoreResult<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users
               SET password_hash = $3,
                   password_changed_at = $4,
                   password_reset_token = NULL,
                   password_reset_expires = NULL
             WHERE password_reset_token = $1
               AND password_reset_expires >= $2
               AND active
            RETURNING {USER_COLUMNS}
            "#
        );
        self.fetch_optional(
            sqlx::query_as::<_, UserRow>(&sql)
                .bind(token_hash)
                .bind(now)
                .bind(password_hash)
                .bind(changed_at),
        )
        .await
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        changed_at: OffsetDateTime,
    ) -> StoreResult<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users
               SET password_hash = $2, password_changed_at = $3
             WHERE id = $1 AND active
            RETURNING {USER_COLUMNS}
            "#
        );
        self.fetch_optional(
            sqlx::query_as::<_, UserRow>(&sql)
                .bind(id)
                .bind(password_hash)
                .bind(changed_at),
        )
        .await
    }

    async fn update_profile(&self, id: Uuid, name: &str, email: &str) -> StoreResult<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users
               SET name = $2, email = $3
             WHERE id = $1 AND active
            RETURNING {USER_COLUMNS}
            "#
        );
        self.fetch_optional(
            sqlx::query_as::<_, UserRow>(&sql)
                .bind(id)
                .bind(name)
                .bind(email),
        )
        .await
    }

    async fn deactivate(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE users SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;

    use tokio::sync::RwLock;

    use super::*;

    /// In-process store used by unit tests. One write lock per mutation gives
    /// the same per-record atomicity the database provides.
    #[derive(Default)]
    pub struct MemoryUserStore {
        users: RwLock<HashMap<Uuid, User>>,
    }

    impl MemoryUserStore {
        /// Reads a record regardless of its active flag.
        pub async fn raw(&self, id: Uuid) -> Option<User> {
            self.users.read().await.get(&id).cloned()
        }

        pub async fn count(&self) -> usize {
            self.users.read().await.len()
        }

        pub async fn expire_reset_token(&self, id: Uuid, at: OffsetDateTime) {
            if let Some(u) = self.users.write().await.get_mut(&id) {
                u.password_reset_expires = Some(at);
            }
        }
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
            Ok(self
                .users
                .read()
                .await
                .values()
                .find(|u| u.active && u.email == email)
                .cloned())
        }

        async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
            Ok(self
                .users
                .read()
                .await
                .get(&id)
                .filter(|u| u.active)
                .cloned())
        }

        async fn create(&self, user: NewUser) -> StoreResult<User> {
            let mut users = self.users.write().await;
            if users.values().any(|u| u.email == user.email) {
                return Err(StoreError::Conflict("email".into()));
            }
            let record = User {
                id: Uuid::new_v4(),
                name: user.name,
                email: user.email,
                password_hash: user.password_hash,
                role: user.role,
                password_changed_at: None,
                password_reset_token: None,
                password_reset_expires: None,
                active: true,
                created_at: OffsetDateTime::now_utc(),
            };
            users.insert(record.id, record.clone());
            Ok(record)
        }

        async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<User>> {
            let mut all: Vec<User> = self
                .users
                .read()
                .await
                .values()
                .filter(|u| u.active)
                .cloned()
                .collect();
            all.sort_by_key(|u| u.created_at);
            Ok(all
                .into_iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize)
                .collect())
        }

        async fn set_reset_token(
            &self,
            id: Uuid,
            token_hash: &str,
            expires_at: OffsetDateTime,
        ) -> StoreResult<()> {
            if let Some(u) = self.users.write().await.get_mut(&id).filter(|u| u.active) {
                u.password_reset_token = Some(token_hash.to_string());
                u.password_reset_expires = Some(expires_at);
            }
            Ok(())
        }

        async fn clear_reset_token(&self, id: Uuid, token_hash: &str) -> StoreResult<()> {
            if let Some(u) = self.users.write().await.get_mut(&id) {
                if u.password_reset_token.as_deref() == Some(token_hash) {
                    u.password_reset_token = None;
                    u.password_reset_expires = None;
                }
            }
            Ok(())
        }

        async fn consume_reset_token(
            &self,
            token_hash: &str,
            now: OffsetDateTime,
            password_hash: &str,
            changed_at: OffsetDateTime,
        ) -> StoreResult<Option<User>> {
            let mut users = self.users.write().await;
            let matched = users.values_mut().find(|u| {
                u.active
                    && u.password_reset_token.as_deref() == Some(token_hash)
                    && u.password_reset_expires.is_some_and(|exp| exp >= now)
            });
            Ok(matched.map(|u| {
                u.password_hash = password_hash.to_string();
                u.password_changed_at = Some(changed_at);
                u.password_reset_token = None;
                u.password_reset_expires = None;
                u.clone()
            }))
        }

        async fn update_password(
            &self,
            id: Uuid,
            password_hash: &str,
            changed_at: OffsetDateTime,
        ) -> StoreResult<Option<User>> {
            Ok(self
                .users
                .write()
                .await
                .get_mut(&id)
                .filter(|u| u.active)
                .map(|u| {
                    u.password_hash = password_hash.to_string();
                    u.password_changed_at = Some(changed_at);
                    u.clone()
                }))
        }

        async fn update_profile(
            &self,
            id: Uuid,
            name: &str,
            email: &str,
        ) -> StoreResult<Option<User>> {
            let mut users = self.users.write().await;
            if users.values().any(|u| u.id != id && u.email == email) {
                return Err(StoreError::Conflict("email".into()));
            }
            Ok(users.get_mut(&id).filter(|u| u.active).map(|u| {
                u.name = name.to_string();
                u.email = email.to_string();
                u.clone()
            }))
        }

        async fn deactivate(&self, id: Uuid) -> StoreResult<()> {
            if let Some(u) = self.users.write().await.get_mut(&id) {
                u.active = false;
            }
            Ok(())
        }
    }

    /// Store whose backend is down: every call fails with an infrastructure error.
    #[derive(Default)]
    pub struct UnavailableUserStore;

    fn down<T>() -> StoreResult<T> {
        Err(StoreError::Other(anyhow::anyhow!(
            "connection to 10.0.0.5:5432 refused"
        )))
    }

    #[async_trait]
    impl UserStore for UnavailableUserStore {
        async fn find_by_email(&self, _email: &str) -> StoreResult<Option<User>> {
            down()
        }

        async fn find_by_id(&self, _id: Uuid) -> StoreResult<Option<User>> {
            down()
        }

        async fn create(&self, _user: NewUser) -> StoreResult<User> {
            down()
        }

        async fn list(&self, _limit: i64, _offset: i64) -> StoreResult<Vec<User>> {
            down()
        }

        async fn set_reset_token(
            &self,
            _id: Uuid,
            _token_hash: &str,
            _expires_at: OffsetDateTime,
        ) -> StoreResult<()> {
            down()
        }

        async fn clear_reset_token(&self, _id: Uuid, _token_hash: &str) -> StoreResult<()> {
            down()
        }

        async fn consume_reset_token(
            &self,
            _token_hash: &str,
            _now: OffsetDateTime,
            _password_hash: &str,
            _changed_at: OffsetDateTime,
        ) -> StoreResult<Option<User>> {
            down()
        }

        async fn update_password(
            &self,
            _id: Uuid,
            _password_hash: &str,
            _changed_at: OffsetDateTime,
        ) -> StoreResult<Option<User>> {
            down()
        }

        async fn update_profile(
            &self,
            _id: Uuid,
            _name: &str,
            _email: &str,
        ) -> StoreResult<Option<User>> {
            down()
        }

        async fn deactivate(&self, _id: Uuid) -> StoreResult<()> {
            down()
        }
    }
}
