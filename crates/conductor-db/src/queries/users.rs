//! Query functions for the `users` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::User;

/// Insert a new user bound to an organization.
pub async fn insert_user(
    pool: &PgPool,
    organization_id: Uuid,
    email: &str,
    name: &str,
    role: &str,
    permissions: &[String],
) -> Result<User> {
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (organization_id, email, name, role, permissions) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(email)
    .bind(name)
    .bind(role)
    .bind(permissions)
    .fetch_one(pool)
    .await
    .context("failed to insert user")?;

    Ok(user)
}

/// Fetch a single user by ID.
pub async fn get_user(pool: &PgPool, id: Uuid) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user")?;

    Ok(user)
}
