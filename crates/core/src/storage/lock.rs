use anyhow::Context;

// Advisory locks belong to the Postgres session, so acquire and release must run on the
// same connection. Keeps two backtest scans from writing the same checks.
const LOCK_NAMESPACE: i64 = 0x4641_4952_5641; // "FAIRVA"

/// Lock scopes sharing the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Backtest,
}

fn lock_key(scope: LockScope) -> i64 {
    match scope {
        LockScope::Backtest => LOCK_NAMESPACE ^ 0x0B7,
    }
}

pub async fn try_acquire(conn: &mut sqlx::PgConnection, scope: LockScope) -> anyhow::Result<bool> {
    let key = lock_key(scope);
    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;
    Ok(acquired.0)
}

pub async fn release(conn: &mut sqlx::PgConnection, scope: LockScope) -> anyhow::Result<()> {
    let key = lock_key(scope);
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .persistent(false)
        .bind(key)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("failed to release advisory lock (key={key})"))?;
    Ok(())
}
