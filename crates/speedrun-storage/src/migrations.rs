use anyhow::{Context, Result};
use sqlx::{Executor, PgPool, Postgres};

const MIGRATIONS: &[(i32, &str)] = &[(1, include_str!("../migrations/0001_schema.sql"))];

/// Lock key used while applying migrations, so two indexer processes
/// starting at once don't race each other's `CREATE TABLE` statements.
const MIGRATION_LOCK_KEY: i64 = 0x5350_4545_4452_554E; // "SPEEDRUN"

/// Apply any migration not yet recorded in `schema_migrations`, serialized
/// across processes with a session-scoped advisory lock. Must run the
/// whole sequence on one connection: the lock is per-session, so acquiring
/// on one connection and releasing on another would leave it held.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let mut conn = pool
        .acquire()
        .await
        .context("acquire connection for migrations")?;

    sqlx::query("select pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .context("acquire migration lock")?;

    let res: Result<()> = async {
        exec_sql_batch(&mut *conn, MIGRATIONS[0].1)
            .await
            .context("apply schema bootstrap (v1)")?;

        for (version, sql) in MIGRATIONS {
            if *version == 1 {
                continue;
            }
            let applied: Option<i32> =
                sqlx::query_scalar("select version from schema_migrations where version = $1")
                    .bind(*version)
                    .fetch_optional(&mut *conn)
                    .await
                    .context("read schema_migrations")?;

            if applied.is_some() {
                continue;
            }

            let mut tx = conn.begin().await.context("begin migration tx")?;
            exec_sql_batch(&mut *tx, sql)
                .await
                .with_context(|| format!("apply migration v{version}"))?;
            sqlx::query("insert into schema_migrations(version) values ($1)")
                .bind(*version)
                .execute(&mut *tx)
                .await
                .context("insert schema_migrations")?;
            tx.commit().await.context("commit migration tx")?;
        }
        Ok(())
    }
    .await;

    let _ = sqlx::query("select pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await;

    res
}

async fn exec_sql_batch<E>(exec: &mut E, sql: &str) -> Result<()>
where
    for<'c> &'c mut E: Executor<'c, Database = Postgres>,
{
    for stmt in sql.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(&mut *exec).await.with_context(|| {
            format!(
                "execute migration statement: {}",
                s.lines().next().unwrap_or("")
            )
        })?;
    }
    Ok(())
}
