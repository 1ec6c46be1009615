//! Forward-only schema migrations, run via `sqlx`'s own migration support
//! (the same `sqlx::migrate!` + `migrations/` directory shape
//! `mvirt-zfs::store::Store::new` uses for its sqlite pool). Each file under
//! `migrations/` is one forward step, numbered and applied in order inside
//! its own transaction; `sqlx` tracks the applied set in its own
//! `_sqlx_migrations` table and refuses to open a database whose applied
//! set isn't a prefix of the compiled one.

use sqlx::sqlite::SqlitePool;

use cm_proto::{CmError, CmResult, ErrorKind};

pub async fn run(pool: &SqlitePool) -> CmResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| CmError::wrap(ErrorKind::Failed, "failed to apply schema migrations", e))
}
