//! Database dispatch macros for reducing code duplication.
//!
//! The built-in driver keeps one sqlx pool type per backend. These macros
//! expand to the match over those variants so each operation reads as a single
//! generic body instead of three copies.

/// Generate match arms over `DbPool` variants.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     Sqlite(p) => do_sqlite(p),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Bind every argument of a slice onto a sqlx query with the given binder.
#[macro_export]
macro_rules! bind_all {
    ($sql:expr, $args:expr, $binder:path) => {{
        let mut query = sqlx::query($sql);
        for arg in $args {
            query = $binder(query, arg);
        }
        query
    }};
}

pub use bind_all;
pub use impl_db_dispatch;
