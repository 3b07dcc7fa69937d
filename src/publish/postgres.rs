// src/publish/postgres.rs
use anyhow::{bail, Context, Result};
use regex::Regex;
use sqlx::{
    postgres::{PgConnectOptions, PgConnection},
    Connection,
};
use std::path::PathBuf;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{info, instrument};

use crate::config::ConnectionInfo;

const COPY_CHUNK: usize = 1 << 20;

/// `<source_path><source_name>` of a SQL script or CSV file to load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqlFile {
    pub source_path: PathBuf,
    pub source_name: String,
}

impl SqlFile {
    pub fn new(source_path: impl Into<PathBuf>, source_name: &str) -> Self {
        Self {
            source_path: source_path.into(),
            source_name: source_name.to_string(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.source_path.join(&self.source_name)
    }
}

pub fn connect_options(info: &ConnectionInfo) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&info.host)
        .port(info.port)
        .database(&info.schema)
        .username(&info.login)
        .password(&info.password)
}

#[instrument(level = "info", skip(info), fields(host = %info.host, db = %info.schema))]
pub async fn connect(info: &ConnectionInfo) -> Result<PgConnection> {
    PgConnection::connect_with(&connect_options(info))
        .await
        .with_context(|| format!("connecting to postgres at {}:{}", info.host, info.port))
}

/// `identifier` or `schema.identifier`, both unquoted SQL names.
pub fn validate_table_name(table: &str) -> Result<&str> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("table name regex should be valid");
    if !re.is_match(table) {
        bail!("invalid table name `{}`", table);
    }
    Ok(table)
}

pub fn copy_statement(table: &str) -> Result<String> {
    Ok(format!(
        "COPY {} FROM STDIN WITH CSV HEADER DELIMITER AS ','",
        validate_table_name(table)?
    ))
}

/// Replace every `{{name}}` of `sql` by its value.
pub fn render_sql(sql: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(sql.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{{{}}}}}", name), value)
    })
}

/// Run each script in order as one simple-query batch, after substituting
/// `vars` (see `render_sql`).
pub async fn execute_sql_file(
    conn: &mut PgConnection,
    files: &[SqlFile],
    vars: &[(&str, &str)],
) -> Result<()> {
    for file in files {
        let path = file.path();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let sql = render_sql(&raw, vars);
        sqlx::raw_sql(&sql)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("executing {}", path.display()))?;
        info!(script = %file.source_name, "sql script executed");
    }
    Ok(())
}

/// Bulk-load each CSV file (with header) into `table`. Returns rows copied.
pub async fn copy_file(conn: &mut PgConnection, table: &str, files: &[SqlFile]) -> Result<u64> {
    let statement = copy_statement(table)?;
    let mut total = 0;
    for file in files {
        let path = file.path();
        let mut src = File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;

        let mut copy = conn
            .copy_in_raw(&statement)
            .await
            .with_context(|| format!("starting COPY into {}", table))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            copy.send(&buf[..n])
                .await
                .with_context(|| format!("sending {} to {}", path.display(), table))?;
        }
        let rows = copy
            .finish()
            .await
            .with_context(|| format!("finishing COPY of {} into {}", path.display(), table))?;
        info!(table, file = %file.source_name, rows, "copied");
        total += rows;
    }
    Ok(total)
}
