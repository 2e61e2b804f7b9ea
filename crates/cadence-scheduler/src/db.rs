use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`. Safe to call on every startup.
///
/// `company` and `runtemplate` are owned by the management side; the scheduler
/// reads them and writes only `runtemplate.interv` and `runtemplate.last_schedule`.
/// `job` rows are created by the job preparer together with their `schedule`
/// queue row, which is what the executor polls.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_company_table(conn)?;
    create_runtemplate_table(conn)?;
    create_job_table(conn)?;
    create_schedule_table(conn)?;
    Ok(())
}

fn create_company_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS company (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT    NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1
        );",
    )?;
    Ok(())
}

fn create_runtemplate_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS runtemplate (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            company_id    INTEGER NOT NULL REFERENCES company(id),
            app_id        INTEGER NOT NULL,
            name          TEXT    NOT NULL DEFAULT '',
            executor      TEXT    NOT NULL DEFAULT 'Native',
            active        INTEGER NOT NULL DEFAULT 1,
            interv        TEXT    NOT NULL DEFAULT 'n',   -- i h d w m y c n
            cron          TEXT,                           -- only read when interv = 'c'
            delay         INTEGER NOT NULL DEFAULT 0 CHECK (delay >= 0),
            last_schedule TEXT,                           -- RFC 3339 window start or NULL
            next_schedule TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_runtemplate_company
            ON runtemplate (company_id, active);",
    )?;
    Ok(())
}

fn create_job_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS job (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            runtemplate_id  INTEGER NOT NULL,
            company_id      INTEGER NOT NULL,
            app_id          INTEGER NOT NULL,
            schedule        TEXT,               -- scheduled time, RFC 3339
            executor        TEXT    NOT NULL,
            schedule_type   TEXT    NOT NULL,   -- cron | interval | adhoc
            exitcode        INTEGER,            -- NULL until the executor finishes
            env             TEXT    NOT NULL DEFAULT '{}',
            created_at      TEXT    NOT NULL
        );
        -- Pending-job lookup: WHERE runtemplate_id = ? AND exitcode IS NULL
        CREATE INDEX IF NOT EXISTS idx_job_pending
            ON job (runtemplate_id) WHERE exitcode IS NULL;",
    )?;
    Ok(())
}

fn create_schedule_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schedule (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            job     INTEGER,
            after   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_schedule_after ON schedule (after);",
    )?;
    Ok(())
}
