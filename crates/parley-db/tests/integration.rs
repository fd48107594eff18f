use parley_db::{create_pool, run_migrations, with_conn, PoolSettings, TaskError};

#[derive(Debug)]
enum TestError {
    Pool,
    Task,
    Sql(rusqlite::Error),
}

impl From<r2d2::Error> for TestError {
    fn from(_: r2d2::Error) -> Self {
        TestError::Pool
    }
}

impl From<TaskError> for TestError {
    fn from(_: TaskError) -> Self {
        TestError::Task
    }
}

impl From<rusqlite::Error> for TestError {
    fn from(e: rusqlite::Error) -> Self {
        TestError::Sql(e)
    }
}

#[test]
fn jobs_survive_reopening_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parley.db");
    let path = path.to_str().unwrap();

    {
        let pool = create_pool(path, PoolSettings::default()).unwrap();
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO reminder_jobs (id, run_at, payload_json) VALUES ('job-1', 42, '{}')",
            [],
        )
        .unwrap();
    }

    let pool = create_pool(path, PoolSettings::default()).unwrap();
    let conn = pool.get().unwrap();
    assert!(run_migrations(&conn).unwrap().is_empty());

    let run_at: i64 = conn
        .query_row("SELECT run_at FROM reminder_jobs WHERE id = 'job-1'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(run_at, 42);
}

#[tokio::test]
async fn with_conn_runs_on_a_pooled_connection() {
    let pool = create_pool(parley_db::MEMORY_PATH, PoolSettings::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();

    let count: i64 = with_conn(&pool, |conn| -> Result<i64, TestError> {
        conn.execute(
            "INSERT INTO kv_entries (key, value) VALUES ('device:a:status', '{}')",
            [],
        )?;
        Ok(conn.query_row("SELECT COUNT(*) FROM kv_entries", [], |row| row.get(0))?)
    })
    .await
    .unwrap();
    assert_eq!(count, 1);

    let err = with_conn(&pool, |conn| -> Result<(), TestError> {
        conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
        Ok(())
    })
    .await
    .unwrap_err();
    assert!(matches!(err, TestError::Sql(_)));
}
