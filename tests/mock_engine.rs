use std::sync::Arc;
use std::time::Duration;

use sql_engine::driver::ColumnType;
use sql_engine::prelude::*;
use sql_engine::test_utils::{MockConnector, block_on, int_column, mock_database, result_set};

sql_engine::record! {
    #[derive(Debug, Default, PartialEq)]
    pub struct Account {
        pub id: i64,
        pub owner: String as "owner_name",
        pub balance: Option<i64>,
    }
}

fn accounts() -> sql_engine::driver::ResultBuffer {
    result_set(
        &[
            ("id", ColumnType::Int64),
            ("owner_name", ColumnType::Text),
            ("balance", ColumnType::Int64),
        ],
        vec![
            vec![RowValues::Int(1), RowValues::Text("ann".into()), RowValues::Int(10)],
            vec![RowValues::Int(2), RowValues::Text("bob".into()), RowValues::Null],
        ],
    )
}

#[tokio::test]
async fn repeated_reads_reuse_the_command_and_the_parser() -> Result<(), SqlEngineError> {
    let (mock, db) = mock_database(DatabaseType::Postgres);
    let options = CallOptions::new();
    mock.push_result(vec![accounts()]);
    mock.push_result(vec![accounts()]);

    let script = "SELECT id, owner_name, balance FROM accounts";
    let first: Vec<Account> = db.fetch_list(script, &(), &options).await?;
    let second: Vec<Account> = db.fetch_list(script, &(), &options).await?;

    assert_eq!(first, second);
    assert_eq!(first[1].balance, None);
    let commands = db.context().commands().stats();
    assert_eq!(commands.compilations, 1);
    assert_eq!(commands.hits, 1);
    let parsers = db.context().parsers().stats();
    assert_eq!(parsers.compilations, 1);
    assert_eq!(parsers.hits, 1);
    Ok(())
}

#[tokio::test]
async fn a_type_configuration_replaces_compiled_parsers() -> Result<(), SqlEngineError> {
    let (mock, db) = mock_database(DatabaseType::Postgres);
    let options = CallOptions::new();
    mock.push_result(vec![accounts()]);
    let _: Vec<Account> = db.fetch_list("SELECT * FROM accounts", &(), &options).await?;
    assert_eq!(db.context().parsers().len(), 1);

    db.context()
        .configure_type::<Account>(TypeConfig::new().column("owner", "holder"));
    assert!(db.context().parsers().is_empty());

    mock.push_result(vec![result_set(
        &[("id", ColumnType::Int64), ("holder", ColumnType::Text)],
        vec![vec![RowValues::Int(3), RowValues::Text("cy".into())]],
    )]);
    let renamed: Vec<Account> = db.fetch_list("SELECT * FROM accounts", &(), &options).await?;
    assert_eq!(renamed[0].owner, "cy");
    Ok(())
}

#[tokio::test]
async fn cancellation_while_connecting_skips_execution() -> Result<(), SqlEngineError> {
    let (mock, db) = mock_database(DatabaseType::Mssql);
    mock.set_delay(Duration::from_millis(50));
    let token = CancellationToken::new();
    let options = CallOptions::new().with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let outcome = db.try_execute("DELETE FROM jobs", &(), &options).await?;
    canceller.await.expect("canceller task");

    assert!(outcome.is_cancelled());
    assert!(mock.executed_scripts().is_empty());
    Ok(())
}

#[tokio::test]
async fn a_slow_command_fails_after_its_timeout() {
    let (mock, db) = mock_database(DatabaseType::Mysql);
    mock.set_delay(Duration::from_millis(200));
    let options = CallOptions::new().with_timeout(Duration::from_millis(20));

    let err = db
        .scalar::<i64, _>("SELECT SLEEP(1)", &(), &options)
        .await
        .expect_err("timeout");
    assert!(err.to_string().contains("timed out"));
    assert!(mock.executed_scripts().is_empty());
}

#[tokio::test]
async fn paged_reads_rebind_offset_and_limit() -> Result<(), SqlEngineError> {
    let (mock, db) = mock_database(DatabaseType::Mssql);
    mock.set_table("id", (1..=7).map(RowValues::Int).collect());

    let pages = db
        .paged::<i64, _>("SELECT id FROM t ORDER BY id", &(), 2, 3, &CallOptions::new())
        .await?;
    let rows = pages.collect_all().await?;

    assert_eq!(rows, vec![3, 4, 5, 6, 7]);
    let scripts = mock.executed_scripts();
    assert_eq!(scripts.len(), 2);
    assert!(scripts[0].ends_with("OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY"));
    assert_eq!(db.context().commands().stats().compilations, 1);
    Ok(())
}

#[tokio::test]
async fn output_values_reach_a_declared_shape() -> Result<(), SqlEngineError> {
    sql_engine::param_shape! {
        #[derive(Debug, Default)]
        pub struct Reserve {
            pub item: i64,
            #[output]
            pub remaining: i64,
        }
    }

    let (mock, db) = mock_database(DatabaseType::Mssql);
    mock.set_output("remaining", RowValues::Int(41));
    let mut shape = Reserve {
        item: 9,
        remaining: 0,
    };
    let affected = db
        .execute_with_output(
            "SELECT @remaining = qty FROM stock WHERE item = @item",
            &mut shape,
            &CallOptions::new(),
        )
        .await?;

    assert_eq!(affected, 1);
    assert_eq!(shape.remaining, 41);
    Ok(())
}

#[test]
fn one_script_compiles_once_per_provider() -> Result<(), SqlEngineError> {
    let (pg_mock, pg) = mock_database(DatabaseType::Postgres);
    let sqlite_mock = Arc::new(MockConnector::new(DatabaseType::Sqlite));
    let sqlite = Database::with_context(sqlite_mock.clone(), Arc::clone(pg.context()));
    let params = ParamList::new().add("id", 4_i64);
    pg_mock.push_result(vec![int_column("n", [1])]);
    sqlite_mock.push_result(vec![int_column("n", [])]);

    block_on(async {
        let _: i64 = pg.scalar("SELECT n FROM t WHERE id = @id", &params, &CallOptions::new()).await?;
        let _: Option<i64> = sqlite
            .fetch_one("SELECT n FROM t WHERE id = @id", &params, &CallOptions::new())
            .await?;
        Ok::<(), SqlEngineError>(())
    })?;

    assert_eq!(pg.context().commands().len(), 2);
    assert_eq!(pg_mock.executed_scripts(), vec!["SELECT n FROM t WHERE id = $1".to_string()]);
    assert_eq!(sqlite_mock.executed_scripts(), vec!["SELECT n FROM t WHERE id = ?1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn renamed_markers_compile_their_own_command() -> Result<(), SqlEngineError> {
    let (mock, db) = mock_database(DatabaseType::Sqlite);
    let script = "update t set a = @id where b = @key";
    let by_name = ParamList::new().add_declared(ParamDecl::new("id", ValueType::I64), RowValues::Int(1));
    let renamed = ParamList::new().add_declared(
        ParamDecl::new("id", ValueType::I64).bind_as("key"),
        RowValues::Int(2),
    );

    db.execute(script, &by_name, &CallOptions::new()).await?;
    db.execute(script, &renamed, &CallOptions::new()).await?;

    assert_eq!(db.context().commands().stats().compilations, 2);
    assert_eq!(
        mock.executed_scripts(),
        vec![
            "update t set a = ?1 where b = @key".to_string(),
            "update t set a = @id where b = ?1".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn a_failed_begin_releases_its_connection() {
    let (mock, db) = mock_database(DatabaseType::Postgres);
    mock.fail_begin("could not start transaction");

    let err = db.begin(&CallOptions::new()).await.expect_err("begin fails");
    assert!(err.to_string().contains("could not start transaction"));
    let failed: Result<u64, SqlEngineError> = db
        .run_in_transaction(&CallOptions::new(), |tx| {
            Box::pin(async move { tx.execute("DELETE FROM jobs", &()).await })
        })
        .await;
    assert!(failed.is_err());

    let stats = mock.stats();
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.closes, 2);
    assert_eq!(stats.dropped_open, 0);
    assert!(mock.executed_scripts().is_empty());
}
