//! Integration tests for strand with a MySQL testcontainer
//!
//! These tests drive the full stack against a real server: pooled queries,
//! transactions, coroutines and in-flight sharing.
//!
//! A single container is shared across all tests using the `ctor` pattern.
//! Tests run sequentially with `serial_test` and reset the `accounts` table
//! before each run. When no container runtime is available the tests are
//! skipped.
//!
//! Container cleanup:
//! - The `watchdog` feature handles cleanup on CTRL+C or SIGTERM signals
//! - For normal process exit, `shutdown_hooks` signals the container thread to stop
//! - The container lives inside the thread, so it's dropped when the thread exits

use ctor::ctor;
use futures::future::join_all;
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::mysql::Mysql;
use tracing_subscriber::EnvFilter;

use strand::{
    DatabaseConfig, Error, FromRow, Outcome, Query, Role, Row, Runtime, ServerConfig, Step,
    SystemCall, TransactionState, Yield,
};

// Host and port of the running container, None when it could not start
static DB_ADDR: OnceLock<Option<(String, u16)>> = OnceLock::new();
// Flag to signal the container thread to exit
static SHUTDOWN: AtomicBool = AtomicBool::new(false);
// Thread handle for joining on exit
static CONTAINER_THREAD: OnceLock<JoinHandle<()>> = OnceLock::new();

extern "C" fn cleanup_on_exit() {
    SHUTDOWN.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(500));
}

#[ctor]
fn setup_container() {
    shutdown_hooks::add_shutdown_hook(cleanup_on_exit);

    // Priority: RUST_LOG env var > config.log_level > warn
    let log_level = base_config().log_level.unwrap_or_else(|| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let handle = thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let container: ContainerAsync<Mysql> = match Mysql::default().start().await {
                Ok(container) => container,
                Err(e) => {
                    eprintln!("skipping MySQL integration tests: {}", e);
                    let _ = ready_tx.send(None);
                    return;
                }
            };
            let port = container.get_host_port_ipv4(3306).await.unwrap();
            let _ = ready_tx.send(Some(("127.0.0.1".to_string(), port)));

            // Keep container alive until shutdown is signaled
            while !SHUTDOWN.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
    });

    let _ = CONTAINER_THREAD.set(handle);

    let addr = ready_rx.recv().unwrap_or(None);
    let _ = DB_ADDR.set(addr);
}

fn base_config() -> DatabaseConfig {
    DatabaseConfig::from_toml_str(include_str!("strand-test.toml")).unwrap()
}

fn test_config() -> Option<DatabaseConfig> {
    let (host, port) = DB_ADDR.get()?.clone()?;
    let config = base_config().with_server(
        "main",
        ServerConfig {
            role: Role::Master,
            host,
            port,
            username: "root".into(),
            password: String::new(),
            dbname: "test".into(),
            num_connection: 2,
            max_num_connection: 4,
        },
    );
    Some(config)
}

/// A runtime with a fresh `accounts` table, or None when MySQL is unavailable.
async fn setup() -> Option<Runtime> {
    let Some(config) = test_config() else {
        eprintln!("MySQL container not available, skipping");
        return None;
    };
    let runtime = Runtime::mysql(config).unwrap();
    for sql in [
        "DROP TABLE IF EXISTS accounts",
        "CREATE TABLE accounts (
            id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
            email VARCHAR(255) NOT NULL UNIQUE,
            balance BIGINT NOT NULL DEFAULT 0
        )",
    ] {
        runtime.execute(Query::new("main", sql)).await.unwrap();
    }
    Some(runtime)
}

#[derive(Debug, PartialEq)]
struct Account {
    id: i64,
    email: String,
    balance: i64,
}

impl FromRow for Account {
    fn from_row(row: &Row) -> strand::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            email: row.get("email")?,
            balance: row.get("balance")?,
        })
    }
}

async fn insert_account(runtime: &Runtime, email: &str, balance: i64) -> u64 {
    let result = runtime
        .execute(
            Query::new("main", "INSERT INTO accounts (email, balance) VALUES (?, ?)")
                .bind(email)
                .bind(balance),
        )
        .await
        .unwrap();
    assert_eq!(result.rows_affected(), 1);
    result.last_insert_id().unwrap()
}

async fn balance_of(runtime: &Runtime, email: &str) -> Option<i64> {
    runtime
        .execute(Query::new("main", "SELECT balance FROM accounts WHERE email = ?").bind(email))
        .await
        .unwrap()
        .decode_optional::<Row>()
        .unwrap()
        .map(|row| row.get("balance").unwrap())
}

// ============ Query Tests ============

#[tokio::test]
#[serial]
async fn test_insert_and_select() {
    let Some(runtime) = setup().await else { return };

    let id = insert_account(&runtime, "alice@example.com", 100).await;
    let accounts: Vec<Account> = runtime
        .execute(Query::new("main", "SELECT id, email, balance FROM accounts WHERE id = ?").bind(id))
        .await
        .unwrap()
        .decode()
        .unwrap();

    assert_eq!(
        accounts,
        vec![Account {
            id: id as i64,
            email: "alice@example.com".into(),
            balance: 100,
        }]
    );
}

#[tokio::test]
#[serial]
async fn test_named_parameters() {
    let Some(runtime) = setup().await else { return };
    insert_account(&runtime, "bob@example.com", 40).await;

    let result = runtime
        .execute(
            Query::new(
                "main",
                "UPDATE accounts SET balance = balance + :amount WHERE email = :email",
            )
            .bind_named("amount", 2)
            .bind_named("email", "bob@example.com"),
        )
        .await
        .unwrap();
    assert_eq!(result.rows_affected(), 1);
    assert_eq!(balance_of(&runtime, "bob@example.com").await, Some(42));
}

#[tokio::test]
#[serial]
async fn test_many_concurrent_queries_share_the_pool() {
    let Some(runtime) = setup().await else { return };
    for i in 0..5 {
        insert_account(&runtime, &format!("user{}@example.com", i), i).await;
    }

    let queries: Vec<_> = (0..20)
        .map(|i| {
            runtime.execute(
                Query::new("main", "SELECT balance FROM accounts WHERE email = ?")
                    .bind(format!("user{}@example.com", i % 5)),
            )
        })
        .collect();
    let results = join_all(queries).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().scalar::<i64>().unwrap(), (i % 5) as i64);
    }
    let stats = runtime.pool().stats("main", Role::Master).unwrap();
    assert!(stats.open <= 4);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
#[serial]
async fn test_identical_reads_are_shared() {
    let Some(runtime) = setup().await else { return };
    insert_account(&runtime, "carol@example.com", 7).await;

    let query = Query::new("main", "SELECT balance FROM accounts WHERE email = ?")
        .bind("carol@example.com");
    let first = runtime.manager().execute_shared(query.clone());
    let second = runtime.manager().execute_shared(query);

    assert_eq!(first.await.unwrap().scalar::<i64>().unwrap(), 7);
    assert_eq!(second.await.unwrap().scalar::<i64>().unwrap(), 7);
}

#[tokio::test]
#[serial]
async fn test_server_error_is_reported() {
    let Some(runtime) = setup().await else { return };

    let err = runtime
        .execute(Query::new("main", "SELECT * FROM no_such_table"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueryExecution { code: 1146, .. }));

    // The connection survives a statement error
    assert_eq!(balance_of(&runtime, "nobody@example.com").await, None);
}

#[tokio::test]
#[serial]
async fn test_query_timeout() {
    let Some(runtime) = setup().await else { return };

    let err = runtime
        .execute(Query::new("main", "SELECT SLEEP(5)").timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // The timed-out connection is closed and a fresh one serves the next query
    assert_eq!(
        runtime
            .execute(Query::new("main", "SELECT 1 AS one"))
            .await
            .unwrap()
            .scalar::<i64>()
            .unwrap(),
        1
    );
}

// ============ Transaction Tests ============

#[tokio::test]
#[serial]
async fn test_transaction_commit() {
    let Some(runtime) = setup().await else { return };
    insert_account(&runtime, "dave@example.com", 10).await;
    insert_account(&runtime, "erin@example.com", 10).await;

    let tx = runtime.manager().transaction("main");
    tx.start().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Working);
    tx.execute(
        Query::new("main", "UPDATE accounts SET balance = balance - 5 WHERE email = ?")
            .bind("dave@example.com"),
    )
    .await
    .unwrap();
    tx.execute(
        Query::new("main", "UPDATE accounts SET balance = balance + 5 WHERE email = ?")
            .bind("erin@example.com"),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(balance_of(&runtime, "dave@example.com").await, Some(5));
    assert_eq!(balance_of(&runtime, "erin@example.com").await, Some(15));
}

#[tokio::test]
#[serial]
async fn test_transaction_rollback() {
    let Some(runtime) = setup().await else { return };
    insert_account(&runtime, "frank@example.com", 10).await;

    let tx = runtime.manager().transaction("main");
    tx.start().await.unwrap();
    tx.execute(
        Query::new("main", "UPDATE accounts SET balance = 0 WHERE email = ?")
            .bind("frank@example.com"),
    )
    .await
    .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(balance_of(&runtime, "frank@example.com").await, Some(10));
}

#[tokio::test]
#[serial]
async fn test_dropped_transaction_is_not_committed() {
    let Some(runtime) = setup().await else { return };
    insert_account(&runtime, "grace@example.com", 10).await;

    {
        let tx = runtime.manager().transaction("main");
        tx.start().await.unwrap();
        tx.execute(
            Query::new("main", "UPDATE accounts SET balance = 99 WHERE email = ?")
                .bind("grace@example.com"),
        )
        .await
        .unwrap();
    }

    assert_eq!(balance_of(&runtime, "grace@example.com").await, Some(10));
}

// ============ Coroutine Tests ============

#[tokio::test]
#[serial]
async fn test_coroutine_reads_then_writes() {
    let Some(mut runtime) = setup().await else { return };
    insert_account(&runtime, "heidi@example.com", 3).await;

    let manager = runtime.manager().clone();
    let mut stage = 0;
    let handle = runtime.spawn(Box::new(
        move |input: strand::Result<Outcome>| -> strand::Result<Step> {
            stage += 1;
            match stage {
                1 => Ok(Step::Yield(Yield::Call(SystemCall::AcquireQueryGate))),
                2 => Ok(Step::Yield(Yield::query(manager.execute(
                    Query::new("main", "SELECT balance FROM accounts WHERE email = ?")
                        .bind("heidi@example.com"),
                )))),
                3 => {
                    let balance: i64 = input?.into_query()?.scalar()?;
                    Ok(Step::Yield(Yield::query(manager.execute(
                        Query::new("main", "UPDATE accounts SET balance = ? WHERE email = ?")
                            .bind(balance * 2)
                            .bind("heidi@example.com"),
                    ))))
                }
                _ => Ok(Step::Complete(
                    (input?.into_query()?.rows_affected() == 1).into(),
                )),
            }
        },
    ));

    runtime.run_until_idle().await;
    assert_eq!(handle.await.unwrap(), Outcome::Bool(true));
    assert_eq!(balance_of(&runtime, "heidi@example.com").await, Some(6));
}

#[tokio::test]
#[serial]
async fn test_coroutine_sees_query_errors() {
    let Some(mut runtime) = setup().await else { return };

    let manager = runtime.manager().clone();
    let mut asked = false;
    let handle = runtime.spawn(Box::new(
        move |input: strand::Result<Outcome>| -> strand::Result<Step> {
            if !asked {
                asked = true;
                return Ok(Step::Yield(Yield::query(
                    manager.execute(Query::new("main", "SELECT * FROM no_such_table")),
                )));
            }
            match input {
                Err(Error::QueryExecution { code, .. }) => {
                    Ok(Step::Complete(Outcome::Id(code as u64)))
                }
                other => other.map(Step::Complete),
            }
        },
    ));

    runtime.run_until_idle().await;
    assert_eq!(handle.await.unwrap(), Outcome::Id(1146));
}
