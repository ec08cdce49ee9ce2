//! MySQL links over `mysql_async`

use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use tracing::debug;

use super::types::{from_mysql_row, to_mysql_params};
use super::{Connector, Link};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::query::Statement;
use crate::row::{ExecuteResult, QueryResult, Row};

/// Session setup run on every new link
const SESSION_INIT: &str = "SET NAMES utf8mb4 COLLATE utf8mb4_unicode_ci";

/// Opens [`MySqlLink`]s.
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }

    fn opts(server: &ServerConfig) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(server.host.clone())
            .tcp_port(server.port)
            .user(Some(server.username.clone()))
            .pass(Some(server.password.clone()))
            .db_name(Some(server.dbname.clone()))
            .init(vec![SESSION_INIT.to_string()])
    }
}

impl Connector for MySqlConnector {
    fn connect(&self, server: &ServerConfig) -> BoxFuture<'static, Result<Box<dyn Link>>> {
        let opts = Self::opts(server);
        let host = server.host.clone();
        async move {
            let conn = Conn::new(opts).await?;
            debug!(host = %host, connection_id = conn.id(), "MySQL link opened");
            Ok(Box::new(MySqlLink::new(conn)) as Box<dyn Link>)
        }
        .boxed()
    }
}

type InFlight = BoxFuture<'static, (Conn, Result<QueryResult>)>;

/// A single `mysql_async` connection driven one statement at a time.
///
/// While a statement runs, the connection is moved into the in-flight
/// future and handed back when it completes.
pub struct MySqlLink {
    conn: Option<Conn>,
    in_flight: Option<InFlight>,
}

impl MySqlLink {
    pub fn new(conn: Conn) -> Self {
        Self {
            conn: Some(conn),
            in_flight: None,
        }
    }
}

async fn run(conn: &mut Conn, statement: Statement) -> Result<QueryResult> {
    let Statement { sql, params } = statement;
    if params.is_empty() {
        // Text protocol: transaction control statements are not preparable
        let mut result = conn.query_iter(sql).await?;
        let has_columns = result.columns().is_some_and(|c| !c.is_empty());
        let execution = ExecuteResult {
            rows_affected: result.affected_rows(),
            last_insert_id: result.last_insert_id(),
        };
        let rows: Vec<mysql_async::Row> = result.collect().await?;
        result.drop_result().await?;
        convert(has_columns, rows, execution)
    } else {
        let mut result = conn.exec_iter(sql, to_mysql_params(params)).await?;
        let has_columns = result.columns().is_some_and(|c| !c.is_empty());
        let execution = ExecuteResult {
            rows_affected: result.affected_rows(),
            last_insert_id: result.last_insert_id(),
        };
        let rows: Vec<mysql_async::Row> = result.collect().await?;
        result.drop_result().await?;
        convert(has_columns, rows, execution)
    }
}

fn convert(
    has_columns: bool,
    rows: Vec<mysql_async::Row>,
    execution: ExecuteResult,
) -> Result<QueryResult> {
    if !has_columns {
        return Ok(QueryResult::Execution(execution));
    }
    let rows = rows
        .into_iter()
        .map(from_mysql_row)
        .collect::<Result<Vec<Row>>>()?;
    Ok(QueryResult::Rows(rows))
}

impl Link for MySqlLink {
    fn dispatch(&mut self, statement: Statement) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(Error::NotReady("a statement is already in flight".into()));
        }
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| Error::Connection("link is closed".into()))?;
        self.in_flight = Some(
            async move {
                let result = run(&mut conn, statement).await;
                (conn, result)
            }
            .boxed(),
        );
        Ok(())
    }

    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Result<QueryResult>> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Poll::Ready(Err(Error::NotReady("no statement in flight".into())));
        };
        match in_flight.poll_unpin(cx) {
            Poll::Ready((conn, result)) => {
                self.in_flight = None;
                self.conn = Some(conn);
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn ping(&mut self) -> BoxFuture<'_, bool> {
        async move {
            match self.conn.as_mut() {
                Some(conn) => conn.ping().await.is_ok(),
                None => false,
            }
        }
        .boxed()
    }

    fn close(&mut self) {
        // Dropping the in-flight future drops its socket mid-statement
        self.in_flight = None;
        if let Some(conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = conn.disconnect().await {
                            debug!(error = %e, "MySQL link disconnect failed");
                        }
                    });
                }
                Err(_) => drop(conn),
            }
        }
    }
}
