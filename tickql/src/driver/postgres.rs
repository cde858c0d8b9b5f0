///
/// PostgreSQL driver backed by tokio-postgres.
///
/// The engine is thread-per-handler, so the driver owns a private
/// current-thread tokio runtime and blocks on every request. The connection
/// task is spawned onto that runtime and makes progress whenever a request
/// is being driven.
///
/// Queries use the simple-query protocol: multi-statement text yields one
/// result per statement and every value arrives as text. PostgreSQL has no
/// last-insert-id; `insert_id` is always 0.
///

use std::collections::VecDeque;
use std::pin::pin;

use futures_util::StreamExt;

use tokio::runtime::{Builder, Runtime};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

use super::{ConnectParams, Driver, DriverError, DriverResult, Row};

const DEFAULT_PORT: u16 = 5432;

/// SQLSTATE codes are five characters; purely numeric ones map to their
/// value, anything else to 1.
fn sqlstate_code(state: &str) -> i32 {
    state.parse::<i32>().ok().filter(|c| *c != 0).unwrap_or(1)
}

fn pg_error(e: &tokio_postgres::Error) -> DriverError {
    let code = e.code().map_or(1, |state| sqlstate_code(state.code()));
    let message = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    DriverError::new(code, message)
}

/// One protocol message, reduced to what result grouping needs.
#[derive(Debug)]
enum Message {
    Description(Vec<String>),
    Row(Row),
    Complete(u64),
    Failed(DriverError),
}

impl Message {
    fn from_simple(message: SimpleQueryMessage) -> Option<Self> {
        match message {
            SimpleQueryMessage::RowDescription(columns) => Some(Message::Description(
                columns.iter().map(|c| c.name().to_string()).collect(),
            )),
            SimpleQueryMessage::Row(row) => Some(Message::Row(
                (0..row.len()).map(|index| row.get(index).map(str::to_string)).collect(),
            )),
            SimpleQueryMessage::CommandComplete(affected) => Some(Message::Complete(affected)),
            _ => None,
        }
    }
}

/// Builds one result per completed statement. A failure ends the batch:
/// results completed before it are kept and the error follows them.
fn group_messages(messages: Vec<Message>) -> VecDeque<Result<DriverResult, DriverError>> {
    let mut results = VecDeque::new();
    let mut fields: Option<Vec<String>> = None;
    let mut rows: Vec<Row> = Vec::new();

    for message in messages {
        match message {
            Message::Description(names) => {
                fields = Some(names);
                rows.clear();
            }
            Message::Row(values) => rows.push(values),
            Message::Complete(affected) => match fields.take() {
                Some(names) => {
                    let mut result = DriverResult::rows(names, std::mem::take(&mut rows));
                    result.affected_rows = affected as i64;
                    results.push_back(Ok(result));
                }
                None => results.push_back(Ok(DriverResult::command(0, affected as i64))),
            },
            Message::Failed(err) => {
                results.push_back(Err(err));
                break;
            }
        }
    }
    results
}

fn failure(messages: &[Message]) -> Option<&DriverError> {
    messages.iter().find_map(|message| match message {
        Message::Failed(err) => Some(err),
        _ => None,
    })
}

#[derive(Default)]
pub struct PostgresDriver {
    runtime: Option<Runtime>,
    client: Option<Client>,
    last_error: Option<DriverError>,
    pending: VecDeque<Result<DriverResult, DriverError>>,
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `sql` and collects its messages up to and including the first
    /// failure, which is also recorded as the last error.
    fn simple_query(&mut self, sql: &str) -> Vec<Message> {
        let (Some(runtime), Some(client)) = (self.runtime.as_ref(), self.client.as_ref()) else {
            let err = DriverError::not_connected();
            self.last_error = Some(err.clone());
            return vec![Message::Failed(err)];
        };
        let messages = runtime.block_on(async {
            let mut messages = Vec::new();
            let stream = match client.simple_query_raw(sql).await {
                Ok(stream) => stream,
                Err(e) => {
                    messages.push(Message::Failed(pg_error(&e)));
                    return messages;
                }
            };
            let mut stream = pin!(stream);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => messages.extend(Message::from_simple(message)),
                    Err(e) => {
                        messages.push(Message::Failed(pg_error(&e)));
                        break;
                    }
                }
            }
            messages
        });
        self.last_error = failure(&messages).cloned();
        messages
    }

    fn first_value(&mut self, sql: &str) -> Option<String> {
        self.simple_query(sql).into_iter().find_map(|message| match message {
            Message::Row(mut values) if !values.is_empty() => values.swap_remove(0),
            _ => None,
        })
    }
}

impl Driver for PostgresDriver {
    fn connect(&mut self, params: &ConnectParams) -> Result<(), DriverError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DriverError::new(-1, format!("failed to start runtime: {}", e)))?;

        let mut config = Config::new();
        config
            .host(&params.host)
            .user(&params.user)
            .password(&params.password)
            .dbname(&params.database)
            .port(if params.port == 0 { DEFAULT_PORT } else { params.port });

        let (client, connection) = match runtime.block_on(config.connect(NoTls)) {
            Ok(pair) => pair,
            Err(e) => {
                let err = pg_error(&e);
                self.last_error = Some(err.clone());
                return Err(err);
            }
        };
        runtime.spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection closed with an error");
            }
        });

        self.runtime = Some(runtime);
        self.client = Some(client);
        self.last_error = None;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.pending.clear();
        self.client = None;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }

    fn last_error_code(&self) -> i32 {
        self.last_error.as_ref().map_or(0, |e| e.code)
    }

    fn last_error_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default()
    }

    fn ping(&mut self) -> i32 {
        match failure(&self.simple_query("SELECT 1")) {
            None => 0,
            Some(_) => 1,
        }
    }

    fn server_stats(&mut self) -> String {
        self.first_value("SELECT version()").unwrap_or_default()
    }

    fn charset(&mut self) -> String {
        self.first_value("SHOW client_encoding").unwrap_or_default()
    }

    fn set_charset(&mut self, charset: &str) -> bool {
        let sql = format!("SET client_encoding TO '{}'", self.escape(charset));
        let messages = self.simple_query(&sql);
        failure(&messages).is_none()
    }

    fn escape(&self, src: &str) -> String {
        src.replace('\'', "''")
    }

    fn execute(&mut self, sql: &str) -> Result<DriverResult, DriverError> {
        self.pending.clear();
        let mut results = group_messages(self.simple_query(sql));
        let first = results
            .pop_front()
            .unwrap_or_else(|| Ok(DriverResult::command(0, 0)));
        self.pending = results;
        first
    }

    fn fetch_additional_result(&mut self) -> Option<Result<DriverResult, DriverError>> {
        self.pending.pop_front()
    }
}

impl Drop for PostgresDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(sqlstate_code("23505"), 23505);
        assert_eq!(sqlstate_code("42P01"), 1);
        assert_eq!(sqlstate_code("00000"), 1);
    }

    #[test]
    fn test_unconnected_driver_reports_errors() {
        let mut driver = PostgresDriver::new();
        assert_ne!(driver.ping(), 0);
        assert!(driver.execute("SELECT 1").is_err());
        assert_eq!(driver.last_error_message(), "not connected");
        assert_eq!(driver.escape("a'b"), "a''b");
    }

    fn columns(names: &[&str]) -> Message {
        Message::Description(names.iter().map(|name| name.to_string()).collect())
    }

    #[test]
    fn test_empty_select_keeps_its_fields() {
        let mut results = group_messages(vec![columns(&["id", "name"]), Message::Complete(0)]);
        assert_eq!(results.len(), 1);
        let result = results.pop_front().unwrap().unwrap();
        assert_eq!(result.fields, vec!["id", "name"]);
        assert_eq!(result.affected_rows, 0);
        assert_eq!(result.rows.map(|rows| rows.num_rows()), Some(0));
    }

    #[test]
    fn test_commands_and_selects_group_per_statement() {
        let results = group_messages(vec![
            Message::Complete(3),
            columns(&["n"]),
            Message::Row(vec![Some("1".into())]),
            Message::Row(vec![None]),
            Message::Complete(2),
        ]);
        let results: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(results[0].fields.is_empty());
        assert_eq!(results[0].affected_rows, 3);
        assert_eq!(results[1].fields, vec!["n"]);
        assert_eq!(results[1].rows.as_ref().map(|rows| rows.num_rows()), Some(2));
    }

    #[test]
    fn test_failure_keeps_earlier_results() {
        let mut results = group_messages(vec![
            columns(&["?column?"]),
            Message::Row(vec![Some("1".into())]),
            Message::Complete(1),
            Message::Failed(DriverError::new(1, "relation \"missing\" does not exist")),
            Message::Complete(4),
        ]);
        assert_eq!(results.len(), 2);
        let first = results.pop_front().unwrap().unwrap();
        assert_eq!(first.fields, vec!["?column?"]);
        let err = results.pop_front().unwrap().unwrap_err();
        assert_eq!(err.message, "relation \"missing\" does not exist");
    }
}
