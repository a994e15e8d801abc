//! `MongoDB` Driver Implementation
//!
//! This module implements the [`Driver`] trait for `MongoDB` deployments.
//!
//! Queries are JSON command documents. `find`, `aggregate` and `count`/`countDocuments`
//! run through the collection API so paging lands on the cursor; any other command goes
//! to `runCommand` verbatim. A bare collection name means "find everything".
//!
//! Collections stand in for tables. Their columns are inferred from a document sample.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{
    page_window, parse_url_connection, ColumnInfo, ConnectionConfig, DatabaseType, Driver, IndexInfo,
    QueryResult, ResultRow, TableInfo, CONNECT_TIMEOUT,
};
use crate::error::{QuarryError, Result};

/// Documents sampled when inferring collection fields
const SCHEMA_SAMPLE_SIZE: i64 = 100;

#[derive(Default)]
pub struct MongoDriver {
    client: Mutex<Option<Client>>,
    default_db: Mutex<Option<String>>,
    running: Mutex<Option<CancellationToken>>,
}

impl MongoDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| QuarryError::connection_failed("MongoDB is not connected"))
    }

    /// Database named by `schema`, else the connection's default database
    fn database(&self, schema: Option<&str>) -> Result<Database> {
        let client = self.client()?;
        let name = schema
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_db.lock().clone())
            .ok_or_else(|| QuarryError::invalid_input("No MongoDB database selected"))?;
        Ok(client.database(&name))
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::MongoDB
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        if config.engine != DatabaseType::MongoDB {
            return Err(QuarryError::invalid_input(format!(
                "Expected MongoDB engine, got {}",
                config.engine
            )));
        }

        let uri = build_uri(config)?;
        let mut options = ClientOptions::parse(&uri).await.map_err(map_connect_error)?;
        options.connect_timeout = Some(CONNECT_TIMEOUT);
        options.server_selection_timeout = Some(CONNECT_TIMEOUT);
        options.app_name = Some("quarry".to_string());

        let client = Client::with_options(options).map_err(map_connect_error)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(map_connect_error)?;

        let default_db = config
            .database
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| client.default_database().map(|db| db.name().to_string()));
        debug!(database = ?default_db, "mongodb connected");

        *self.default_db.lock() = default_db;
        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
        self.default_db.lock().take();
        // The client tears down its pool once the last clone drops
        self.client.lock().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut names = self.client()?.list_database_names().await.map_err(map_query_error)?;
        names.sort();
        Ok(names)
    }

    /// `MongoDB` has no schema layer
    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let mut names = self.database(schema)?.list_collection_names().await.map_err(map_query_error)?;
        names.sort();
        Ok(names)
    }

    async fn get_table_info(&self, table: &str, schema: Option<&str>) -> Result<TableInfo> {
        let db = self.database(schema)?;
        let names = db.list_collection_names().await.map_err(map_query_error)?;
        if !names.iter().any(|n| n == table) {
            return Err(QuarryError::not_found(format!(
                "Collection '{table}' not found in database '{}'",
                db.name()
            )));
        }

        let collection = db.collection::<Document>(table);
        let mut cursor = collection
            .find(doc! {})
            .limit(SCHEMA_SAMPLE_SIZE)
            .await
            .map_err(map_query_error)?;
        let mut sample = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(map_query_error)? {
            sample.push(document);
        }

        let mut indexes = Vec::new();
        let mut index_cursor = collection.list_indexes().await.map_err(map_query_error)?;
        while let Some(model) = index_cursor.try_next().await.map_err(map_query_error)? {
            let name = model
                .options
                .as_ref()
                .and_then(|o| o.name.clone())
                .unwrap_or_else(|| model.keys.keys().cloned().collect::<Vec<_>>().join("_"));
            if name == "_id_" {
                continue;
            }
            indexes.push(IndexInfo {
                name,
                columns: model.keys.keys().cloned().collect(),
                unique: model.options.as_ref().and_then(|o| o.unique).unwrap_or(false),
            });
        }

        let row_count = collection.estimated_document_count().await.map_err(map_query_error)?;

        Ok(TableInfo {
            name: table.to_string(),
            schema: Some(db.name().to_string()),
            columns: infer_columns(&sample),
            indexes,
            row_count: Some(row_count),
        })
    }

    async fn execute_query(
        &self,
        sql: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        let db = self.database(None)?;
        let command = parse_command(sql)?;
        let (limit, offset) = page_window(limit, offset);

        let token = CancellationToken::new();
        *self.running.lock() = Some(token.clone());
        let outcome = tokio::select! {
            result = run_command(&db, command, limit, offset) => result,
            () = token.cancelled() => Err(QuarryError::cancelled("Query cancelled")),
        };
        self.running.lock().take();
        outcome
    }

    async fn cancel_query(&self) -> Result<()> {
        if let Some(token) = self.running.lock().as_ref() {
            token.cancel();
        }
        Ok(())
    }

    fn parse_connection_string(&self, input: &str) -> Result<ConnectionConfig> {
        let mut config = parse_url_connection(DatabaseType::MongoDB, input, &["mongodb", "mongodb+srv"])?;
        if input.trim().starts_with("mongodb+srv://") {
            // SRV records carry the port
            config.port = None;
        }
        Ok(config)
    }
}

fn build_uri(config: &ConnectionConfig) -> Result<String> {
    if let Some(uri) = &config.connection_string {
        return Ok(uri.clone());
    }

    let host = config
        .host
        .as_ref()
        .ok_or_else(|| QuarryError::invalid_input("MongoDB requires 'host' parameter"))?;
    let port = config.port.unwrap_or(27017);

    let credentials = match (&config.username, &config.password) {
        (Some(user), Some(pass)) => format!("{}:{}@", encode_userinfo(user), encode_userinfo(pass)),
        (Some(user), None) => format!("{}@", encode_userinfo(user)),
        _ => String::new(),
    };
    let database = config.database.as_deref().unwrap_or("");
    let auth_source = if credentials.is_empty() { "" } else { "?authSource=admin" };

    Ok(format!("mongodb://{credentials}{host}:{port}/{database}{auth_source}"))
}

/// RFC 3986 unreserved characters stay literal in userinfo
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Percent-encode a URI userinfo component
fn encode_userinfo(input: &str) -> String {
    utf8_percent_encode(input, USERINFO).to_string()
}

fn map_connect_error(e: mongodb::error::Error) -> QuarryError {
    match e.kind.as_ref() {
        ErrorKind::Authentication { message, .. } => QuarryError::authentication(message.clone()),
        ErrorKind::ServerSelection { message, .. } | ErrorKind::DnsResolve { message, .. } => {
            QuarryError::network(message.clone())
        }
        ErrorKind::Io(io) => QuarryError::network(io.to_string()),
        ErrorKind::Command(cmd) if cmd.code == 18 || cmd.code == 13 => {
            QuarryError::authentication(cmd.message.clone())
        }
        ErrorKind::InvalidArgument { message, .. } => {
            QuarryError::invalid_input(format!("Invalid MongoDB connection string: {message}"))
        }
        _ => QuarryError::connection_failed(e.to_string()),
    }
}

/// Map a command failure, keeping the server text verbatim
fn map_query_error(e: mongodb::error::Error) -> QuarryError {
    match e.kind.as_ref() {
        // NamespaceNotFound
        ErrorKind::Command(cmd) if cmd.code == 26 => QuarryError::not_found(cmd.message.clone()),
        ErrorKind::Command(cmd) => QuarryError::query_failed(cmd.message.clone()),
        ErrorKind::ServerSelection { message, .. } => QuarryError::network(message.clone()),
        ErrorKind::Io(io) => QuarryError::network(io.to_string()),
        _ => QuarryError::query_failed(e.to_string()),
    }
}

#[derive(Debug, PartialEq)]
enum MongoCommand {
    Find {
        collection: String,
        filter: Document,
        sort: Option<Document>,
        projection: Option<Document>,
    },
    Aggregate {
        collection: String,
        pipeline: Vec<Document>,
    },
    Count {
        collection: String,
        filter: Document,
    },
    Run(Document),
}

fn json_to_document(value: serde_json::Value) -> Result<Document> {
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(QuarryError::invalid_input(format!(
            "Expected a JSON object, got {}",
            bson_type_name(&other)
        ))),
        Err(e) => Err(QuarryError::invalid_input(format!("Invalid extended JSON: {e}"))),
    }
}

fn parse_command(input: &str) -> Result<MongoCommand> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(QuarryError::invalid_input("Query cannot be empty"));
    }
    if !trimmed.starts_with('{') {
        return Ok(MongoCommand::Find {
            collection: trimmed.to_string(),
            filter: Document::new(),
            sort: None,
            projection: None,
        });
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| QuarryError::invalid_input(format!("Invalid MongoDB command document: {e}")))?;
    let mut document = json_to_document(value)?;

    let Some((name, target)) = document.iter().next().map(|(k, v)| (k.clone(), v.clone())) else {
        return Err(QuarryError::invalid_input("MongoDB command document is empty"));
    };
    let collection = || {
        target
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| QuarryError::invalid_input(format!("'{name}' expects a collection name")))
    };
    let mut take_doc = |key: &str| match document.remove(key) {
        Some(Bson::Document(d)) => Ok(Some(d)),
        Some(_) => Err(QuarryError::invalid_input(format!("'{key}' must be an object"))),
        None => Ok(None),
    };

    Ok(match name.as_str() {
        "find" => MongoCommand::Find {
            collection: collection()?,
            filter: take_doc("filter")?.unwrap_or_default(),
            sort: take_doc("sort")?,
            projection: take_doc("projection")?,
        },
        "count" | "countDocuments" => MongoCommand::Count {
            collection: collection()?,
            filter: take_doc("filter")?.or(take_doc("query")?).unwrap_or_default(),
        },
        "aggregate" => {
            let pipeline = match document.get("pipeline") {
                Some(Bson::Array(stages)) => stages
                    .iter()
                    .map(|stage| match stage {
                        Bson::Document(d) => Ok(d.clone()),
                        _ => Err(QuarryError::invalid_input("Pipeline stages must be objects")),
                    })
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
                Some(_) => return Err(QuarryError::invalid_input("'pipeline' must be an array")),
            };
            MongoCommand::Aggregate { collection: collection()?, pipeline }
        }
        _ => MongoCommand::Run(document),
    })
}

fn as_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

async fn run_command(db: &Database, command: MongoCommand, limit: usize, offset: usize) -> Result<QueryResult> {
    let start = Instant::now();

    let documents = match command {
        MongoCommand::Find { collection, filter, sort, projection } => {
            let cursor = db
                .collection::<Document>(&collection)
                .find(filter)
                .sort(sort.unwrap_or_default())
                .projection(projection.unwrap_or_default())
                .skip(offset as u64)
                .limit(as_count(limit))
                .await
                .map_err(map_query_error)?;
            cursor.try_collect::<Vec<_>>().await.map_err(map_query_error)?
        }
        MongoCommand::Aggregate { collection, mut pipeline } => {
            let writes = pipeline.iter().any(|s| s.contains_key("$out") || s.contains_key("$merge"));
            if !writes {
                pipeline.push(doc! { "$skip": as_count(offset) });
                pipeline.push(doc! { "$limit": as_count(limit) });
            }
            let cursor = db
                .collection::<Document>(&collection)
                .aggregate(pipeline)
                .await
                .map_err(map_query_error)?;
            cursor.try_collect::<Vec<_>>().await.map_err(map_query_error)?
        }
        MongoCommand::Count { collection, filter } => {
            let count = db
                .collection::<Document>(&collection)
                .count_documents(filter)
                .await
                .map_err(map_query_error)?;
            vec![doc! { "count": i64::try_from(count).unwrap_or(i64::MAX) }]
        }
        MongoCommand::Run(command) => {
            let is_write = matches!(
                command.keys().next().map(String::as_str),
                Some("insert" | "update" | "delete")
            );
            let reply = db.run_command(command).await.map_err(map_query_error)?;
            if is_write {
                let n = reply
                    .get("n")
                    .and_then(|n| n.as_i32().map(i64::from).or_else(|| n.as_i64()))
                    .unwrap_or(0);
                return Ok(QueryResult::affected(u64::try_from(n).unwrap_or(0), elapsed_ms(start)));
            }
            vec![reply]
        }
    };

    let (columns, rows) = documents_to_rows(documents);
    Ok(QueryResult::with_rows(columns, rows, elapsed_ms(start)))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Flatten documents into rows; columns are keys in first-seen order
fn documents_to_rows(documents: Vec<Document>) -> (Vec<String>, Vec<ResultRow>) {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::with_capacity(documents.len());
    for document in documents {
        let mut row = ResultRow::with_capacity(document.len());
        for (key, value) in document {
            if !columns.contains(&key) {
                columns.push(key.clone());
            }
            row.insert(key, value.into_relaxed_extjson());
        }
        rows.push(row);
    }
    (columns, rows)
}

/// `$type` alias of a BSON value
fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::Timestamp(_) => "timestamp",
        Bson::Decimal128(_) => "decimal",
        _ => "unknown",
    }
}

fn infer_columns(sample: &[Document]) -> Vec<ColumnInfo> {
    // (name, type, documents containing a non-null value)
    let mut seen: Vec<(String, &'static str, usize)> = Vec::new();
    for document in sample {
        for (key, value) in document {
            let idx = match seen.iter().position(|(name, _, _)| name == key) {
                Some(idx) => idx,
                None => {
                    seen.push((key.clone(), "null", 0));
                    seen.len() - 1
                }
            };
            let entry = &mut seen[idx];
            if !matches!(value, Bson::Null) {
                entry.2 += 1;
                if entry.1 == "null" {
                    entry.1 = bson_type_name(value);
                } else if entry.1 != bson_type_name(value) {
                    entry.1 = "mixed";
                }
            }
        }
    }

    seen.into_iter()
        .map(|(name, data_type, present)| ColumnInfo {
            primary_key: name == "_id",
            nullable: present < sample.len(),
            data_type: data_type.to_string(),
            default: None,
            name,
        })
        .collect()
}
