//! # Table Mapper
//!
//! Maps models to rows and back through their serde encoding and static
//! schema. A [`Table`] borrows a connection, so the same code runs against the
//! writer inside a transaction, against the writer in autocommit mode, and
//! against a read-only connection.
//!
//! ## Row Encoding
//!
//! A model is serialized to a JSON object, then each declared field is read
//! out of the object and converted to its column type. Decoding goes the other
//! way: columns become a JSON object which serde turns back into the model.
//! Fields missing from the object, or `null`, become SQL NULL and are rejected
//! for non-nullable columns.
//!
//! Schemas are checked for shape when registered, but whether a model's serde
//! encoding fits its schema is only known once there is a value: a mismatch
//! surfaces as `Error::Schema` on the first write or key lookup of that model.
//!
//! SQLite and serde failures are wrapped here with the operation and table
//! name (`insert Person`, `decode Person`).
//!
//! ```text
//!   Person { id: 1, name: "ada", admin: true, tags: ["x"] }
//!      │ serde_json::to_value
//!      ▼
//!   {"id":1,"name":"ada","admin":true,"tags":["x"]}
//!      │ per field type
//!      ▼
//!   (1, 'ada', 1, '["x"]')
//! ```

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::{Map, Value as Json};

use super::predicate::{ListOptions, Predicate, Value};
use super::schema::{quote, Field, FieldType, Schema};
use super::Model;
use crate::error::ResultExt;
use crate::{Error, Result};

// =============================================================================
// Table
// =============================================================================

/// Model operations over one borrowed connection.
#[derive(Debug, Clone, Copy)]
pub struct Table<'a> {
    conn: &'a Connection,
}

impl<'a> Table<'a> {
    /// Wraps a connection.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Fetches one row by primary key values, in pk declaration order.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no row matches, `Error::Schema` when the number
    /// of key values does not match the key.
    pub fn get<M: Model>(&self, key: &[Value]) -> Result<M> {
        let schema = M::schema();
        let (clause, params) = pk_clause(schema, key.to_vec())?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {clause}",
            columns(schema),
            quote(schema.name)
        );
        let mut found = self.query::<M>(&sql, &params)?;
        match found.pop() {
            Some(model) => Ok(model),
            None => Err(Error::not_found(schema.name, key_string(key))),
        }
    }

    /// Fetches the stored row with the same primary key as `model`.
    pub fn find<M: Model>(&self, model: &M) -> Result<M> {
        self.get::<M>(&pk_values(model)?)
    }

    /// Lists rows.
    pub fn list<M: Model>(&self, options: &ListOptions) -> Result<Vec<M>> {
        let schema = M::schema();
        let mut params = Vec::new();
        let mut sql = format!("SELECT {} FROM {}", columns(schema), quote(schema.name));
        if let Some(predicate) = &options.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate.compile(schema, &mut params)?);
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&options.order_by(schema)?);
        if let Some(page) = options.page {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(to_i64(page.limit)));
            params.push(Value::Integer(to_i64(page.offset)));
        }
        self.query::<M>(&sql, &params)
    }

    /// Counts rows matching `predicate`.
    pub fn count<M: Model>(&self, predicate: Option<&Predicate>) -> Result<i64> {
        let schema = M::schema();
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote(schema.name));
        if let Some(predicate) = predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate.compile(schema, &mut params)?);
        }
        let context = || format!("count {}", schema.name);
        let mut stmt = self.conn.prepare_cached(&sql).with_context(context)?;
        stmt.query_row(params_from_iter(params.iter()), |row| row.get(0))
            .with_context(context)
    }

    /// Inserts a row. A duplicate key is a `Error::Store` constraint failure.
    pub fn insert<M: Model>(&self, model: &M) -> Result<()> {
        let schema = M::schema();
        let values = encode_row(model)?;
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote(schema.name),
            columns(schema)
        );
        let context = || format!("insert {}", schema.name);
        self.conn
            .prepare_cached(&sql)
            .with_context(context)?
            .execute(params_from_iter(values.iter()))
            .with_context(context)?;
        Ok(())
    }

    /// Updates every non-key field of the row with the same key.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no row has the key.
    pub fn update<M: Model>(&self, model: &M) -> Result<()> {
        let schema = M::schema();
        let values = encode_row(model)?;
        let mut sets = Vec::new();
        let mut params = Vec::new();
        let mut key = Vec::new();
        for (field, value) in schema.fields.iter().zip(values) {
            if field.pk {
                key.push(value);
            } else {
                sets.push(format!("{} = ?", quote(field.name)));
                params.push(value);
            }
        }
        if sets.is_empty() {
            // Key-only table: nothing to change, but the row must exist.
            self.get::<M>(&key)?;
            return Ok(());
        }
        let (clause, key_params) = pk_clause(schema, key)?;
        params.extend(key_params);
        let sql = format!(
            "UPDATE {} SET {} WHERE {clause}",
            quote(schema.name),
            sets.join(", ")
        );
        let context = || format!("update {}", schema.name);
        let changed = self
            .conn
            .prepare_cached(&sql)
            .with_context(context)?
            .execute(params_from_iter(params.iter()))
            .with_context(context)?;
        if changed == 0 {
            return Err(Error::not_found(schema.name, pk_text(model)?));
        }
        Ok(())
    }

    /// Deletes the row with the same key as `model`.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no row has the key.
    pub fn delete<M: Model>(&self, model: &M) -> Result<()> {
        let schema = M::schema();
        let (clause, params) = pk_clause(schema, pk_values(model)?)?;
        let sql = format!("DELETE FROM {} WHERE {clause}", quote(schema.name));
        let context = || format!("delete {}", schema.name);
        let changed = self
            .conn
            .prepare_cached(&sql)
            .with_context(context)?
            .execute(params_from_iter(params.iter()))
            .with_context(context)?;
        if changed == 0 {
            return Err(Error::not_found(schema.name, pk_text(model)?));
        }
        Ok(())
    }

    /// Deletes every row matching `predicate`, returning how many went.
    pub fn delete_where<M: Model>(&self, predicate: &Predicate) -> Result<usize> {
        let schema = M::schema();
        let mut params = Vec::new();
        let clause = predicate.compile(schema, &mut params)?;
        let sql = format!("DELETE FROM {} WHERE {clause}", quote(schema.name));
        let context = || format!("delete from {}", schema.name);
        self.conn
            .prepare_cached(&sql)
            .with_context(context)?
            .execute(params_from_iter(params.iter()))
            .with_context(context)
    }

    fn query<M: Model>(&self, sql: &str, params: &[Value]) -> Result<Vec<M>> {
        let context = || format!("select {}", M::schema().name);
        let mut stmt = self.conn.prepare_cached(sql).with_context(context)?;
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .with_context(context)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().with_context(context)? {
            out.push(decode_row::<M>(row)?);
        }
        Ok(out)
    }
}

// =============================================================================
// SQL Helpers
// =============================================================================

fn columns(schema: &Schema) -> String {
    schema
        .fields
        .iter()
        .map(|f| quote(f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn pk_clause(schema: &Schema, key: Vec<Value>) -> Result<(String, Vec<Value>)> {
    let fields: Vec<&Field> = schema.pk_fields().collect();
    if fields.len() != key.len() {
        return Err(Error::Schema(format!(
            "'{}' key has {} fields, got {} values",
            schema.name,
            fields.len(),
            key.len()
        )));
    }
    let clause = fields
        .iter()
        .map(|f| format!("{} = ?", quote(f.name)))
        .collect::<Vec<_>>()
        .join(" AND ");
    Ok((clause, key))
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn key_string(key: &[Value]) -> String {
    key.iter()
        .map(|v| match v {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => s.clone(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Primary key of `model` as text, composite keys joined with `/`.
pub(crate) fn pk_text<M: Model>(model: &M) -> Result<String> {
    Ok(key_string(&pk_values(model)?))
}

/// Textual form of one primary key component.
pub(crate) fn key_text(value: Option<&Json>) -> String {
    match value {
        None | Some(Json::Null) => String::new(),
        Some(Json::String(s)) => s.clone(),
        Some(Json::Bool(b)) => u8::from(*b).to_string(),
        Some(other) => other.to_string(),
    }
}

// =============================================================================
// Row Encoding
// =============================================================================

/// Column values of `model`, in schema field order.
pub(crate) fn encode_row<M: Model>(model: &M) -> Result<Vec<Value>> {
    let schema = M::schema();
    let json = serde_json::to_value(model).with_context(|| format!("encode {}", schema.name))?;
    let object = json.as_object().ok_or_else(|| {
        Error::Schema(format!("'{}' does not serialize to an object", schema.name))
    })?;
    schema
        .fields
        .iter()
        .map(|f| encode_field(schema, f, object.get(f.name)))
        .collect()
}

/// Primary key values of `model`, in pk declaration order.
pub(crate) fn pk_values<M: Model>(model: &M) -> Result<Vec<Value>> {
    let schema = M::schema();
    let values = encode_row(model)?;
    Ok(schema
        .fields
        .iter()
        .zip(values)
        .filter(|(f, _)| f.pk)
        .map(|(_, v)| v)
        .collect())
}

fn encode_field(schema: &Schema, field: &Field, value: Option<&Json>) -> Result<Value> {
    let value = match value {
        None | Some(Json::Null) if field.nullable => return Ok(Value::Null),
        None | Some(Json::Null) => return Err(mismatch(schema, field, "null")),
        Some(value) => value,
    };
    match (field.ty, value) {
        (FieldType::Integer, Json::Number(n)) => n
            .as_i64()
            .map(Value::Integer)
            .ok_or_else(|| mismatch(schema, field, "non-integer number")),
        (FieldType::Real, Json::Number(n)) => n
            .as_f64()
            .map(Value::Real)
            .ok_or_else(|| mismatch(schema, field, "number")),
        (FieldType::Text, Json::String(s)) => Ok(Value::Text(s.clone())),
        (FieldType::Bool, Json::Bool(b)) => Ok(Value::from(*b)),
        (FieldType::Json, v) => serde_json::to_string(v)
            .map(Value::Text)
            .with_context(|| format!("encode {}.{}", schema.name, field.name)),
        (_, v) => Err(mismatch(schema, field, json_kind(v))),
    }
}

fn decode_row<M: Model>(row: &Row<'_>) -> Result<M> {
    let schema = M::schema();
    let context = || format!("decode {}", schema.name);
    let mut object = Map::with_capacity(schema.fields.len());
    for (i, field) in schema.fields.iter().enumerate() {
        let value = match row.get_ref(i).with_context(context)? {
            ValueRef::Null => Json::Null,
            ValueRef::Integer(n) => match field.ty {
                FieldType::Bool => Json::Bool(n != 0),
                FieldType::Real => Json::from(n as f64),
                _ => Json::from(n),
            },
            ValueRef::Real(f) => Json::from(f),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    Error::Schema(format!("'{}.{}' is not UTF-8: {e}", schema.name, field.name))
                })?;
                match field.ty {
                    FieldType::Json => serde_json::from_str(text).with_context(context)?,
                    _ => Json::String(text.to_string()),
                }
            }
            ValueRef::Blob(_) => return Err(mismatch(schema, field, "blob")),
        };
        object.insert(field.name.to_string(), value);
    }
    serde_json::from_value(Json::Object(object)).with_context(context)
}

fn mismatch(schema: &Schema, field: &Field, got: &str) -> Error {
    Error::Schema(format!(
        "'{}.{}' expects {:?}, got {got}",
        schema.name, field.name, field.ty
    ))
}

fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::initialize;
    use crate::model::{Catalog, Page};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Host {
        id: i64,
        name: String,
        ready: bool,
        load: f64,
        tags: Vec<String>,
        #[serde(default)]
        note: Option<String>,
    }

    static HOST: Schema = Schema::new(
        "Host",
        &[
            Field::new("id", FieldType::Integer).pk(),
            Field::new("name", FieldType::Text),
            Field::new("ready", FieldType::Bool),
            Field::new("load", FieldType::Real),
            Field::new("tags", FieldType::Json),
            Field::new("note", FieldType::Text).nullable(),
        ],
    );

    impl Model for Host {
        fn schema() -> &'static Schema {
            &HOST
        }
    }

    fn host(id: i64, name: &str) -> Host {
        Host {
            id,
            name: name.to_string(),
            ready: id % 2 == 0,
            load: id as f64 / 2.0,
            tags: vec![format!("t{id}")],
            note: None,
        }
    }

    fn open() -> Connection {
        let conn = Connection::open_in_memory().expect("should open");
        let catalog = Catalog::new().register::<Host>().expect("should register");
        initialize(&conn, &catalog, Duration::from_secs(1)).expect("should initialize");
        conn
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let conn = open();
        let table = Table::new(&conn);
        let mut h = host(1, "alpha");
        h.note = Some("primary".into());
        table.insert(&h).expect("should insert");

        let got: Host = table.get(&[Value::from(1)]).expect("should get");
        assert_eq!(got, h);
        assert_eq!(table.find(&h).expect("should find"), h);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let conn = open();
        let err = Table::new(&conn).get::<Host>(&[Value::from(9)]).unwrap_err();
        assert!(matches!(err, Error::NotFound { ref kind, ref key } if kind == "Host" && key == "9"));
    }

    #[test]
    fn test_update_and_delete_missing() {
        let conn = open();
        let table = Table::new(&conn);
        assert!(table.update(&host(1, "a")).unwrap_err().is_not_found());
        assert!(table.delete(&host(1, "a")).unwrap_err().is_not_found());

        table.insert(&host(1, "a")).expect("should insert");
        table.update(&host(1, "b")).expect("should update");
        let got: Host = table.get(&[Value::from(1)]).expect("should get");
        assert_eq!(got.name, "b");
        table.delete(&got).expect("should delete");
        assert_eq!(table.count::<Host>(None).expect("should count"), 0);
    }

    #[test]
    fn test_duplicate_insert_is_store_error() {
        let conn = open();
        let table = Table::new(&conn);
        table.insert(&host(1, "a")).expect("should insert");
        let err = table.insert(&host(1, "a")).unwrap_err();
        assert_eq!(err.to_string().split(':').next(), Some("insert Host"));
        assert!(matches!(err.root_cause(), Error::Store(_)));
    }

    #[test]
    fn test_list_filter_sort_page() {
        let conn = open();
        let table = Table::new(&conn);
        for i in 1..=6 {
            table.insert(&host(i, &format!("h{i}"))).expect("should insert");
        }

        let ready: Vec<Host> = table
            .list(&ListOptions::filter(Predicate::eq("ready", true)).sort_by("-id"))
            .expect("should list");
        let ids: Vec<i64> = ready.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![6, 4, 2]);

        let page: Vec<Host> = table
            .list(&ListOptions::default().with_page(Page::new(2, 2)))
            .expect("should list");
        let ids: Vec<i64> = page.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 4]);

        let n = table
            .count::<Host>(Some(&Predicate::gt("load", 1.0)))
            .expect("should count");
        assert_eq!(n, 4);
    }

    #[test]
    fn test_delete_where() {
        let conn = open();
        let table = Table::new(&conn);
        for i in 1..=4 {
            table.insert(&host(i, "x")).expect("should insert");
        }
        let gone = table
            .delete_where::<Host>(&Predicate::lt("id", 3))
            .expect("should delete");
        assert_eq!(gone, 2);
        assert_eq!(table.count::<Host>(None).expect("should count"), 2);
    }

    #[test]
    fn test_type_mismatch_is_schema_error() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Wrong {
            id: String,
        }
        static WRONG: Schema = Schema::new("Wrong", &[Field::new("id", FieldType::Integer).pk()]);
        impl Model for Wrong {
            fn schema() -> &'static Schema {
                &WRONG
            }
        }
        let err = encode_row(&Wrong { id: "x".into() }).unwrap_err();
        assert!(matches!(err, Error::Schema(ref m) if m.contains("Wrong.id")));
    }

    #[test]
    fn test_unserializable_model_has_no_key() {
        #[derive(Debug, Clone, PartialEq, Deserialize)]
        struct Broken {
            id: i64,
        }
        impl Serialize for Broken {
            fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("refused"))
            }
        }
        static BROKEN: Schema = Schema::new("Broken", &[Field::new("id", FieldType::Integer).pk()]);
        impl Model for Broken {
            fn schema() -> &'static Schema {
                &BROKEN
            }
        }

        let broken = Broken { id: 1 };
        assert_eq!(broken.pk(), "");
        let err = pk_text(&broken).unwrap_err();
        assert!(matches!(err.root_cause(), Error::Codec(_)));
        assert!(err.to_string().starts_with("encode Broken"));

        let conn = open();
        let err = crate::model::label::delete_labels(&conn, &broken).unwrap_err();
        assert!(matches!(err.root_cause(), Error::Codec(_)));
    }

    #[test]
    fn test_key_text() {
        assert_eq!(key_text(Some(&Json::from(5))), "5");
        assert_eq!(key_text(Some(&Json::from("a/b"))), "a/b");
        assert_eq!(key_text(None), "");
        assert_eq!(pk_text(&host(42, "x")).expect("should encode"), "42");
    }
}
