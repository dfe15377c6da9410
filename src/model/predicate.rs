//! Query predicates, paging and sort options.
//!
//! Predicates compile to a SQL fragment plus a parameter list. Field names are
//! checked against the schema and every value is bound as a parameter.

use rusqlite::types::{ToSql, ToSqlOutput};

use super::schema::{quote, Schema};
use crate::Result;

// =============================================================================
// Value
// =============================================================================

/// A value bound into a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Integer, also used for booleans (0/1).
    Integer(i64),
    /// Float.
    Real(f64),
    /// Text.
    Text(String),
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// =============================================================================
// Predicate
// =============================================================================

/// A row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field = value` (`IS NULL` for [`Value::Null`]).
    Eq(String, Value),
    /// `field != value` (`IS NOT NULL` for [`Value::Null`]).
    Neq(String, Value),
    /// `field > value`
    Gt(String, Value),
    /// `field < value`
    Lt(String, Value),
    /// All of. Empty matches every row.
    And(Vec<Predicate>),
    /// Any of. Empty matches no row.
    Or(Vec<Predicate>),
    /// Rows carrying the label `name=value`.
    Label {
        /// Label name.
        name: String,
        /// Label value.
        value: String,
    },
}

impl Predicate {
    /// `field = value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    /// `field != value`
    pub fn neq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Neq(field.into(), value.into())
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gt(field.into(), value.into())
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt(field.into(), value.into())
    }

    /// Conjunction.
    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::And(predicates.into_iter().collect())
    }

    /// Disjunction.
    pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Or(predicates.into_iter().collect())
    }

    /// Label selector.
    pub fn label(name: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Label {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Compiles to a SQL boolean expression, appending bound values to
    /// `params` in placeholder order.
    pub(crate) fn compile(&self, schema: &Schema, params: &mut Vec<Value>) -> Result<String> {
        match self {
            Predicate::Eq(field, Value::Null) => {
                Ok(format!("{} IS NULL", quote(schema.require(field)?.name)))
            }
            Predicate::Neq(field, Value::Null) => {
                Ok(format!("{} IS NOT NULL", quote(schema.require(field)?.name)))
            }
            Predicate::Eq(field, v) => compare(schema, field, "=", v, params),
            Predicate::Neq(field, v) => compare(schema, field, "!=", v, params),
            Predicate::Gt(field, v) => compare(schema, field, ">", v, params),
            Predicate::Lt(field, v) => compare(schema, field, "<", v, params),
            Predicate::And(list) => join(schema, list, " AND ", "1", params),
            Predicate::Or(list) => join(schema, list, " OR ", "0", params),
            Predicate::Label { name, value } => {
                params.push(Value::Text(schema.name.to_string()));
                params.push(Value::Text(name.clone()));
                params.push(Value::Text(value.clone()));
                Ok(format!(
                    "{} IN (SELECT \"parent\" FROM \"Label\" \
                     WHERE \"kind\" = ? AND \"name\" = ? AND \"value\" = ?)",
                    pk_text_expr(schema)
                ))
            }
        }
    }
}

fn compare(
    schema: &Schema,
    field: &str,
    op: &str,
    value: &Value,
    params: &mut Vec<Value>,
) -> Result<String> {
    let field = schema.require(field)?;
    params.push(value.clone());
    Ok(format!("{} {op} ?", quote(field.name)))
}

fn join(
    schema: &Schema,
    list: &[Predicate],
    sep: &str,
    empty: &str,
    params: &mut Vec<Value>,
) -> Result<String> {
    if list.is_empty() {
        return Ok(empty.to_string());
    }
    let parts = list
        .iter()
        .map(|p| p.compile(schema, params).map(|sql| format!("({sql})")))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(sep))
}

/// SQL expression producing the textual primary key, matching `Model::pk`.
pub(crate) fn pk_text_expr(schema: &Schema) -> String {
    let cols: Vec<String> = schema
        .pk_fields()
        .map(|f| format!("CAST({} AS TEXT)", quote(f.name)))
        .collect();
    if cols.len() == 1 {
        cols.concat()
    } else {
        format!("({})", cols.join(" || '/' || "))
    }
}

// =============================================================================
// Paging and Sorting
// =============================================================================

/// A page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Rows skipped.
    pub offset: usize,
    /// Maximum rows returned.
    pub limit: usize,
}

impl Page {
    /// A page starting at `offset`.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Applies the page to an in-memory collection.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

/// Options for [`Table::list`](super::Table::list).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    /// Row filter. `None` lists everything.
    pub predicate: Option<Predicate>,
    /// Optional page.
    pub page: Option<Page>,
    /// Sort fields. A leading `-` sorts descending. Defaults to the primary key.
    pub sort: Vec<String>,
}

impl ListOptions {
    /// Lists rows matching `predicate`.
    pub fn filter(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    /// Restricts to one page.
    pub fn with_page(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    /// Appends a sort field.
    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.sort.push(field.into());
        self
    }

    /// Builds the `ORDER BY` clause body.
    pub(crate) fn order_by(&self, schema: &Schema) -> Result<String> {
        if self.sort.is_empty() {
            let pk: Vec<String> = schema.pk_fields().map(|f| quote(f.name)).collect();
            return Ok(pk.join(", "));
        }
        let keys = self
            .sort
            .iter()
            .map(|key| {
                let (name, dir) = match key.strip_prefix('-') {
                    Some(name) => (name, "DESC"),
                    None => (key.as_str(), "ASC"),
                };
                let field = schema.require(name)?;
                Ok(format!("{} {dir}", quote(field.name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(keys.join(", "))
    }
}

impl From<Predicate> for ListOptions {
    fn from(predicate: Predicate) -> Self {
        ListOptions::filter(predicate)
    }
}
