//! The `Label` side table.
//!
//! Labels returned by [`Model::labels`] are stored one row per label, keyed by
//! the model kind and the model's textual primary key. An update replaces the
//! whole set for the parent.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::predicate::Predicate;
use super::schema::{Field, FieldType, Schema};
use super::table::{pk_text, Table};
use super::Model;
use crate::Result;

static LABEL: Schema = Schema::new(
    "Label",
    &[
        Field::new("kind", FieldType::Text).pk(),
        Field::new("parent", FieldType::Text).pk(),
        Field::new("name", FieldType::Text).pk(),
        Field::new("value", FieldType::Text),
    ],
);

/// One label on one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Table name of the labeled model.
    pub kind: String,
    /// Primary key of the labeled model.
    pub parent: String,
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Model for Label {
    fn schema() -> &'static Schema {
        &LABEL
    }
}

impl Label {
    /// Selects every label of one model.
    pub fn of<M: Model>(model: &M) -> Predicate {
        Predicate::and([
            Predicate::eq("kind", M::schema().name),
            Predicate::eq("parent", model.pk()),
        ])
    }
}

pub(crate) fn insert_labels<M: Model>(conn: &Connection, model: &M) -> Result<()> {
    let Some(labels) = model.labels() else {
        return Ok(());
    };
    let table = Table::new(conn);
    let kind = M::schema().name;
    let parent = pk_text(model)?;
    for (name, value) in labels {
        table.insert(&Label {
            kind: kind.to_string(),
            parent: parent.clone(),
            name,
            value,
        })?;
    }
    Ok(())
}

pub(crate) fn delete_labels<M: Model>(conn: &Connection, model: &M) -> Result<()> {
    let selector = Predicate::and([
        Predicate::eq("kind", M::schema().name),
        Predicate::eq("parent", pk_text(model)?),
    ]);
    Table::new(conn).delete_where::<Label>(&selector)?;
    Ok(())
}

pub(crate) fn replace_labels<M: Model>(conn: &Connection, model: &M) -> Result<()> {
    delete_labels(conn, model)?;
    insert_labels(conn, model)
}
