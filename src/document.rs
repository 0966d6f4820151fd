//! Engine-ready documents and delete rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::Query;

/// A document represents a single item to be indexed.
///
/// Fields are multi-valued strings. Field names are kept sorted so that a
/// document serializes identically no matter the insertion order.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct Document {
    fields: BTreeMap<String, Vec<String>>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document {
            fields: BTreeMap::new(),
        }
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }

    /// Append a value to a field.
    pub fn add_field<S: Into<String>, V: Into<String>>(&mut self, name: S, value: V) {
        self.fields
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    /// Replace every value of a field.
    pub fn set_field<S: Into<String>>(&mut self, name: S, values: Vec<String>) {
        self.fields.insert(name.into(), values);
    }

    /// Get the first value of a field.
    pub fn get_field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Get all values of a field.
    pub fn get_values(&self, name: &str) -> &[String] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check if the document has a field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Remove a field from the document.
    pub fn remove_field(&mut self, name: &str) -> Option<Vec<String>> {
        self.fields.remove(name)
    }

    /// Get all field names.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(|s| s.as_str()).collect()
    }

    /// Get all fields.
    pub fn fields(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fields
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether any value of `term.field` equals `term.value`.
    pub fn contains_term(&self, term: &Term) -> bool {
        self.get_values(&term.field).iter().any(|v| *v == term.value)
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        DocumentBuilder {
            document: Document::new(),
        }
    }

    /// Add a value to a field.
    pub fn add_field<S: Into<String>, V: Into<String>>(mut self, name: S, value: V) -> Self {
        self.document.add_field(name, value);
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.document
    }
}

/// An exact `field:value` pair.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub struct Term {
    pub field: String,
    pub value: String,
}

impl Term {
    pub fn new<F: Into<String>, V: Into<String>>(field: F, value: V) -> Self {
        Term {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.value)
    }
}

/// Selects the documents to remove before (or instead of) an insert.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum DeleteRule {
    /// Every document containing the term. Updates by term are atomic.
    Term(Term),
    /// Every document matching the query.
    Query(Query),
}

impl DeleteRule {
    /// Whether `doc` is selected by this rule.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            DeleteRule::Term(term) => doc.contains_term(term),
            DeleteRule::Query(query) => query.matches(doc),
        }
    }
}
