//! Content collaborators: fetch, translate, transform and build documents.
//!
//! The worker turns a job into engine documents in four stages:
//!
//! 1. a [`ContentFetcher`] resolves the job's content id into [`Content`],
//! 2. a [`ContentTranslator`] chosen by media type turns the body into an
//!    intermediate text form,
//! 3. an optional [`ContentTransformer`] rewrites that text,
//! 4. a [`DocumentBuilder`] parses the result into [`Document`]s.
//!
//! Each stage reports failures with its own error variant so a job's error
//! message says where it broke.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;

use crate::document::{DeleteRule, Document, Term};
use crate::error::{HoplonError, Result};
use crate::job::Job;

/// Field stamped on every built document with the id of its content.
pub const CONTENT_ID_FIELD: &str = "_content";

/// Media type handled by [`JsonTranslator`].
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// A piece of source content resolved for a job.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Content {
    pub id: String,
    pub media_type: String,
    pub body: String,
    /// The content no longer exists; its documents should be removed.
    pub deleted: bool,
    /// Rule selecting the documents this content replaces. Defaults to every
    /// document carrying the content id.
    pub delete_rule: Option<DeleteRule>,
    /// Fields set on every built document, replacing same-named fields.
    pub fields: BTreeMap<String, String>,
}

impl Content {
    pub fn new<I: Into<String>, M: Into<String>, B: Into<String>>(id: I, media_type: M, body: B) -> Self {
        Content {
            id: id.into(),
            media_type: media_type.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Content that was removed at the source.
    pub fn deleted<I: Into<String>>(id: I) -> Self {
        Content {
            id: id.into(),
            deleted: true,
            ..Default::default()
        }
    }

    pub fn with_field<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = Some(rule);
        self
    }

    /// The rule that selects this content's documents.
    pub fn delete_rule(&self) -> DeleteRule {
        self.delete_rule
            .clone()
            .unwrap_or_else(|| DeleteRule::Term(Term::new(CONTENT_ID_FIELD, self.id.clone())))
    }
}

/// Resolves the content a job refers to.
pub trait ContentFetcher: Send + Sync {
    fn fetch(&self, job: &Job) -> Result<Content>;
}

/// Turns a content body into the intermediate text form.
pub trait ContentTranslator: Send + Sync {
    fn translate(&self, content: &Content, params: &BTreeMap<String, String>) -> Result<String>;
}

/// Rewrites the intermediate text form before documents are built.
pub trait ContentTransformer: Send + Sync {
    fn transform(&self, source: String, params: &BTreeMap<String, String>) -> Result<String>;
}

/// Parses the intermediate text form into engine documents.
pub trait DocumentBuilder: Send + Sync {
    fn build(&self, source: &str) -> Result<Vec<Document>>;
}

/// Passes JSON bodies through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTranslator;

impl ContentTranslator for JsonTranslator {
    fn translate(&self, content: &Content, _params: &BTreeMap<String, String>) -> Result<String> {
        Ok(content.body.clone())
    }
}

/// Builds documents from a JSON object or an array of objects.
///
/// Strings, numbers and booleans become single values; arrays of them
/// become multi-valued fields. Nulls are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDocumentBuilder;

impl JsonDocumentBuilder {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn object_to_document(value: &Value) -> Result<Document> {
        let Value::Object(map) = value else {
            return Err(HoplonError::build(format!(
                "expected a JSON object, found {value}"
            )));
        };

        let mut doc = Document::new();
        for (name, value) in map {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        let v = Self::scalar(item).ok_or_else(|| {
                            HoplonError::build(format!("field {name} holds a nested value"))
                        })?;
                        doc.add_field(name.as_str(), v);
                    }
                }
                other => {
                    let v = Self::scalar(other).ok_or_else(|| {
                        HoplonError::build(format!("field {name} holds a nested object"))
                    })?;
                    doc.add_field(name.as_str(), v);
                }
            }
        }
        Ok(doc)
    }
}

impl DocumentBuilder for JsonDocumentBuilder {
    fn build(&self, source: &str) -> Result<Vec<Document>> {
        let value: Value = serde_json::from_str(source)
            .map_err(|e| HoplonError::build(format!("invalid JSON: {e}")))?;
        match &value {
            Value::Array(items) => items.iter().map(Self::object_to_document).collect(),
            Value::Object(_) => Ok(vec![Self::object_to_document(&value)?]),
            other => Err(HoplonError::build(format!(
                "expected a JSON object or array, found {other}"
            ))),
        }
    }
}

/// Serves content from memory. Handy for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryContentFetcher {
    contents: RwLock<AHashMap<String, Content>>,
}

impl MemoryContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, content: Content) {
        self.contents.write().insert(content.id.clone(), content);
    }

    /// Forget `id`. Later fetches report it as deleted.
    pub fn remove(&self, id: &str) -> Option<Content> {
        self.contents.write().remove(id)
    }
}

impl ContentFetcher for MemoryContentFetcher {
    fn fetch(&self, job: &Job) -> Result<Content> {
        let id = job
            .content_id()
            .ok_or_else(|| HoplonError::fetch(format!("{job} has no content id")))?;
        Ok(self
            .contents
            .read()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Content::deleted(id)))
    }
}

/// The four content stages wired together.
pub struct Pipeline {
    fetcher: Arc<dyn ContentFetcher>,
    translators: AHashMap<String, Arc<dyn ContentTranslator>>,
    default_translator: Option<Arc<dyn ContentTranslator>>,
    transformer: Option<Arc<dyn ContentTransformer>>,
    builder: Arc<dyn DocumentBuilder>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut media_types: Vec<&String> = self.translators.keys().collect();
        media_types.sort();
        f.debug_struct("Pipeline")
            .field("media_types", &media_types)
            .field("has_default_translator", &self.default_translator.is_some())
            .field("has_transformer", &self.transformer.is_some())
            .finish()
    }
}

/// Tag a stage failure with the stage's variant unless it already has one.
fn stage_error(stage: fn(String) -> HoplonError, error: HoplonError) -> HoplonError {
    match error {
        e @ (HoplonError::Fetch(_)
        | HoplonError::Translate(_)
        | HoplonError::Transform(_)
        | HoplonError::Build(_)) => e,
        other => stage(other.to_string()),
    }
}

impl Pipeline {
    /// A pipeline that reads JSON content and builds documents from it.
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        let mut translators: AHashMap<String, Arc<dyn ContentTranslator>> = AHashMap::new();
        translators.insert(JSON_MEDIA_TYPE.to_string(), Arc::new(JsonTranslator));
        Pipeline {
            fetcher,
            translators,
            default_translator: None,
            transformer: None,
            builder: Arc::new(JsonDocumentBuilder),
        }
    }

    pub fn with_translator<S: Into<String>>(
        mut self,
        media_type: S,
        translator: Arc<dyn ContentTranslator>,
    ) -> Self {
        self.translators.insert(media_type.into(), translator);
        self
    }

    /// Translator used when no media type matches.
    pub fn with_default_translator(mut self, translator: Arc<dyn ContentTranslator>) -> Self {
        self.default_translator = Some(translator);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn ContentTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_builder(mut self, builder: Arc<dyn DocumentBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn fetch(&self, job: &Job) -> Result<Content> {
        self.fetcher
            .fetch(job)
            .map_err(|e| stage_error(HoplonError::Fetch, e))
    }

    fn translator_for(&self, media_type: &str) -> Result<&Arc<dyn ContentTranslator>> {
        let base = media_type
            .split(';')
            .next()
            .unwrap_or(media_type)
            .trim()
            .to_ascii_lowercase();
        self.translators
            .get(&base)
            .or(self.default_translator.as_ref())
            .ok_or_else(|| HoplonError::translate(format!("no translator for media type {media_type:?}")))
    }

    /// Translate, transform and build the documents for `content`.
    ///
    /// Every document is stamped with the content id and the content's
    /// custom fields.
    pub fn content_to_documents(
        &self,
        content: &Content,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<Document>> {
        let translated = self
            .translator_for(&content.media_type)?
            .translate(content, params)
            .map_err(|e| stage_error(HoplonError::Translate, e))?;

        let transformed = match &self.transformer {
            Some(transformer) => transformer
                .transform(translated, params)
                .map_err(|e| stage_error(HoplonError::Transform, e))?,
            None => translated,
        };

        let mut docs = self
            .builder
            .build(&transformed)
            .map_err(|e| stage_error(HoplonError::Build, e))?;

        for doc in &mut docs {
            doc.set_field(CONTENT_ID_FIELD, vec![content.id.clone()]);
            for (name, value) in &content.fields {
                doc.set_field(name.as_str(), vec![value.clone()]);
            }
        }
        Ok(docs)
    }
}
