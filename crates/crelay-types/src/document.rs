//! Generic store documents and the typed codec on top of them.
//!
//! The document store only knows JSON objects carrying an `_id` key and a
//! `doc_type` discriminator. Several variants may share one key, told apart
//! by `doc_type`. Component logic never touches raw documents: it goes
//! through [`TypedDocument`], which decodes a variant into a concrete record
//! and rejects anything that fails validation with a [`FormatError`].
//!
//! | `doc_type` | Record | Key |
//! |------------|--------|-----|
//! | `event` | [`ActivityEvent`] | event id |
//! | `causality` | [`SubspaceCausality`] | subspace id |
//! | `user_stats` | [`UserStats`] | user id |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::FormatError;
use crate::event::{ActivityEvent, Tag};
use crate::records::{SubspaceCausality, UserStats};

/// Field holding the document key.
pub const ID_FIELD: &str = "_id";

/// Field holding the variant discriminator.
pub const TYPE_FIELD: &str = "doc_type";

/// Document variant discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocType {
    /// A raw activity event.
    Event,
    /// A subspace causality record.
    Causality,
    /// A user activity rollup.
    UserStats,
}

impl DocType {
    /// Every variant, in a stable order.
    pub const ALL: [Self; 3] = [Self::Event, Self::Causality, Self::UserStats];

    /// The discriminator string stored in `doc_type`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Causality => "causality",
            Self::UserStats => "user_stats",
        }
    }

    /// Parse a discriminator string.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl core::fmt::Display for DocType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keyed, discriminated JSON document as exchanged with the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    key: String,
    doc_type: DocType,
    body: Map<String, Value>,
}

impl Document {
    /// Assemble a document. Any `_id` or `doc_type` in `body` is replaced.
    pub fn new(key: impl Into<String>, doc_type: DocType, mut body: Map<String, Value>) -> Self {
        body.remove(ID_FIELD);
        body.remove(TYPE_FIELD);
        Self {
            key: key.into(),
            doc_type,
            body,
        }
    }

    /// The document key (`_id`).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The variant discriminator.
    pub const fn doc_type(&self) -> DocType {
        self.doc_type
    }

    /// Fields other than `_id` and `doc_type`.
    pub const fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Look up a body field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// Split into key, discriminator, and body.
    pub fn into_parts(self) -> (String, DocType, Map<String, Value>) {
        (self.key, self.doc_type, self.body)
    }

    /// The full JSON object, `_id` and `doc_type` included.
    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(self.body.len().saturating_add(2));
        object.insert(ID_FIELD.to_owned(), Value::String(self.key.clone()));
        object.insert(
            TYPE_FIELD.to_owned(),
            Value::String(self.doc_type.as_str().to_owned()),
        );
        object.extend(self.body.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(object)
    }

    /// Validate a raw JSON value as a document.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidDocument`] unless `value` is an object
    /// with a non-empty string `_id` and a known `doc_type`.
    pub fn from_value(value: Value) -> Result<Self, FormatError> {
        let Value::Object(mut body) = value else {
            return Err(FormatError::document("<unknown>", "not a JSON object"));
        };
        let key = match body.remove(ID_FIELD) {
            Some(Value::String(key)) if !key.is_empty() => key,
            _ => return Err(FormatError::document("<unknown>", "missing string _id")),
        };
        let doc_type = match body.remove(TYPE_FIELD) {
            Some(Value::String(t)) => DocType::parse(&t)
                .ok_or_else(|| FormatError::document(&key, format!("unknown doc_type {t}")))?,
            _ => return Err(FormatError::document(&key, "missing string doc_type")),
        };
        Ok(Self { key, doc_type, body })
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// A record with a fixed document representation.
pub trait TypedDocument: Sized {
    /// Discriminator of this record's variant.
    const DOC_TYPE: DocType;

    /// Key the record is stored under.
    fn key(&self) -> &str;

    /// Encode into a store document.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidDocument`] if the record cannot be
    /// represented as a JSON object.
    fn to_document(&self) -> Result<Document, FormatError>;

    /// Decode and validate a store document.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidDocument`] if the variant is wrong or
    /// required fields are missing or malformed.
    fn from_document(doc: Document) -> Result<Self, FormatError>;
}

fn encode_body<T: Serialize>(key: &str, record: &T) -> Result<Map<String, Value>, FormatError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(body)) => Ok(body),
        Ok(_) => Err(FormatError::document(key, "record did not encode as an object")),
        Err(e) => Err(FormatError::document(key, e)),
    }
}

fn decode_body<T: DeserializeOwned, R: TypedDocument>(
    doc: Document,
) -> Result<(String, T), FormatError> {
    let (key, doc_type, body) = doc.into_parts();
    if doc_type != R::DOC_TYPE {
        return Err(FormatError::document(
            &key,
            format!("expected doc_type {}, found {doc_type}", R::DOC_TYPE),
        ));
    }
    let record = serde_json::from_value(Value::Object(body))
        .map_err(|e| FormatError::document(&key, e))?;
    Ok((key, record))
}

// ---------------------------------------------------------------------------
// Event documents
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EventBodyRef<'a> {
    pubkey: &'a str,
    created_at: i64,
    kind: u32,
    content: &'a str,
    tags: &'a [Tag],
    sig: &'a str,
}

#[derive(Deserialize)]
struct EventBody {
    pubkey: String,
    created_at: i64,
    kind: u32,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    sig: String,
}

impl TypedDocument for ActivityEvent {
    const DOC_TYPE: DocType = DocType::Event;

    fn key(&self) -> &str {
        &self.id
    }

    fn to_document(&self) -> Result<Document, FormatError> {
        let body = encode_body(
            &self.id,
            &EventBodyRef {
                pubkey: &self.pubkey,
                created_at: self.created_at,
                kind: self.kind,
                content: &self.content,
                tags: &self.tags,
                sig: &self.sig,
            },
        )?;
        Ok(Document::new(self.id.clone(), Self::DOC_TYPE, body))
    }

    fn from_document(doc: Document) -> Result<Self, FormatError> {
        let (id, body) = decode_body::<EventBody, Self>(doc)?;
        let event = Self {
            id,
            pubkey: body.pubkey,
            created_at: body.created_at,
            kind: body.kind,
            content: body.content,
            tags: body.tags,
            sig: body.sig,
        };
        event.validate().map_err(|e| FormatError::document(&event.id, e))?;
        Ok(event)
    }
}

impl TypedDocument for SubspaceCausality {
    const DOC_TYPE: DocType = DocType::Causality;

    fn key(&self) -> &str {
        self.subspace_id.as_str()
    }

    fn to_document(&self) -> Result<Document, FormatError> {
        let body = encode_body(self.key(), self)?;
        Ok(Document::new(self.key(), Self::DOC_TYPE, body))
    }

    fn from_document(doc: Document) -> Result<Self, FormatError> {
        let (key, record) = decode_body::<Self, Self>(doc)?;
        if record.subspace_id.as_str() != key {
            return Err(FormatError::document(
                &key,
                format!("subspace_id {} does not match key", record.subspace_id),
            ));
        }
        Ok(record)
    }
}

impl TypedDocument for UserStats {
    const DOC_TYPE: DocType = DocType::UserStats;

    fn key(&self) -> &str {
        &self.user_id
    }

    fn to_document(&self) -> Result<Document, FormatError> {
        let body = encode_body(&self.user_id, self)?;
        Ok(Document::new(self.user_id.clone(), Self::DOC_TYPE, body))
    }

    fn from_document(doc: Document) -> Result<Self, FormatError> {
        let (key, mut record) = decode_body::<Self, Self>(doc)?;
        record.user_id = key;
        Ok(record)
    }
}
