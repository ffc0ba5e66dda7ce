//! Activity events and the tag conventions the indexer consumes.
//!
//! An [`ActivityEvent`] is the atomic input unit: author key, numeric kind,
//! ordered tags, content, and signature. Events are immutable once admitted;
//! the indexer never rewrites one, it only derives counters from it.

use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// Tag names read by the derived indexes.
pub mod tags {
    /// Subspace the event belongs to.
    pub const SUBSPACE: &str = "sid";
    /// Creation-only: comma-separated `name=keyId` operation pairs.
    pub const OPS: &str = "ops";
    /// Operation name carried by non-creation events.
    pub const OPERATION: &str = "op";
    /// Vote direction, `yes` or `no`.
    pub const VOTE: &str = "vote";
    /// User id of the member who issued the invitation being accepted.
    pub const INVITER: &str = "inviter";
}

/// A single tag: an ordered list of strings whose first element is its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    /// Build a tag from its parts, name first.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The tag value (second element).
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// All elements of the tag, name included.
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

/// A signed activity event as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Event id (hex digest chosen by the author's client).
    pub id: String,
    /// Author public key. Doubles as the user id for activity rollups.
    pub pubkey: String,
    /// Creation time in unix seconds.
    pub created_at: i64,
    /// Application-defined event kind.
    pub kind: u32,
    /// Free-form content.
    #[serde(default)]
    pub content: String,
    /// Ordered tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Signature over the event. Not verified here.
    #[serde(default)]
    pub sig: String,
}

impl ActivityEvent {
    /// Value of the first tag named `name` that carries a value.
    ///
    /// Names are compared exactly, matching how the derived indexes read
    /// their conventions (`sid`, `ops`, `op`, `vote`, `inviter`).
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|tag| tag.name() == Some(name))
            .find_map(Tag::value)
    }

    /// The raw `sid` tag value, unvalidated.
    pub fn subspace(&self) -> Option<&str> {
        self.tag_value(tags::SUBSPACE).filter(|sid| !sid.is_empty())
    }

    /// Check the fields every stored event must carry.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidEvent`] if the id or author is empty.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.id.is_empty() {
            return Err(FormatError::InvalidEvent("event id is empty".to_owned()));
        }
        if self.pubkey.is_empty() {
            return Err(FormatError::InvalidEvent(format!(
                "event {} has no author",
                self.id
            )));
        }
        Ok(())
    }
}

/// Reserved event kinds the derived indexes branch on.
///
/// These belong to the surrounding protocol, so they are configuration
/// rather than literals baked into the tracker or aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolKinds {
    /// Creates a subspace and registers its causality keys.
    pub subspace_create: u32,
    /// A user joins a subspace.
    pub subspace_join: u32,
    /// A vote cast inside a subspace.
    pub vote: u32,
    /// A user accepts an invitation into a subspace.
    pub invite_accept: u32,
}

impl Default for ProtocolKinds {
    fn default() -> Self {
        Self {
            subspace_create: 30100,
            subspace_join: 30200,
            vote: 30302,
            invite_accept: 30303,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(tags: Vec<Tag>) -> ActivityEvent {
        ActivityEvent {
            id: "e1".to_owned(),
            pubkey: "alice".to_owned(),
            created_at: 1_700_000_000,
            kind: 1,
            content: String::new(),
            tags,
            sig: String::new(),
        }
    }

    #[test]
    fn tag_value_returns_first_valued_match() {
        let ev = event(vec![
            Tag::new(["sid"]),
            Tag::new(["sid", "first"]),
            Tag::new(["sid", "second"]),
        ]);
        assert_eq!(ev.tag_value("sid"), Some("first"));
        assert_eq!(ev.tag_value("vote"), None);
    }

    #[test]
    fn tag_names_are_matched_exactly() {
        let ev = event(vec![Tag::new(["SID", "upper"])]);
        assert_eq!(ev.subspace(), None);
    }

    #[test]
    fn empty_subspace_tag_is_absent() {
        let ev = event(vec![Tag::new(["sid", ""])]);
        assert_eq!(ev.subspace(), None);
    }

    #[test]
    fn validate_requires_id_and_author() {
        assert!(event(vec![]).validate().is_ok());

        let mut no_id = event(vec![]);
        no_id.id.clear();
        assert!(matches!(no_id.validate(), Err(FormatError::InvalidEvent(_))));

        let mut no_author = event(vec![]);
        no_author.pubkey.clear();
        assert!(matches!(
            no_author.validate(),
            Err(FormatError::InvalidEvent(_))
        ));
    }

    #[test]
    fn deserializes_wire_json_with_missing_optional_fields() {
        let ev: ActivityEvent = serde_json::from_str(
            r#"{"id":"abc","pubkey":"pk","created_at":5,"kind":30302,"tags":[["sid","x"],["vote","yes"]]}"#,
        )
        .unwrap();
        assert_eq!(ev.kind, 30302);
        assert_eq!(ev.tag_value("vote"), Some("yes"));
        assert!(ev.content.is_empty());
        assert!(ev.sig.is_empty());
    }

    #[test]
    fn protocol_kinds_fill_missing_fields_from_defaults() {
        let kinds: ProtocolKinds = serde_json::from_str(r#"{"vote": 7}"#).unwrap();
        assert_eq!(kinds.vote, 7);
        assert_eq!(kinds.subspace_create, ProtocolKinds::default().subspace_create);
    }
}
