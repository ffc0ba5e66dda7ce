//! Typed access to the document store.
//!
//! Component logic only ever sees concrete records. Fetches pick the
//! variant matching the record's discriminator and decode it, failing with a
//! format error if the stored document is invalid. Scans decode lazily and
//! skip (with a warning) anything that does not validate, so one corrupt
//! document cannot hide the rest of a collection.

use crelay_db::{DocumentStore, next_or_cancelled};
use crelay_types::TypedDocument;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Fail fast if `cancel` has already fired.
pub(crate) fn check(cancel: &CancellationToken) -> Result<(), RelayError> {
    if cancel.is_cancelled() {
        Err(RelayError::Cancelled)
    } else {
        Ok(())
    }
}

/// Fetch and decode the `T` variant stored at `key`.
pub(crate) async fn fetch<T: TypedDocument>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>, RelayError> {
    let variants = store.get(key).await?;
    let Some(doc) = variants
        .into_iter()
        .find(|doc| doc.doc_type() == T::DOC_TYPE)
    else {
        return Ok(None);
    };
    Ok(Some(T::from_document(doc)?))
}

/// Encode and write `record`, replacing its previous version.
pub(crate) async fn persist<T: TypedDocument>(
    store: &dyn DocumentStore,
    record: &T,
) -> Result<(), RelayError> {
    store.put(record.to_document()?).await?;
    Ok(())
}

/// Scan every `T`, decoding lazily, and collect those accepted by
/// `predicate`.
pub(crate) async fn collect<T, P>(
    store: &dyn DocumentStore,
    mut predicate: P,
    cancel: &CancellationToken,
) -> Result<Vec<T>, RelayError>
where
    T: TypedDocument,
    P: FnMut(&T) -> bool,
{
    let doc_type = T::DOC_TYPE;
    let mut scan = store.scan(doc_type);
    let mut matched = Vec::new();
    while let Some(doc) = next_or_cancelled(&mut scan, cancel).await? {
        let key = doc.key().to_owned();
        match T::from_document(doc) {
            Ok(record) if predicate(&record) => matched.push(record),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key, %doc_type, error = %e, "Skipping invalid document");
            }
        }
    }
    Ok(matched)
}
