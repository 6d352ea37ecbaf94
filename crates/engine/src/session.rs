use versa_core::ids::VersionId;

use crate::overlay::TxOverlay;

/// A client's view of the engine: the active version, who is writing, and an
/// optional open transaction.
#[derive(Debug)]
pub struct Session {
    pub(crate) active_version: VersionId,
    pub(crate) author: String,
    pub(crate) tx: Option<TxOverlay>,
}

impl Session {
    pub(crate) fn new(active_version: VersionId, author: String) -> Self {
        Self {
            active_version,
            author,
            tx: None,
        }
    }

    pub fn active_version(&self) -> VersionId {
        self.active_version
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub fn overlay(&self) -> Option<&TxOverlay> {
        self.tx.as_ref()
    }
}
