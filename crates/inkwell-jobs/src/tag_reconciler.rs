//! Resolves suggested tag names to canonical tags and links them to pages.
//!
//! The tag table is the one place several pages write concurrently. Each
//! name is resolved with insert-or-ignore followed by a read, so two
//! processors suggesting the same tag at once both end up with the single
//! row the unique constraint let through.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use inkwell_core::defaults::TAG_RESOLVE_MAX_ATTEMPTS;
use inkwell_core::{normalize_tag_name, normalize_tag_names, Error, Result, Tag, TagRepository};

pub struct TagReconciler {
    tags: Arc<dyn TagRepository>,
    max_attempts: u32,
}

impl TagReconciler {
    pub fn new(tags: Arc<dyn TagRepository>) -> Self {
        Self {
            tags,
            max_attempts: TAG_RESOLVE_MAX_ATTEMPTS,
        }
    }

    /// Override the insert-or-read round limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Resolve a raw name to its canonical tag, creating it if needed.
    ///
    /// Fails with `InvalidInput` when nothing is left after normalization and
    /// with `Conflict` when the row keeps disappearing between insert and read.
    pub async fn resolve(&self, raw: &str) -> Result<Tag> {
        let name = normalize_tag_name(raw)
            .ok_or_else(|| Error::InvalidInput(format!("Tag name {:?} is empty", raw)))?;

        for attempt in 1..=self.max_attempts {
            if let Some(tag) = self.tags.insert_or_ignore(&name).await? {
                debug!(tag = %tag.name, tag_id = %tag.id, "Created tag");
                return Ok(tag);
            }
            if let Some(tag) = self.tags.find_by_name(&name).await? {
                return Ok(tag);
            }
            debug!(tag = %name, attempt, "Tag vanished between insert and read, retrying");
        }

        Err(Error::Conflict(format!(
            "Could not resolve tag {:?} after {} attempts",
            name, self.max_attempts
        )))
    }

    /// Resolve every suggested name and link the tags to `page_id`.
    ///
    /// Names are normalized and deduplicated first; names that normalize to
    /// nothing are skipped. Existing links are left alone, so replaying this
    /// for the same page adds nothing.
    pub async fn reconcile(&self, page_id: Uuid, suggested: &[String]) -> Result<Vec<Tag>> {
        let names = normalize_tag_names(suggested);
        let mut linked = Vec::with_capacity(names.len());

        for name in names {
            let tag = self.resolve(&name).await?;
            let created = self.tags.link(page_id, tag.id).await?;
            debug!(page_id = %page_id, tag = %tag.name, created, "Linked tag");
            linked.push(tag);
        }

        Ok(linked)
    }
}
