//! Content hashing used to detect changed releases.

use sha2::{Digest, Sha256};

use crate::ports::UpstreamRelease;

/// Hex SHA-256 over `body + tag + title + url`.
///
/// The tag is part of the digest but the comparison is always made against
/// rows of the same tag, so a re-published tag with edited notes or a new
/// title hashes differently and is recorded as a new release.
pub fn content_hash(body: &str, tag: &str, title: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(tag.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn release_hash(release: &UpstreamRelease) -> String {
    content_hash(&release.body, &release.tag, &release.title, &release.url)
}
