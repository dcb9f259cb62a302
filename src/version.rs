//! Dotted-numeric version comparison
//!
//! Peers announce their library version as a string like `1.2.0`. Components
//! are compared numerically, so `1.10` is newer than `1.6`. When every shared
//! component is equal, the version with more components wins: `1.2` < `1.2.0`.

use std::cmp::Ordering;

use thiserror::Error;

/// Errors from version parsing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version component {component:?} in {version:?}")]
    InvalidComponent { version: String, component: String },
}

/// Compare two dotted version strings.
pub fn compare(a: &str, b: &str) -> Result<Ordering, VersionError> {
    let a = components(a)?;
    let b = components(b)?;

    for (x, y) in a.iter().zip(&b) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }

    Ok(a.len().cmp(&b.len()))
}

fn components(version: &str) -> Result<Vec<u64>, VersionError> {
    version
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| VersionError::InvalidComponent {
                    version: version.to_string(),
                    component: part.to_string(),
                })
        })
        .collect()
}
