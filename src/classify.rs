//! Runtime classification of a working tree
//!
//! Classification looks only at marker files in the root of the tree. The
//! markers are checked in a fixed order and the first hit wins, so a
//! repository carrying both `package.json` and `main.py` is a Node app.

use crate::site::Classification;
use std::path::Path;
use tracing::debug;

/// Marker files in priority order
const MARKERS: &[(&str, Classification)] = &[
    ("package.json", Classification::Node),
    ("go.mod", Classification::Go),
    ("requirements.txt", Classification::Python),
    ("main.py", Classification::Python),
];

/// Classify the working tree at `work_dir`. Anything without a marker is static.
pub fn classify(work_dir: &Path) -> Classification {
    let classification = MARKERS
        .iter()
        .find(|(marker, _)| work_dir.join(marker).exists())
        .map(|(_, classification)| *classification)
        .unwrap_or(Classification::Static);

    debug!(path = %work_dir.display(), %classification, "Classified working tree");
    classification
}
