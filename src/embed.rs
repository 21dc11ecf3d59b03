use crate::materialize::{EmbeddedImage, ImageError, Materializer};
use crate::scan::{ImageReference, scan};
use log::{debug, info, warn};
use std::path::Path;

/// A reference that could not be embedded and was left as written
#[derive(Debug)]
pub struct Failure {
    pub locator: String,
    pub error: ImageError,
}

/// Rewritten document plus what happened to each reference
#[derive(Debug, Default)]
pub struct EmbedReport {
    pub text: String,
    pub embedded: usize,
    /// References excluded by the embed mode
    pub skipped: usize,
    pub failures: Vec<Failure>,
}

/// Scan `document` for image references and inline every one `materializer`
/// can resolve against `base_dir`.
pub fn embed_images(document: &str, base_dir: &Path, materializer: &Materializer) -> EmbedReport {
    let refs = scan(document);
    debug!("Found {} image reference(s)", refs.len());

    let report = splice(document, &refs, |r| materializer.materialize(r, base_dir));
    info!(
        "Embedded {} image(s), skipped {}, failed {}",
        report.embedded,
        report.skipped,
        report.failures.len()
    );
    report
}

/// Rebuild `document` with each reference replaced by its materialized form.
///
/// `refs` must be sorted by `start` and disjoint, as `scan` returns them. The
/// source is never mutated: untouched text between references is copied into a
/// fresh buffer, so variable-length replacements cannot shift later offsets.
/// A reference that fails or is skipped keeps its original text.
pub fn splice<F>(document: &str, refs: &[ImageReference], mut materialize: F) -> EmbedReport
where
    F: FnMut(&ImageReference) -> Result<Option<EmbeddedImage>, ImageError>,
{
    let mut report = EmbedReport {
        text: String::with_capacity(document.len()),
        ..Default::default()
    };
    let mut cursor = 0;

    for r in refs {
        if r.start < cursor || r.end > document.len() {
            warn!("Ignoring out-of-order reference at {}..{}", r.start, r.end);
            continue;
        }
        report.text.push_str(&document[cursor..r.start]);

        match materialize(r) {
            Ok(Some(img)) => {
                debug!("Embedding {:?} reference {} as {}", r.kind, r.locator, img.mime_type);
                report.text.push_str(&img.to_markdown(&r.alt));
                report.embedded += 1;
            }
            Ok(None) => {
                report.text.push_str(&r.raw);
                report.skipped += 1;
            }
            Err(error) => {
                warn!("{}", error);
                report.text.push_str(&r.raw);
                report.failures.push(Failure {
                    locator: r.locator.clone(),
                    error,
                });
            }
        }
        cursor = r.end;
    }

    report.text.push_str(&document[cursor..]);
    report
}
