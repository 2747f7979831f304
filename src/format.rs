//! Chat rendering of annotation results
//!
//! Likelihood values become fixed-width bars so that rows line up in a
//! monospace block:
//!
//! ```text
//! ======= SFW =======
//!         [+____]: adult
//!         [++___]: violence
//! ```

use crate::vision::AnnotateImageResponse;
use serde_json::{Map, Value};

/// Header of the per-face section
pub const FACES_HEADER: &str = "======= FACES =======";
/// Header of the safe-search section
pub const SFW_HEADER: &str = "======= SFW =======";
/// Header of the label section
pub const TAGS_HEADER: &str = "======= TAGS =======";

const BAR_WIDTH: usize = 15;
const LIKELIHOOD_SUFFIX: &str = "Likelihood";

/// Coarse confidence bucket reported by the Vision API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Likelihood {
    /// No judgment (also used for unrecognized values)
    #[default]
    Unknown,
    /// `VERY_UNLIKELY`
    VeryUnlikely,
    /// `UNLIKELY`
    Unlikely,
    /// `POSSIBLE`
    Possible,
    /// `LIKELY`
    Likely,
    /// `VERY_LIKELY`
    VeryLikely,
}

impl Likelihood {
    /// Parse the API enum name; anything unrecognized is [`Likelihood::Unknown`]
    #[must_use]
    pub fn from_api(value: &str) -> Self {
        match value {
            "VERY_UNLIKELY" => Self::VeryUnlikely,
            "UNLIKELY" => Self::Unlikely,
            "POSSIBLE" => Self::Possible,
            "LIKELY" => Self::Likely,
            "VERY_LIKELY" => Self::VeryLikely,
            _ => Self::Unknown,
        }
    }

    /// Interpret a raw JSON value; non-strings are [`Likelihood::Unknown`]
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        value.as_str().map_or(Self::Unknown, Self::from_api)
    }

    /// Fixed-width bar shown in chat
    #[must_use]
    pub const fn bar(self) -> &'static str {
        match self {
            Self::Unknown => "[__?__]",
            Self::VeryUnlikely => "[+____]",
            Self::Unlikely => "[++___]",
            Self::Possible => "[+++__]",
            Self::Likely => "[++++_]",
            Self::VeryLikely => "[+++++]",
        }
    }
}

/// Ordered `(label, bar)` pairs
pub type FormattedRows = Vec<(String, &'static str)>;

/// Every safe-search category, sorted by name, with its bar
#[must_use]
pub fn format_safe_search(annotations: &Map<String, Value>) -> FormattedRows {
    let mut rows: FormattedRows = annotations
        .iter()
        .map(|(key, value)| (key.clone(), Likelihood::from_json(value).bar()))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

/// The `*Likelihood` fields of a face, suffix stripped, sorted by the
/// stripped name
#[must_use]
pub fn format_face(annotations: &Map<String, Value>) -> FormattedRows {
    let mut rows: FormattedRows = annotations
        .iter()
        .filter(|(key, _)| key.contains(LIKELIHOOD_SUFFIX))
        .map(|(key, value)| {
            (
                key.replace(LIKELIHOOD_SUFFIX, ""),
                Likelihood::from_json(value).bar(),
            )
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

/// One right-aligned `bar: label` line
#[must_use]
pub fn format_row(bar: &str, label: &str) -> String {
    format!("{bar:>BAR_WIDTH$}: {label}")
}

/// Full reply body for an annotated image
///
/// The FACES section only appears when faces were detected. Missing
/// safe-search or label data yields an empty section.
#[must_use]
pub fn render_report(response: &AnnotateImageResponse) -> Vec<String> {
    let mut lines = Vec::new();

    if let Some(faces) = response.face_annotations.as_ref().filter(|f| !f.is_empty()) {
        lines.push(FACES_HEADER.to_string());
        for (i, face) in faces.iter().enumerate() {
            lines.push(format!("FACE #{i}:"));
            lines.extend(
                format_face(face)
                    .iter()
                    .map(|(label, bar)| format_row(bar, label)),
            );
            lines.push(String::new());
        }
    }

    lines.push(SFW_HEADER.to_string());
    if let Some(safe_search) = &response.safe_search_annotation {
        lines.extend(
            format_safe_search(safe_search)
                .iter()
                .map(|(label, bar)| format_row(bar, label)),
        );
    }
    lines.push(String::new());

    lines.push(TAGS_HEADER.to_string());
    let tags: Vec<&str> = response
        .label_annotations
        .iter()
        .flatten()
        .map(|label| label.description.as_str())
        .collect();
    lines.push(tags.join(", "));

    lines
}
