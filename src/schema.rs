//! Public response types for `POST /parse`.

use serde::Serialize;

/// Result of parsing one uploaded PDF.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseResult {
    pub filename: String,
    pub text: String,
    pub objects: Vec<DocObject>,
    pub pages: Vec<PageView>,
    pub num_pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Table,
    Image,
    Text,
    Other,
}

/// One structural element of the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocObject {
    #[serde(rename = "type")]
    pub kind: ObjectType,
    /// 1-indexed page number.
    pub page: Option<u32>,
    /// Omitted when the processor reports no box for the element.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Rect>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
}

/// Axis-aligned rectangle in page coordinates with `x0 <= x1` and `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// Per-page view used by the UI to draw bbox overlays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageView {
    pub page: u32,
    pub width: f64,
    pub height: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    pub elements: Vec<PageElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageElement {
    /// Index into [`ParseResult::objects`].
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: ObjectType,
    /// `[x0, y0, x1, y1]` in 0..1 with a top-left origin.
    pub bbox_norm: Option<[f64; 4]>,
}
