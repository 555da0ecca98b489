//! Maps a processed document onto the public [`ParseResult`] shape.

use crate::processor::{
    BoundingBox, CoordOrigin, DocElement, ElementBody, ElementKind, PageInfo, ProcessedDocument,
};
use crate::schema::{DocObject, ObjectType, PageElement, PageView, ParseResult, Rect};

impl From<ElementKind> for ObjectType {
    fn from(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Table => ObjectType::Table,
            ElementKind::Image => ObjectType::Image,
            ElementKind::Text => ObjectType::Text,
            ElementKind::Other => ObjectType::Other,
        }
    }
}

/// Build the response for one document. Objects keep the processor's order.
pub fn map_document(filename: &str, doc: ProcessedDocument) -> ParseResult {
    let objects: Vec<DocObject> = doc.elements.iter().map(to_object).collect();

    let text = match doc.text {
        Some(text) if !text.trim().is_empty() => text,
        _ => fallback_text(&objects),
    };

    let pages: Vec<PageView> = doc
        .pages
        .iter()
        .map(|page| page_view(page, &doc.elements))
        .collect();

    ParseResult {
        filename: filename.to_string(),
        text,
        objects,
        num_pages: pages.len(),
        pages,
    }
}

fn to_object(element: &DocElement) -> DocObject {
    let image_base64 = match &element.body {
        ElementBody::Image { png_base64, .. } => png_base64.clone(),
        _ => None,
    };
    DocObject {
        kind: element.kind().into(),
        page: element.page(),
        bbox: element.bbox().map(rect),
        text: element.text().to_string(),
        label: element.label.clone(),
        image_base64,
    }
}

/// Reorder corners so `x0 <= x1`, `y0 <= y1`, rounded to one decimal.
fn rect(bbox: &BoundingBox) -> Rect {
    Rect {
        x0: round_to(bbox.left.min(bbox.right), 1),
        y0: round_to(bbox.top.min(bbox.bottom), 1),
        x1: round_to(bbox.left.max(bbox.right), 1),
        y1: round_to(bbox.top.max(bbox.bottom), 1),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn fallback_text(objects: &[DocObject]) -> String {
    objects
        .iter()
        .filter(|o| matches!(o.kind, ObjectType::Text | ObjectType::Table))
        .map(|o| o.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn page_view(page: &PageInfo, elements: &[DocElement]) -> PageView {
    let elements = elements
        .iter()
        .enumerate()
        .filter(|(_, e)| e.page() == Some(page.page_no))
        .map(|(index, e)| PageElement {
            index,
            kind: e.kind().into(),
            bbox_norm: e.bbox().and_then(|b| normalized(b, page)),
        })
        .collect();

    PageView {
        page: page.page_no,
        width: page.width,
        height: page.height,
        image_base64: page.image_base64.clone(),
        elements,
    }
}

/// Box as fractions of the page with a top-left origin, for canvas overlays.
fn normalized(bbox: &BoundingBox, page: &PageInfo) -> Option<[f64; 4]> {
    if page.width <= 0.0 || page.height <= 0.0 {
        return None;
    }
    let (low, high) = (bbox.top.min(bbox.bottom), bbox.top.max(bbox.bottom));
    let (y0, y1) = match bbox.origin {
        CoordOrigin::TopLeft => (low, high),
        CoordOrigin::BottomLeft => (page.height - high, page.height - low),
    };
    Some([
        round_to(bbox.left.min(bbox.right) / page.width, 4),
        round_to(y0 / page.height, 4),
        round_to(bbox.left.max(bbox.right) / page.width, 4),
        round_to(y1 / page.height, 4),
    ])
}
