//! In-process processor built on lopdf.
//!
//! Reads only what the PDF already encodes: page text and the image XObjects
//! painted on each page. No OCR, no layout analysis.

use super::{
    BoundingBox, CoordOrigin, DocElement, DocumentProcessor, ElementBody, PageInfo, PdfInput,
    ProcessedDocument, Provenance,
};
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::io::Cursor;
use tracing::{debug, info, warn};

pub struct LopdfProcessor;

#[async_trait::async_trait]
impl DocumentProcessor for LopdfProcessor {
    fn name(&self) -> &str {
        "lopdf"
    }

    async fn process(&self, input: PdfInput) -> anyhow::Result<ProcessedDocument> {
        info!(
            "LopdfProcessor: extracting {} ({} bytes)",
            input.filename,
            input.data.len()
        );
        tokio::task::spawn_blocking(move || extract(&input.data))
            .await
            .context("lopdf extraction task failed")?
    }
}

/// Extract text blocks and placed images, page by page.
fn extract(data: &[u8]) -> anyhow::Result<ProcessedDocument> {
    let doc = Document::load_from(Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    let mut full_text = String::new();
    let mut elements = Vec::new();
    let mut pages = Vec::new();

    for (page_num, page_id) in doc.get_pages() {
        let (width, height) = page_size(&doc, page_id).unwrap_or((0.0, 0.0));
        pages.push(PageInfo {
            page_no: page_num,
            width,
            height,
            image_base64: None,
        });

        match doc.extract_text(&[page_num]) {
            Ok(content) => {
                for block in text_blocks(&content) {
                    elements.push(DocElement {
                        label: Some("paragraph".to_string()),
                        provenance: Provenance {
                            page: Some(page_num),
                            bbox: None,
                        },
                        body: ElementBody::Text { text: block },
                    });
                }
                full_text.push_str(&content);
                full_text.push('\n');
            }
            Err(e) => warn!("LopdfProcessor: no text on page {}: {}", page_num, e),
        }

        for placed in placed_images(&doc, page_id) {
            elements.push(DocElement {
                label: Some("picture".to_string()),
                provenance: Provenance {
                    page: Some(page_num),
                    bbox: Some(placed.bbox),
                },
                body: ElementBody::Image {
                    caption: String::new(),
                    png_base64: encode_png(placed.stream),
                },
            });
        }
    }

    debug!(
        "LopdfProcessor: {} pages, {} elements",
        pages.len(),
        elements.len()
    );

    Ok(ProcessedDocument {
        text: Some(full_text),
        elements,
        pages,
    })
}

/// Group extracted lines into blocks separated by blank lines.
fn text_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current.join("\n"));
    }
    blocks
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Page width and height from the (possibly inherited) MediaBox.
fn page_size(doc: &Document, page_id: ObjectId) -> Option<(f64, f64)> {
    let mut dict = doc.get_dictionary(page_id).ok()?;
    // Inheritance chains are short; the bound guards against Parent loops.
    for _ in 0..32 {
        if let Ok(media_box) = dict.get(b"MediaBox") {
            let values = resolve(doc, media_box)?.as_array().ok()?;
            let coords: Vec<f64> = values
                .iter()
                .filter_map(|v| resolve(doc, v).and_then(number))
                .collect();
            if coords.len() != 4 {
                return None;
            }
            return Some(((coords[2] - coords[0]).abs(), (coords[3] - coords[1]).abs()));
        }
        let parent = dict.get(b"Parent").ok()?.as_reference().ok()?;
        dict = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// Affine matrix `[a b c d e f]` as used by the `cm` operator.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f64; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    /// `self × other`: apply `self` first, then `other`.
    fn then(&self, other: &Matrix) -> Matrix {
        let [a1, b1, c1, d1, e1, f1] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Matrix([
            a1 * a2 + b1 * c2,
            a1 * b2 + b1 * d2,
            c1 * a2 + d1 * c2,
            c1 * b2 + d1 * d2,
            e1 * a2 + f1 * c2 + e2,
            e1 * b2 + f1 * d2 + f2,
        ])
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + c * y + e, b * x + d * y + f)
    }

    /// Image space is the unit square; its image under the matrix is the
    /// painted area.
    fn unit_square_bbox(&self) -> BoundingBox {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(1.0, 0.0),
            self.apply(0.0, 1.0),
            self.apply(1.0, 1.0),
        ];
        let xs = corners.iter().map(|c| c.0);
        let ys = corners.iter().map(|c| c.1);
        BoundingBox {
            left: xs.clone().fold(f64::INFINITY, f64::min),
            right: xs.fold(f64::NEG_INFINITY, f64::max),
            bottom: ys.clone().fold(f64::INFINITY, f64::min),
            top: ys.fold(f64::NEG_INFINITY, f64::max),
            origin: CoordOrigin::BottomLeft,
        }
    }
}

struct PlacedImage<'a> {
    stream: &'a Stream,
    bbox: BoundingBox,
}

/// Nesting limit for Form XObjects; also stops self-referencing forms.
const MAX_FORM_DEPTH: usize = 8;

/// Walk the page content, tracking the graphics state stack, and record each
/// image XObject painted with `Do`, including those inside Form XObjects.
fn placed_images(doc: &Document, page_id: ObjectId) -> Vec<PlacedImage<'_>> {
    let content = match doc.get_and_decode_page_content(page_id) {
        Ok(content) => content,
        Err(e) => {
            warn!("LopdfProcessor: unreadable content stream: {}", e);
            return Vec::new();
        }
    };

    let (direct, inherited) = doc.get_page_resources(page_id);
    let resources: Vec<&Dictionary> = direct
        .into_iter()
        .chain(inherited.into_iter().filter_map(|id| doc.get_dictionary(id).ok()))
        .collect();

    let mut placed = Vec::new();
    paint(doc, &content.operations, &resources, Matrix::IDENTITY, 0, &mut placed);
    placed
}

fn paint<'a>(
    doc: &'a Document,
    operations: &[Operation],
    resources: &[&'a Dictionary],
    base: Matrix,
    depth: usize,
    placed: &mut Vec<PlacedImage<'a>>,
) {
    let mut ctm = base;
    let mut stack = Vec::new();

    for op in operations {
        match op.operator.as_str() {
            "q" => stack.push(ctm),
            "Q" => ctm = stack.pop().unwrap_or(base),
            "cm" => {
                if let Some(m) = matrix(&op.operands) {
                    ctm = m.then(&ctm);
                }
            }
            "Do" => {
                let Some(name) = op.operands.first().and_then(|o| o.as_name().ok()) else {
                    continue;
                };
                let Some(stream) = find_xobject(doc, resources, name) else {
                    continue;
                };
                match stream.dict.get(b"Subtype").and_then(Object::as_name) {
                    Ok(b"Image") => placed.push(PlacedImage {
                        stream,
                        bbox: ctm.unit_square_bbox(),
                    }),
                    Ok(b"Form") if depth < MAX_FORM_DEPTH => {
                        paint_form(doc, stream, resources, ctm, depth, placed)
                    }
                    Ok(b"Form") => debug!("LopdfProcessor: form nesting too deep, skipping"),
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// Forms paint in their own space (`/Matrix` then the current CTM) and fall
/// back to the enclosing resources when they carry none of their own.
fn paint_form<'a>(
    doc: &'a Document,
    form: &'a Stream,
    outer: &[&'a Dictionary],
    ctm: Matrix,
    depth: usize,
    placed: &mut Vec<PlacedImage<'a>>,
) {
    let bytes = if form.dict.has(b"Filter") {
        match form.decompressed_content() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("LopdfProcessor: unreadable form stream: {}", e);
                return;
            }
        }
    } else {
        form.content.clone()
    };
    let content = match Content::decode(&bytes) {
        Ok(content) => content,
        Err(e) => {
            warn!("LopdfProcessor: undecodable form content: {}", e);
            return;
        }
    };

    let form_matrix = form
        .dict
        .get(b"Matrix")
        .ok()
        .and_then(|m| resolve(doc, m))
        .and_then(|m| m.as_array().ok())
        .and_then(|values| matrix(values))
        .unwrap_or(Matrix::IDENTITY);

    let mut resources: Vec<&Dictionary> = form
        .dict
        .get(b"Resources")
        .ok()
        .and_then(|r| resolve(doc, r))
        .and_then(|r| r.as_dict().ok())
        .into_iter()
        .collect();
    resources.extend_from_slice(outer);

    paint(
        doc,
        &content.operations,
        &resources,
        form_matrix.then(&ctm),
        depth + 1,
        placed,
    );
}

fn matrix(operands: &[Object]) -> Option<Matrix> {
    let values: Vec<f64> = operands.iter().filter_map(number).collect();
    <[f64; 6]>::try_from(values).ok().map(Matrix)
}

fn find_xobject<'a>(
    doc: &'a Document,
    resources: &[&'a Dictionary],
    name: &[u8],
) -> Option<&'a Stream> {
    for &resources in resources {
        let Some(xobjects) = xobject_dict(doc, resources) else {
            continue;
        };
        let Ok(entry) = xobjects.get(name) else {
            continue;
        };
        return resolve(doc, entry)?.as_stream().ok();
    }
    None
}

fn xobject_dict<'a>(doc: &'a Document, resources: &'a Dictionary) -> Option<&'a Dictionary> {
    let entry = resources.get(b"XObject").ok()?;
    resolve(doc, entry)?.as_dict().ok()
}

/// Re-encode an image XObject as base64 PNG. Supports JPEG and 8-bit
/// gray/RGB samples (raw or Flate); anything else yields `None`.
fn encode_png(stream: &Stream) -> Option<String> {
    let filters: Vec<&[u8]> = match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.as_slice()],
        Ok(Object::Array(names)) => names.iter().filter_map(|n| n.as_name().ok()).collect(),
        _ => Vec::new(),
    };

    let image = match filters.last().copied() {
        Some(b"DCTDecode") => {
            image::load_from_memory_with_format(&stream.content, image::ImageFormat::Jpeg).ok()?
        }
        None => raw_image(stream, stream.content.clone())?,
        Some(b"FlateDecode") if filters.len() == 1 => {
            raw_image(stream, stream.decompressed_content().ok()?)?
        }
        Some(other) => {
            debug!(
                "LopdfProcessor: skipping image with filter {}",
                String::from_utf8_lossy(other)
            );
            return None;
        }
    };

    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, image::ImageOutputFormat::Png).ok()?;
    Some(BASE64.encode(png.into_inner()))
}

fn raw_image(stream: &Stream, samples: Vec<u8>) -> Option<image::DynamicImage> {
    let dict = &stream.dict;
    let width = u32::try_from(dict.get(b"Width").ok()?.as_i64().ok()?).ok()?;
    let height = u32::try_from(dict.get(b"Height").ok()?.as_i64().ok()?).ok()?;
    let bits = dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(|b| b.as_i64().ok())
        .unwrap_or(8);
    if bits != 8 {
        return None;
    }

    match dict.get(b"ColorSpace").ok()?.as_name().ok()? {
        b"DeviceGray" => image::GrayImage::from_raw(width, height, samples)
            .map(image::DynamicImage::ImageLuma8),
        b"DeviceRGB" => {
            image::RgbImage::from_raw(width, height, samples).map(image::DynamicImage::ImageRgb8)
        }
        _ => None,
    }
}
