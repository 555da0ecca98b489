//! Docling sidecar processor.
//!
//! Posts the PDF to a docling-serve instance and translates the returned
//! `DoclingDocument` JSON into a [`ProcessedDocument`].

use super::{
    data_uri_base64, BoundingBox, CoordOrigin, DocElement, DocumentProcessor, ElementBody,
    PageInfo, PdfInput, ProcessedDocument, Provenance,
};
use crate::config::DoclingConfig;
use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct DoclingProcessor {
    url: String,
    convert_path: String,
    do_ocr: bool,
    ocr_engine: String,
    ocr_langs: Vec<String>,
    include_images: bool,
    client: reqwest::Client,
}

impl DoclingProcessor {
    pub fn new(config: &DoclingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build Docling HTTP client")?;

        Ok(Self {
            url: config.url.clone(),
            convert_path: config.convert_path.clone(),
            do_ocr: config.do_ocr,
            ocr_engine: config.ocr_engine.clone(),
            ocr_langs: config.ocr_langs.clone(),
            include_images: config.include_images,
            client,
        })
    }

    fn form(&self, input: PdfInput) -> anyhow::Result<reqwest::multipart::Form> {
        use reqwest::multipart::{Form, Part};

        let part = Part::bytes(input.data)
            .file_name(input.filename)
            .mime_str("application/pdf")?;

        let mut form = Form::new()
            .part("files", part)
            .text("to_formats", "json")
            .text("to_formats", "text")
            .text("do_ocr", self.do_ocr.to_string())
            .text("ocr_engine", self.ocr_engine.clone())
            .text("include_images", self.include_images.to_string())
            .text("image_export_mode", "embedded");
        for lang in &self.ocr_langs {
            form = form.text("ocr_lang", lang.clone());
        }
        Ok(form)
    }
}

#[async_trait::async_trait]
impl DocumentProcessor for DoclingProcessor {
    fn name(&self) -> &str {
        "docling"
    }

    async fn ready(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.url))
            .send()
            .await
            .with_context(|| format!("Docling sidecar unreachable at {}", self.url))?;
        if !response.status().is_success() {
            anyhow::bail!("Docling sidecar health check failed ({})", response.status());
        }
        Ok(())
    }

    async fn process(&self, input: PdfInput) -> anyhow::Result<ProcessedDocument> {
        info!(
            "DoclingProcessor: converting {} ({} bytes)",
            input.filename,
            input.data.len()
        );
        let form = self.form(input)?;

        let response = self
            .client
            .post(format!("{}{}", self.url, self.convert_path))
            .multipart(form)
            .send()
            .await
            .context("Docling sidecar request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Docling sidecar error ({}): {}", status, error_text);
        }

        let converted: ConvertResponse = response
            .json()
            .await
            .context("Invalid Docling sidecar response")?;

        if converted.status != "success" {
            let messages: Vec<&str> = converted
                .errors
                .iter()
                .map(|e| e.error_message.as_str())
                .collect();
            anyhow::bail!(
                "Docling conversion status '{}': {}",
                converted.status,
                messages.join("; ")
            );
        }
        debug!(
            "DoclingProcessor: converted in {:.2}s",
            converted.processing_time
        );

        let document = converted
            .document
            .json_content
            .context("Docling response has no json_content")?;

        Ok(document.into_processed(converted.document.text_content))
    }
}

// ── docling-serve response types ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    document: ExportDocument,
    status: String,
    #[serde(default)]
    errors: Vec<ConversionError>,
    #[serde(default)]
    processing_time: f64,
}

#[derive(Debug, Deserialize)]
struct ExportDocument {
    #[serde(default)]
    json_content: Option<DoclingDocument>,
    #[serde(default)]
    text_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversionError {
    #[serde(default)]
    error_message: String,
}

// ── DoclingDocument ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DoclingDocument {
    body: NodeBase,
    groups: Vec<NodeBase>,
    texts: Vec<TextItem>,
    tables: Vec<TableItem>,
    pictures: Vec<PictureItem>,
    key_value_items: Vec<GraphItem>,
    form_items: Vec<GraphItem>,
    pages: BTreeMap<String, PageItem>,
}

#[derive(Debug, Deserialize)]
struct RefItem {
    #[serde(rename = "$ref")]
    cref: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeBase {
    children: Vec<RefItem>,
    label: Option<String>,
    prov: Vec<ProvenanceItem>,
    content_layer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProvenanceItem {
    page_no: Option<u32>,
    bbox: Option<DoclingBox>,
}

#[derive(Debug, Deserialize)]
struct DoclingBox {
    l: f64,
    t: f64,
    r: f64,
    b: f64,
    #[serde(default)]
    coord_origin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextItem {
    #[serde(flatten)]
    base: NodeBase,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct TableItem {
    #[serde(flatten)]
    base: NodeBase,
    #[serde(default)]
    data: TableData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TableData {
    table_cells: Vec<TableCell>,
    num_rows: usize,
    num_cols: usize,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    text: String,
    start_row_offset_idx: usize,
    end_row_offset_idx: usize,
    start_col_offset_idx: usize,
    end_col_offset_idx: usize,
}

#[derive(Debug, Deserialize)]
struct PictureItem {
    #[serde(flatten)]
    base: NodeBase,
    #[serde(default)]
    captions: Vec<RefItem>,
    #[serde(default)]
    image: Option<ImageRef>,
}

#[derive(Debug, Deserialize)]
struct GraphItem {
    #[serde(flatten)]
    base: NodeBase,
    #[serde(default)]
    graph: GraphData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GraphData {
    cells: Vec<GraphCell>,
}

#[derive(Debug, Deserialize)]
struct GraphCell {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct PageItem {
    page_no: u32,
    size: PageSize,
    #[serde(default)]
    image: Option<ImageRef>,
}

#[derive(Debug, Deserialize)]
struct PageSize {
    width: f64,
    height: f64,
}

/// A resolved `$ref` such as `#/texts/3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeRef {
    Body,
    Group(usize),
    Text(usize),
    Table(usize),
    Picture(usize),
    KeyValue(usize),
    Form(usize),
}

impl NodeRef {
    fn parse(cref: &str) -> Option<Self> {
        let path = cref.strip_prefix("#/")?;
        if path == "body" {
            return Some(Self::Body);
        }
        let (collection, index) = path.split_once('/')?;
        let index: usize = index.parse().ok()?;
        match collection {
            "groups" => Some(Self::Group(index)),
            "texts" => Some(Self::Text(index)),
            "tables" => Some(Self::Table(index)),
            "pictures" => Some(Self::Picture(index)),
            "key_value_items" => Some(Self::KeyValue(index)),
            "form_items" => Some(Self::Form(index)),
            _ => None,
        }
    }
}

impl DoclingDocument {
    fn into_processed(self, text: Option<String>) -> ProcessedDocument {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.walk(NodeRef::Body, &mut visited, &mut order);

        let elements = order.into_iter().filter_map(|node| self.element(node)).collect();

        // Keys are page numbers as strings, so map order is not page order.
        let mut pages: Vec<PageInfo> = self
            .pages
            .values()
            .map(|page| PageInfo {
                page_no: page.page_no,
                width: page.size.width,
                height: page.size.height,
                image_base64: page
                    .image
                    .as_ref()
                    .and_then(|img| data_uri_base64(&img.uri))
                    .map(str::to_string),
            })
            .collect();
        pages.sort_by_key(|p| p.page_no);

        ProcessedDocument {
            text,
            elements,
            pages,
        }
    }

    fn node(&self, node: NodeRef) -> Option<&NodeBase> {
        match node {
            NodeRef::Body => Some(&self.body),
            NodeRef::Group(i) => self.groups.get(i),
            NodeRef::Text(i) => self.texts.get(i).map(|t| &t.base),
            NodeRef::Table(i) => self.tables.get(i).map(|t| &t.base),
            NodeRef::Picture(i) => self.pictures.get(i).map(|p| &p.base),
            NodeRef::KeyValue(i) => self.key_value_items.get(i).map(|g| &g.base),
            NodeRef::Form(i) => self.form_items.get(i).map(|g| &g.base),
        }
    }

    /// Depth-first reading-order traversal from `body`. Groups are containers
    /// only; pictures are emitted but their children are not visited.
    fn walk(&self, node: NodeRef, visited: &mut HashSet<NodeRef>, order: &mut Vec<NodeRef>) {
        if !visited.insert(node) {
            return;
        }
        let Some(base) = self.node(node) else {
            debug!("DoclingDocument: dangling ref {:?}", node);
            return;
        };

        let is_container = matches!(node, NodeRef::Body | NodeRef::Group(_));
        let in_body = base.content_layer.as_deref().map_or(true, |l| l == "body");
        if !is_container && in_body {
            order.push(node);
        }
        if matches!(node, NodeRef::Picture(_)) {
            return;
        }

        for child in &base.children {
            match NodeRef::parse(&child.cref) {
                Some(child) => self.walk(child, visited, order),
                None => warn!("DoclingDocument: unsupported ref {}", child.cref),
            }
        }
    }

    fn element(&self, node: NodeRef) -> Option<DocElement> {
        let base = self.node(node)?;
        let body = match node {
            NodeRef::Body | NodeRef::Group(_) => return None,
            NodeRef::Text(i) => ElementBody::Text {
                text: self.texts[i].text.clone(),
            },
            NodeRef::Table(i) => ElementBody::Table {
                markdown: table_markdown(&self.tables[i].data),
            },
            NodeRef::Picture(i) => {
                let picture = &self.pictures[i];
                ElementBody::Image {
                    caption: self.caption_text(&picture.captions),
                    png_base64: picture
                        .image
                        .as_ref()
                        .and_then(|img| data_uri_base64(&img.uri))
                        .map(str::to_string),
                }
            }
            NodeRef::KeyValue(i) => ElementBody::Other {
                text: graph_text(&self.key_value_items[i].graph),
            },
            NodeRef::Form(i) => ElementBody::Other {
                text: graph_text(&self.form_items[i].graph),
            },
        };

        Some(DocElement {
            label: base.label.clone(),
            provenance: provenance(&base.prov),
            body,
        })
    }

    fn caption_text(&self, captions: &[RefItem]) -> String {
        captions
            .iter()
            .filter_map(|c| match NodeRef::parse(&c.cref) {
                Some(NodeRef::Text(i)) => self.texts.get(i).map(|t| t.text.as_str()),
                _ => None,
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn provenance(prov: &[ProvenanceItem]) -> Provenance {
    let Some(first) = prov.first() else {
        return Provenance::default();
    };
    Provenance {
        page: first.page_no,
        bbox: first.bbox.as_ref().map(|b| BoundingBox {
            left: b.l,
            top: b.t,
            right: b.r,
            bottom: b.b,
            origin: match b.coord_origin.as_deref() {
                Some("TOPLEFT") => CoordOrigin::TopLeft,
                _ => CoordOrigin::BottomLeft,
            },
        }),
    }
}

fn graph_text(graph: &GraphData) -> String {
    graph
        .cells
        .iter()
        .map(|c| c.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a table grid as GitHub-flavored markdown. Spanning cells are
/// repeated over every grid slot they cover; the first row is the header.
fn table_markdown(data: &TableData) -> String {
    let rows = data.num_rows;
    let cols = data.num_cols;
    if rows == 0 || cols == 0 {
        return String::new();
    }

    let mut grid = vec![vec![String::new(); cols]; rows];
    for cell in &data.table_cells {
        let text = escape_cell(&cell.text);
        for row in grid
            .iter_mut()
            .take(cell.end_row_offset_idx.min(rows))
            .skip(cell.start_row_offset_idx)
        {
            for slot in row
                .iter_mut()
                .take(cell.end_col_offset_idx.min(cols))
                .skip(cell.start_col_offset_idx)
            {
                slot.clone_from(&text);
            }
        }
    }

    let mut lines = Vec::with_capacity(rows + 1);
    lines.push(markdown_row(&grid[0]));
    lines.push(format!("|{}", "---|".repeat(cols)));
    for row in &grid[1..] {
        lines.push(markdown_row(row));
    }
    lines.join("\n")
}

fn markdown_row(cells: &[String]) -> String {
    format!("| {} |", cells.join(" | "))
}

fn escape_cell(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "\\|")
}
