//! Document processor abstraction.
//!
//! Defines the [`DocumentProcessor`] trait and the backend-neutral document model
//! so different processors (Docling sidecar, in-process lopdf) can be swapped via
//! configuration.

pub mod docling;
pub mod native;

use crate::config::{ProcessorConfig, ProcessorKind};
use std::sync::Arc;

/// Which corner of the page a bounding box is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordOrigin {
    TopLeft,
    #[default]
    BottomLeft,
}

/// Bounding box as reported by the processor, in page points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub origin: CoordOrigin,
}

/// Where an element sits in the source document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Provenance {
    /// 1-indexed page number.
    pub page: Option<u32>,
    pub bbox: Option<BoundingBox>,
}

/// Coarse element kind, used by the response mapper for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Text,
    Table,
    Image,
    Other,
}

/// Kind-specific payload of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementBody {
    Text { text: String },
    Table { markdown: String },
    Image {
        caption: String,
        /// Base64-encoded PNG of the picture, when the backend can supply one.
        png_base64: Option<String>,
    },
    Other { text: String },
}

/// One structural element in reading order.
#[derive(Debug, Clone, PartialEq)]
pub struct DocElement {
    /// Backend label, e.g. `paragraph`, `section_header`, `picture`.
    pub label: Option<String>,
    pub provenance: Provenance,
    pub body: ElementBody,
}

impl DocElement {
    pub fn kind(&self) -> ElementKind {
        match self.body {
            ElementBody::Text { .. } => ElementKind::Text,
            ElementBody::Table { .. } => ElementKind::Table,
            ElementBody::Image { .. } => ElementKind::Image,
            ElementBody::Other { .. } => ElementKind::Other,
        }
    }

    pub fn bbox(&self) -> Option<&BoundingBox> {
        self.provenance.bbox.as_ref()
    }

    pub fn page(&self) -> Option<u32> {
        self.provenance.page
    }

    /// Textual representation: markdown for tables, caption for images.
    pub fn text(&self) -> &str {
        match &self.body {
            ElementBody::Text { text } | ElementBody::Other { text } => text,
            ElementBody::Table { markdown } => markdown,
            ElementBody::Image { caption, .. } => caption,
        }
    }
}

/// Page geometry (always 1-indexed).
#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub page_no: u32,
    pub width: f64,
    pub height: f64,
    /// Base64-encoded PNG rendering of the page, when available.
    pub image_base64: Option<String>,
}

/// Unified document returned by every processor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedDocument {
    /// Full plain-text export, if the backend produces one.
    pub text: Option<String>,
    pub elements: Vec<DocElement>,
    pub pages: Vec<PageInfo>,
}

/// Input to a processor.
#[derive(Debug, Clone)]
pub struct PdfInput {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Async trait implemented by each processing backend.
#[async_trait::async_trait]
pub trait DocumentProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Check that the backend is reachable. Backends without external
    /// dependencies are always ready.
    async fn ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process(&self, input: PdfInput) -> anyhow::Result<ProcessedDocument>;
}

/// Build the configured processor. Called once at startup.
pub fn build(config: &ProcessorConfig) -> anyhow::Result<Arc<dyn DocumentProcessor>> {
    let processor: Arc<dyn DocumentProcessor> = match config.kind {
        ProcessorKind::Docling => Arc::new(docling::DoclingProcessor::new(&config.docling)?),
        ProcessorKind::Lopdf => Arc::new(native::LopdfProcessor),
    };
    Ok(processor)
}

/// Base64 payload of a `data:...;base64,` URI.
pub(crate) fn data_uri_base64(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    meta.ends_with(";base64").then_some(payload)
}
