//! PDF Parse Service - HTTP front for document structure extraction.

mod config;
mod error;
mod mapper;
mod processor;
mod schema;

use anyhow::Context;
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{Json, Redirect},
    routing::{get, post},
    Router,
};
use config::{Config, ServerConfig};
use error::AppError;
use processor::{DocumentProcessor, PdfInput};
use schema::ParseResult;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/x-pdf",
    "application/octet-stream",
];

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    processor: Arc<dyn DocumentProcessor>,
    /// Caps concurrent processor calls; extra requests wait for a permit.
    permits: Arc<Semaphore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "pdf_parse_service=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let processor = processor::build(&config.processor)?;
    info!("Document processor initialized: {}", processor.name());
    if let Err(e) = processor.ready().await {
        warn!("Document processor not ready yet: {:#}", e);
    }

    let state = AppState {
        processor,
        permits: Arc::new(Semaphore::new(config.server.max_concurrent_parses)),
    };
    let app = router(state, &config.server);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/parse", post(parse_pdf))
        .nest_service("/static", ServeDir::new(&server.static_dir))
        .layer(DefaultBodyLimit::max(server.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Liveness check. Does not touch the processor.
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Send browsers to the upload UI.
async fn index() -> Redirect {
    Redirect::temporary("/static/index.html")
}

/// Upload a PDF and return its text and structural objects.
async fn parse_pdf(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> error::Result<Json<ParseResult>> {
    let request_id = Uuid::new_v4();

    async move {
        // Not a multipart/form-data request at all.
        let multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;
        let upload = read_upload(multipart).await?;
        let filename = upload.filename.clone();
        info!("Received file: {} ({} bytes)", filename, upload.data.len());

        let _permit = state
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("Parse limiter closed: {}", e)))?;

        let processed = state
            .processor
            .process(upload)
            .await
            .map_err(AppError::processing)?;

        let result = mapper::map_document(&filename, processed);
        info!(
            "Parsed {}: {} objects on {} pages",
            filename,
            result.objects.len(),
            result.num_pages
        );
        Ok::<_, AppError>(Json(result))
    }
    .instrument(info_span!("parse", %request_id))
    .await
}

// ============================================================================
// Helper functions
// ============================================================================

/// Read the `file` field fully into memory and check it is a PDF.
async fn read_upload(mut multipart: Multipart) -> error::Result<PdfInput> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        if let Some(content_type) = field.content_type() {
            let mime = content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !ACCEPTED_CONTENT_TYPES.contains(&mime.as_str()) {
                return Err(AppError::BadRequest("File must be a PDF".to_string()));
            }
        }

        let filename = field.file_name().unwrap_or("document.pdf").to_string();
        let data = field.bytes().await.map_err(multipart_error)?.to_vec();

        if data.is_empty() {
            return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
        }
        if !has_pdf_header(&data) {
            return Err(AppError::BadRequest("File must be a PDF".to_string()));
        }
        return Ok(PdfInput { filename, data });
    }

    Err(AppError::BadRequest("No file uploaded".to_string()))
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(format!("Multipart error: {}", e.body_text()))
    }
}

/// Readers accept the `%PDF-` marker anywhere in the first 1024 bytes.
fn has_pdf_header(data: &[u8]) -> bool {
    data[..data.len().min(1024)]
        .windows(5)
        .any(|w| w == b"%PDF-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{
        BoundingBox, CoordOrigin, DocElement, ElementBody, PageInfo, ProcessedDocument, Provenance,
    };
    use axum::body::Body;
    use axum::http::{header, Request, Response};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    const BOUNDARY: &str = "XyZBoundary42";
    const PDF_BYTES: &[u8] = b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n%%EOF\n";

    struct StubProcessor {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl DocumentProcessor for StubProcessor {
        fn name(&self) -> &str {
            "stub"
        }

        async fn process(&self, _input: PdfInput) -> anyhow::Result<ProcessedDocument> {
            if self.fail {
                anyhow::bail!("corrupt xref table at offset 9");
            }
            Ok(ProcessedDocument {
                text: Some("Revenue grew in Q3.\n\n| Region | Sales |".to_string()),
                elements: vec![
                    DocElement {
                        label: Some("paragraph".to_string()),
                        provenance: Provenance {
                            page: Some(1),
                            bbox: Some(BoundingBox {
                                left: 72.0,
                                top: 720.0,
                                right: 540.0,
                                bottom: 700.0,
                                origin: CoordOrigin::BottomLeft,
                            }),
                        },
                        body: ElementBody::Text {
                            text: "Revenue grew in Q3.".to_string(),
                        },
                    },
                    DocElement {
                        label: Some("table".to_string()),
                        provenance: Provenance {
                            page: Some(1),
                            bbox: None,
                        },
                        body: ElementBody::Table {
                            markdown: "| Region | Sales |\n|---|---|\n| EU | 10 |".to_string(),
                        },
                    },
                ],
                pages: vec![PageInfo {
                    page_no: 1,
                    width: 612.0,
                    height: 792.0,
                    image_base64: None,
                }],
            })
        }
    }

    fn app_with(fail: bool, max_upload_bytes: usize) -> Router {
        let mut server = Config::default().server;
        server.max_upload_bytes = max_upload_bytes;
        let state = AppState {
            processor: Arc::new(StubProcessor { fail }),
            permits: Arc::new(Semaphore::new(2)),
        };
        router(state, &server)
    }

    fn app() -> Router {
        app_with(false, 1024 * 1024)
    }

    fn upload(field: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"report.pdf\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/parse")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = app()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_index_redirects_to_ui() {
        let response = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/static/index.html");
    }

    #[tokio::test]
    async fn test_static_ui_served() {
        let response = app()
            .oneshot(Request::get("/static/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_parse_success() {
        let response = app()
            .oneshot(upload("file", "application/pdf", PDF_BYTES))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["filename"], "report.pdf");
        assert!(!body["text"].as_str().unwrap().is_empty());

        let objects = body["objects"].as_array().unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["type"], "text");
        assert_eq!(objects[0]["text"], "Revenue grew in Q3.");
        assert_eq!(objects[1]["type"], "table");
        assert!(objects[1]["text"].as_str().unwrap().starts_with("| Region | Sales |"));
        assert!(objects[1].get("bbox").is_none());

        let bbox = &objects[0]["bbox"];
        assert!(bbox["x0"].as_f64() <= bbox["x1"].as_f64());
        assert!(bbox["y0"].as_f64() <= bbox["y1"].as_f64());
        assert_eq!(body["num_pages"], 1);
    }

    #[tokio::test]
    async fn test_parse_accepts_octet_stream() {
        let response = app()
            .oneshot(upload("file", "application/octet-stream", PDF_BYTES))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_parse_is_repeatable() {
        let first = json_body(
            app()
                .oneshot(upload("file", "application/pdf", PDF_BYTES))
                .await
                .unwrap(),
        )
        .await;
        let second = json_body(
            app()
                .oneshot(upload("file", "application/pdf", PDF_BYTES))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(first["objects"], second["objects"]);
    }

    #[tokio::test]
    async fn test_parse_missing_file_field() {
        let response = app()
            .oneshot(upload("attachment", "application/pdf", PDF_BYTES))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["error"], "bad_request");
        assert_eq!(body["message"], "No file uploaded");
        assert!(body.get("objects").is_none());
    }

    #[tokio::test]
    async fn test_parse_empty_file() {
        let response = app()
            .oneshot(upload("file", "application/pdf", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_parse_rejects_non_pdf() {
        let wrong_type = app()
            .oneshot(upload("file", "text/plain", b"hello"))
            .await
            .unwrap();
        assert_eq!(wrong_type.status(), StatusCode::BAD_REQUEST);

        let wrong_bytes = app()
            .oneshot(upload("file", "application/pdf", b"GIF89a not a document"))
            .await
            .unwrap();
        assert_eq!(wrong_bytes.status(), StatusCode::BAD_REQUEST);
        let body = json_body(wrong_bytes).await;
        assert_eq!(body["message"], "File must be a PDF");
        assert!(body.get("objects").is_none());
    }

    #[tokio::test]
    async fn test_parse_processing_failure_is_generic() {
        let response = app_with(true, 1024 * 1024)
            .oneshot(upload("file", "application/pdf", PDF_BYTES))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = json_body(response).await;
        assert_eq!(body["message"], "Failed to process PDF");
        assert!(!body.to_string().contains("xref"));
        assert!(body.get("objects").is_none());
    }

    #[tokio::test]
    async fn test_parse_upload_limit() {
        let big = [PDF_BYTES, &[b' '; 4096][..]].concat();
        let response = app_with(false, 1024)
            .oneshot(upload("file", "application/pdf", &big))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_parse_malformed_multipart() {
        // Closing boundary never arrives.
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"report.pdf\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(PDF_BYTES);

        let request = Request::builder()
            .method("POST")
            .uri("/parse")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["error"], "bad_request");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("Multipart error"));
    }

    #[tokio::test]
    async fn test_parse_requires_multipart() {
        let request = Request::builder()
            .method("POST")
            .uri("/parse")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"file\": \"report.pdf\"}"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["error"], "bad_request");
        assert!(!body["message"].as_str().unwrap().is_empty());
    }

    /// Holds every `process` call until released.
    struct GatedProcessor {
        started: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl DocumentProcessor for GatedProcessor {
        fn name(&self) -> &str {
            "gated"
        }

        async fn process(&self, _input: PdfInput) -> anyhow::Result<ProcessedDocument> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(ProcessedDocument::default())
        }
    }

    #[tokio::test]
    async fn test_parse_waits_for_permit() {
        let gate = Arc::new(GatedProcessor {
            started: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let state = AppState {
            processor: gate.clone(),
            permits: Arc::new(Semaphore::new(1)),
        };
        let app = router(state, &Config::default().server);

        let first = tokio::spawn(
            app.clone()
                .oneshot(upload("file", "application/pdf", PDF_BYTES)),
        );
        gate.entered.notified().await;

        let second = tokio::spawn(
            app.clone()
                .oneshot(upload("file", "application/pdf", PDF_BYTES)),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gate.started.load(Ordering::SeqCst), 1);

        gate.release.notify_one();
        assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);

        gate.entered.notified().await;
        assert_eq!(gate.started.load(Ordering::SeqCst), 2);
        gate.release.notify_one();
        assert_eq!(second.await.unwrap().unwrap().status(), StatusCode::OK);
    }

    #[test]
    fn test_has_pdf_header() {
        assert!(has_pdf_header(b"%PDF-1.4\n"));
        assert!(has_pdf_header(b"\xef\xbb\xbf junk %PDF-1.7"));
        assert!(!has_pdf_header(b"PK\x03\x04"));

        let mut late = vec![b' '; 2048];
        late.extend_from_slice(b"%PDF-1.4");
        assert!(!has_pdf_header(&late));
    }
}
