//! Service configuration loaded from environment variables.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024; // 100MB
const DEFAULT_MAX_CONCURRENT_PARSES: usize = 4;
const DEFAULT_DOCLING_URL: &str = "http://localhost:5001";
const DEFAULT_DOCLING_CONVERT_PATH: &str = "/v1/convert/file";
const DEFAULT_DOCLING_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served under `/static`.
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub max_concurrent_parses: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    Docling,
    Lopdf,
}

impl FromStr for ProcessorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docling" => Ok(Self::Docling),
            "lopdf" => Ok(Self::Lopdf),
            other => bail!("unknown document processor '{}' (expected docling or lopdf)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub kind: ProcessorKind,
    pub docling: DoclingConfig,
}

/// Options forwarded to the docling-serve sidecar.
#[derive(Debug, Clone)]
pub struct DoclingConfig {
    pub url: String,
    pub convert_path: String,
    pub timeout_secs: u64,
    pub do_ocr: bool,
    pub ocr_engine: String,
    pub ocr_langs: Vec<String>,
    /// Ask for embedded page and picture images (used by the UI overlay).
    pub include_images: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
                static_dir: PathBuf::from("static"),
                max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
                max_concurrent_parses: DEFAULT_MAX_CONCURRENT_PARSES,
            },
            processor: ProcessorConfig {
                kind: ProcessorKind::Docling,
                docling: DoclingConfig {
                    url: DEFAULT_DOCLING_URL.to_string(),
                    convert_path: DEFAULT_DOCLING_CONVERT_PATH.to_string(),
                    timeout_secs: DEFAULT_DOCLING_TIMEOUT_SECS,
                    do_ocr: true,
                    ocr_engine: "tesseract_cli".to_string(),
                    ocr_langs: vec!["rus".to_string(), "eng".to_string()],
                    include_images: true,
                },
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset variables keep
    /// their defaults; malformed ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let server = &mut config.server;
        let docling = &mut config.processor.docling;

        if let Some(host) = lookup("SERVER_HOST") {
            server.host = host;
        }
        if let Some(port) = parsed(&lookup, "SERVER_PORT")? {
            server.port = port;
        }
        if let Some(dir) = lookup("STATIC_DIR") {
            server.static_dir = PathBuf::from(dir);
        }
        if let Some(limit) = parsed(&lookup, "MAX_UPLOAD_BYTES")? {
            server.max_upload_bytes = limit;
        }
        if let Some(permits) = parsed::<usize, _>(&lookup, "MAX_CONCURRENT_PARSES")? {
            if permits == 0 {
                bail!("MAX_CONCURRENT_PARSES must be at least 1");
            }
            server.max_concurrent_parses = permits;
        }

        if let Some(kind) = parsed(&lookup, "DOCUMENT_PROCESSOR")? {
            config.processor.kind = kind;
        }
        if let Some(url) = lookup("DOCLING_URL") {
            docling.url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = lookup("DOCLING_CONVERT_PATH") {
            docling.convert_path = path;
        }
        if let Some(secs) = parsed(&lookup, "DOCLING_TIMEOUT_SECS")? {
            docling.timeout_secs = secs;
        }
        if let Some(do_ocr) = parsed(&lookup, "DOCLING_DO_OCR")? {
            docling.do_ocr = do_ocr;
        }
        if let Some(engine) = lookup("DOCLING_OCR_ENGINE") {
            docling.ocr_engine = engine;
        }
        if let Some(langs) = lookup("DOCLING_OCR_LANGS") {
            docling.ocr_langs = langs
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(include) = parsed(&lookup, "DOCLING_INCLUDE_IMAGES")? {
            docling.include_images = include;
        }

        Ok(config)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
    }
}
