//! Model format detection
//!
//! llama.cpp only loads GGUF (and legacy GGML) files. The extension is checked
//! first, then the file magic when the file exists.
use super::runtime_trait::ModelFormat;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::info;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
// 'ggml', 'ggmf', 'ggjt' written little-endian
const GGML_MAGICS: [&[u8; 4]; 3] = [b"lmgg", b"fmgg", b"tjgg"];

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect_from_path(path: &Path) -> Option<ModelFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();

        let format = if ModelFormat::GGUF.extensions().contains(&extension.as_str()) {
            Some(ModelFormat::GGUF)
        } else if extension == "ggml" {
            Some(ModelFormat::GGML)
        } else if extension == "bin" {
            // Plain .bin is only accepted when the name says it is GGML.
            path.file_name()
                .and_then(|n| n.to_str())
                .filter(|name| name.to_lowercase().contains("ggml"))
                .map(|_| ModelFormat::GGML)
        } else {
            None
        };

        if let Some(fmt) = format {
            info!("Detected model format: {} for file: {}", fmt.name(), path.display());
        }
        format
    }

    pub fn detect_from_header(path: &Path) -> std::io::Result<Option<ModelFormat>> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path)?;
        if file.read(&mut magic)? < magic.len() {
            return Ok(None);
        }
        if &magic == GGUF_MAGIC {
            Ok(Some(ModelFormat::GGUF))
        } else if GGML_MAGICS.iter().any(|m| *m == &magic) {
            Ok(Some(ModelFormat::GGML))
        } else {
            Ok(None)
        }
    }

    /// Check that `path` exists and is a model llama.cpp can load.
    pub fn validate_model(path: &Path) -> anyhow::Result<ModelFormat> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Model file not found: {}", path.display()));
        }
        let by_name = Self::detect_from_path(path).ok_or_else(|| {
            anyhow::anyhow!(
                "Unsupported model file {} (expected one of: {})",
                path.display(),
                Self::supported_extensions().join(", ")
            )
        })?;

        match Self::detect_from_header(path)? {
            Some(by_magic) => Ok(by_magic),
            None => Err(anyhow::anyhow!(
                "{} has a .{} extension but no {} header",
                path.display(),
                by_name.extensions()[0],
                by_name.name()
            )),
        }
    }

    pub fn supported_extensions() -> Vec<String> {
        [ModelFormat::GGUF, ModelFormat::GGML]
            .iter()
            .flat_map(|f| f.extensions().iter().map(|e| e.to_string()))
            .collect()
    }
}
