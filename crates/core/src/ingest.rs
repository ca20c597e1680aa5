use crate::chunking::normalize_whitespace;
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::models::{Document, DocumentKind, DocumentStructure, PageSpan, TextSpan};
use crate::IngestError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A discovered source file and its identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the data directory, `/`-separated.
    pub relative: String,
    pub kind: DocumentKind,
}

pub fn discover_documents(folder: &Path) -> Vec<SourceFile> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        match DocumentKind::from_path(path) {
            Some(kind) if kind.is_indexable() => files.push(SourceFile {
                path: path.to_path_buf(),
                relative: relative_key(folder, path),
                kind,
            }),
            Some(_) => debug!(path = %path.display(), "image left for table detection"),
            None => debug!(path = %path.display(), "ignoring unsupported file"),
        }
    }

    files.sort_unstable_by(|left, right| left.path.cmp(&right.path));
    files
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Digest of the whitespace-canonicalised text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_whitespace(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn document_id_for(relative: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(relative.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct DocumentLoader {
    pdf: Arc<dyn PdfExtractor>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new(Arc::new(LopdfExtractor))
    }
}

impl DocumentLoader {
    pub fn new(pdf: Arc<dyn PdfExtractor>) -> Self {
        Self { pdf }
    }

    pub fn load(&self, source: &SourceFile) -> Result<Document, IngestError> {
        let path = source.path.as_path();
        let (raw_text, structure) = match source.kind {
            DocumentKind::Csv => read_csv(path)?,
            DocumentKind::Pdf => self.read_pdf(path)?,
            DocumentKind::Text => (read_text(path)?, DocumentStructure::Plain),
            DocumentKind::Image => {
                return Err(IngestError::unsupported(
                    path,
                    "images are not loaded as text; use table detection",
                ))
            }
        };

        Ok(Document {
            id: document_id_for(&source.relative),
            source_path: path.to_string_lossy().to_string(),
            kind: source.kind,
            content_hash: content_hash(&raw_text),
            raw_text,
            structure,
        })
    }

    /// Load a single file whose kind is declared by the caller or inferred
    /// from its extension. The path itself is the identity key.
    pub fn load_path(&self, path: &Path, kind: Option<DocumentKind>) -> Result<Document, IngestError> {
        let kind = match kind.or_else(|| DocumentKind::from_path(path)) {
            Some(kind) => kind,
            None => return Err(IngestError::unsupported(path, "unknown file extension")),
        };

        self.load(&SourceFile {
            path: path.to_path_buf(),
            relative: path.to_string_lossy().replace('\\', "/"),
            kind,
        })
    }

    fn read_pdf(&self, path: &Path) -> Result<(String, DocumentStructure), IngestError> {
        let pages = self.pdf.extract_pages(path)?;
        if pages.is_empty() {
            warn!(path = %path.display(), "pdf has no extractable text");
        }

        let (raw_text, spans) = join_segments(pages.iter().map(|page| page.text.as_str()));
        let pages = pages
            .iter()
            .zip(spans)
            .map(|(page, span)| PageSpan {
                number: page.number,
                span,
            })
            .collect();

        Ok((raw_text, DocumentStructure::Pages { pages }))
    }
}

fn read_text(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path).map_err(|error| IngestError::corrupt(path, error))?;
    let text = String::from_utf8(bytes).map_err(|error| IngestError::corrupt(path, error))?;
    Ok(text.replace("\r\n", "\n"))
}

fn read_csv(path: &Path) -> Result<(String, DocumentStructure), IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|error| IngestError::corrupt(path, error))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|error| IngestError::corrupt(path, error))?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        rows.push(
            record
                .iter()
                .map(str::trim)
                .collect::<Vec<_>>()
                .join(" | "),
        );
    }

    let (raw_text, spans) = join_segments(rows.iter().map(String::as_str));
    Ok((raw_text, DocumentStructure::Rows { rows: spans }))
}

fn join_segments<'a>(segments: impl Iterator<Item = &'a str>) -> (String, Vec<TextSpan>) {
    let mut text = String::new();
    let mut spans = Vec::new();
    let mut offset = 0;

    for segment in segments {
        if !spans.is_empty() {
            text.push('\n');
            offset += 1;
        }
        let len = segment.chars().count();
        text.push_str(segment);
        spans.push(TextSpan {
            start: offset,
            end: offset + len,
        });
        offset += len;
    }

    (text, spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_skips_images() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        fs::write(nested.join("orders.CSV"), "vendor,units\nAcme,5\n")?;
        fs::write(nested.join("notes.md"), "notes")?;
        fs::write(base.join("scan.png"), [0u8; 8])?;
        fs::write(base.join("archive.zip"), [0u8; 8])?;

        let files = discover_documents(base);
        let keys = files.iter().map(|file| file.relative.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a.pdf", "nested/notes.md", "nested/orders.CSV"]);
        assert_eq!(files[2].kind, DocumentKind::Csv);
        Ok(())
    }

    #[test]
    fn content_hash_ignores_whitespace_only_changes() {
        let first = content_hash("Vendor  Acme\r\nunits 500");
        let second = content_hash("Vendor Acme units 500 ");
        assert_eq!(first, second);
        assert_ne!(first, content_hash("Vendor Acme units 501"));
    }

    #[test]
    fn csv_rows_are_flattened_with_row_spans() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("orders.csv");
        fs::write(&path, "vendor,units,quarter\nAcme Corp,500,Q1\n,,\n\"Globex, Inc\",320,Q2\n")?;

        let document = DocumentLoader::default().load_path(&path, None)?;
        assert_eq!(
            document.raw_text,
            "vendor | units | quarter\nAcme Corp | 500 | Q1\nGlobex, Inc | 320 | Q2"
        );
        match &document.structure {
            DocumentStructure::Rows { rows } => {
                assert_eq!(rows.len(), 3);
                assert_eq!(rows[1], TextSpan { start: 25, end: 45 });
            }
            other => panic!("unexpected structure {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn invalid_utf8_csv_is_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.csv");
        fs::write(&path, [b'a', b',', 0xff, 0xfe, b'\n'])?;

        let result = DocumentLoader::default().load_path(&path, None);
        assert!(matches!(result, Err(IngestError::CorruptSource { .. })));
        Ok(())
    }

    #[test]
    fn images_and_unknown_files_are_unsupported() {
        let loader = DocumentLoader::default();
        let image = loader.load_path(Path::new("scan.png"), None);
        assert!(matches!(image, Err(IngestError::UnsupportedFormat { .. })));

        let unknown = loader.load_path(Path::new("archive.zip"), None);
        assert!(matches!(unknown, Err(IngestError::UnsupportedFormat { .. })));
    }

    #[test]
    fn empty_text_file_loads_as_empty_document() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.txt");
        fs::write(&path, "")?;

        let document = DocumentLoader::default().load_path(&path, None)?;
        assert!(document.raw_text.is_empty());
        assert_eq!(document.kind, DocumentKind::Text);
        Ok(())
    }

    #[test]
    fn document_identity_follows_relative_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.txt"), "same text")?;
        let loader = DocumentLoader::default();

        let first = loader.load(&discover_documents(dir.path())[0])?;
        let second = loader.load(&discover_documents(dir.path())[0])?;
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, document_id_for("a.txt"));
        assert_eq!(first.content_hash, second.content_hash);
        Ok(())
    }
}
