//! File-body responses.
//!
//! This module provides:
//! - Resolution of (possibly templated) file paths against the environment directory
//! - Containment checks for templated paths
//! - Single-range `Range` support for binary files
//! - Templating of text-like file content

use crate::environment::RouteResponse;
use crate::error::EngineError;
use crate::template::RenderScope;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Extensions rendered as templates regardless of the detected MIME type.
const TEMPLATED_EXTENSIONS: &[&str] = &["json", "html", "htm", "txt", "xml", "csv", "yaml", "yml"];

/// Content produced for a file-body response.
#[derive(Debug, Clone, PartialEq)]
pub struct FileReply {
    /// Status override (206, 416, 400); `None` keeps the response status
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FileReply {
    fn error(status: u16, message: &str) -> Self {
        Self {
            status: Some(status),
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: Bytes::copy_from_slice(message.as_bytes()),
        }
    }
}

/// Resolves response file paths inside one environment directory.
#[derive(Debug, Clone)]
pub struct FileResolver {
    base_dir: PathBuf,
}

impl FileResolver {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base = std::path::absolute(base_dir.as_ref())
            .unwrap_or_else(|_| base_dir.as_ref().to_path_buf());
        Self {
            base_dir: normalize_lexically(&base),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Render `configured` and resolve it against the environment directory.
    ///
    /// Templated paths must stay inside the environment directory. Static paths
    /// are trusted as written by the environment author.
    pub fn resolve(&self, configured: &str, scope: &RenderScope<'_>) -> Result<PathBuf, EngineError> {
        let templated = configured.contains("{{");
        let rendered = if templated {
            scope
                .render(configured)
                .map_err(|e| EngineError::Render(e.to_string()))?
        } else {
            configured.to_string()
        };
        self.resolve_rendered(&rendered, templated)
    }

    /// Resolve an already rendered path. `templated` enables the containment check.
    pub fn resolve_rendered(&self, rendered: &str, templated: bool) -> Result<PathBuf, EngineError> {
        let unified = rendered.trim().replace('\\', "/");
        let candidate = Path::new(&unified);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base_dir.join(candidate)
        };
        let resolved = normalize_lexically(&joined);

        if templated && !resolved.starts_with(&self.base_dir) {
            warn!(
                "Denied templated file path '{}' resolving to {}",
                rendered,
                resolved.display()
            );
            return Err(EngineError::PathTraversal(rendered.to_string()));
        }
        Ok(resolved)
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// MIME type guessed from the file extension.
pub fn mime_for(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

/// Whether file content of this kind is rendered as a template.
pub fn is_templatable(path: &Path, mime: Option<&str>) -> bool {
    let by_mime = mime.is_some_and(|m| {
        m.starts_with("text/")
            || m == "application/json"
            || m == "application/xml"
            || m.ends_with("+json")
            || m.ends_with("+xml")
    });
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TEMPLATED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    by_mime || by_extension
}

/// Read a file, mapping failures to [`EngineError::FileServing`].
pub async fn load(path: &Path) -> Result<Bytes, EngineError> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| EngineError::FileServing(format!("{}: {}", path.display(), e)))
}

/// Build the reply for a loaded file.
pub fn build_reply(
    path: &Path,
    content: Bytes,
    response: &RouteResponse,
    range: Option<&str>,
    scope: &RenderScope<'_>,
) -> Result<FileReply, EngineError> {
    let mime = mime_for(path);
    let mut headers = Vec::new();
    if let Some(mime) = &mime {
        headers.push(("Content-Type".to_string(), mime.clone()));
    }
    if !response.send_file_as_body {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        headers.push((
            "Content-Disposition".to_string(),
            format!("attachment; filename=\"{file_name}\""),
        ));
    }

    if !response.disable_templating && is_templatable(path, mime.as_deref()) {
        let text = String::from_utf8_lossy(&content);
        let rendered = scope
            .render(&text)
            .map_err(|e| EngineError::Render(e.to_string()))?;
        return Ok(FileReply {
            status: None,
            headers,
            body: Bytes::from(rendered),
        });
    }

    let size = content.len() as u64;
    let Some(range) = range else {
        return Ok(FileReply {
            status: None,
            headers,
            body: content,
        });
    };

    match parse_range(range, size) {
        RangeSpec::Satisfiable { start, end } => {
            debug!("Serving bytes {}-{}/{} of {}", start, end, size, path.display());
            headers.push(("Content-Range".to_string(), format!("bytes {start}-{end}/{size}")));
            headers.push(("Accept-Ranges".to_string(), "bytes".to_string()));
            Ok(FileReply {
                status: Some(206),
                headers,
                body: content.slice(start as usize..=end as usize),
            })
        }
        RangeSpec::Unsatisfiable => Ok(FileReply::error(416, "Requested range not satisfiable")),
        RangeSpec::Malformed => Ok(FileReply::error(400, "Malformed range header")),
    }
}

/// Resolve, load and build a file-body reply.
pub async fn serve(
    resolver: &FileResolver,
    response: &RouteResponse,
    range: Option<&str>,
    scope: &RenderScope<'_>,
) -> Result<FileReply, EngineError> {
    let path = resolver.resolve(&response.file_path, scope)?;
    let content = load(&path).await?;
    build_reply(&path, content, response, range, scope)
}

// ============================================================================
// Range header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
    Malformed,
}

/// Parse a `Range` header against a file of `size` bytes. Only the first
/// range of a multi-range header is honored.
pub fn parse_range(header: &str, size: u64) -> RangeSpec {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeSpec::Malformed;
    };
    let Some(first) = spec.split(',').next() else {
        return RangeSpec::Malformed;
    };
    let Some((start, end)) = first.trim().split_once('-') else {
        return RangeSpec::Malformed;
    };
    let (start, end) = (start.trim(), end.trim());

    let parsed = match (start.is_empty(), end.is_empty()) {
        (true, true) => return RangeSpec::Malformed,
        // Suffix range: the last N bytes
        (true, false) => match end.parse::<u64>() {
            Ok(0) => return RangeSpec::Unsatisfiable,
            Ok(n) => (size.saturating_sub(n), size.saturating_sub(1)),
            Err(_) => return RangeSpec::Malformed,
        },
        (false, true) => match start.parse::<u64>() {
            Ok(s) => (s, size.saturating_sub(1)),
            Err(_) => return RangeSpec::Malformed,
        },
        (false, false) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(s), Ok(e)) => (s, e.min(size.saturating_sub(1))),
            _ => return RangeSpec::Malformed,
        },
    };

    let (start, end) = parsed;
    if size == 0 || start >= size || start > end {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Satisfiable { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BucketStore;
    use crate::template::{HandlebarsRenderer, RequestContext};
    use hyper::HeaderMap;
    use std::collections::BTreeMap;
    use std::fs;

    fn request() -> RequestContext {
        RequestContext::from_parts("GET", "/files/users", None, &HeaderMap::new(), b"")
            .with_params(BTreeMap::from([("name".to_string(), "users".to_string())]))
    }

    fn header<'r>(reply: &'r FileReply, name: &str) -> Option<&'r str> {
        reply
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_sibling_file_resolves_inside_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(dir.path());
        let path = resolver.resolve_rendered("./sibling.json", false).unwrap();
        assert!(path.starts_with(resolver.base_dir()));
        assert!(path.ends_with("sibling.json"));
    }

    #[test]
    fn test_templated_traversal_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(dir.path());
        let err = resolver
            .resolve_rendered("../../etc/passwd", true)
            .unwrap_err();
        assert!(matches!(err, EngineError::PathTraversal(_)));
        assert_eq!(err.status(), hyper::StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_static_out_of_bounds_path_is_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(dir.path().join("env"));
        let path = resolver.resolve_rendered("../shared/data.json", false).unwrap();
        assert_eq!(path, normalize_lexically(&dir.path().join("shared/data.json")));
    }

    #[test]
    fn test_templated_path_renders_params() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(dir.path());
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::default();
        let request = request();
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);

        let path = resolver
            .resolve("data/{{urlParam 'name'}}.json", &scope)
            .unwrap();
        assert!(path.ends_with("data/users.json"));

        let escaped = resolver.resolve("{{urlParam 'name'}}/../../../x", &scope);
        assert!(matches!(escaped, Err(EngineError::PathTraversal(_))));
    }

    #[test]
    fn test_backslashes_are_unified() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(dir.path());
        let path = resolver.resolve_rendered("data\\users.json", false).unwrap();
        assert!(path.ends_with("data/users.json"));
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/./../c")),
            PathBuf::from("/a/c")
        );
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(
            parse_range("bytes=0-3", 10),
            RangeSpec::Satisfiable { start: 0, end: 3 }
        );
        assert_eq!(
            parse_range("bytes=5-", 10),
            RangeSpec::Satisfiable { start: 5, end: 9 }
        );
        assert_eq!(
            parse_range("bytes=-4", 10),
            RangeSpec::Satisfiable { start: 6, end: 9 }
        );
        assert_eq!(
            parse_range("bytes=2-100", 10),
            RangeSpec::Satisfiable { start: 2, end: 9 }
        );
        assert_eq!(parse_range("bytes=10-12", 10), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range("bytes=5-2", 10), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range("items=0-1", 10), RangeSpec::Malformed);
        assert_eq!(parse_range("bytes=a-b", 10), RangeSpec::Malformed);
    }

    #[tokio::test]
    async fn test_serve_templated_json_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("user.json"), r#"{"path": "{{request.path}}"}"#).unwrap();
        let resolver = FileResolver::new(dir.path());
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::default();
        let request = request();
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);
        let response = RouteResponse {
            file_path: "user.json".into(),
            send_file_as_body: true,
            ..Default::default()
        };

        let reply = serve(&resolver, &response, None, &scope).await.unwrap();
        assert_eq!(reply.body, Bytes::from(r#"{"path": "/files/users"}"#));
        assert_eq!(header(&reply, "Content-Type"), Some("application/json"));
        assert_eq!(header(&reply, "Content-Disposition"), None);
    }

    #[tokio::test]
    async fn test_serve_binary_file_with_range() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blob.bin"), b"0123456789").unwrap();
        let resolver = FileResolver::new(dir.path());
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::default();
        let request = request();
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);
        let response = RouteResponse {
            file_path: "blob.bin".into(),
            ..Default::default()
        };

        let reply = serve(&resolver, &response, Some("bytes=2-4"), &scope)
            .await
            .unwrap();
        assert_eq!(reply.status, Some(206));
        assert_eq!(reply.body, Bytes::from_static(b"234"));
        assert_eq!(header(&reply, "Content-Range"), Some("bytes 2-4/10"));
        assert_eq!(
            header(&reply, "Content-Disposition"),
            Some("attachment; filename=\"blob.bin\"")
        );

        let unsatisfiable = serve(&resolver, &response, Some("bytes=20-"), &scope)
            .await
            .unwrap();
        assert_eq!(unsatisfiable.status, Some(416));
    }

    #[tokio::test]
    async fn test_missing_file_is_a_serving_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(dir.path());
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::default();
        let request = request();
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);
        let response = RouteResponse {
            file_path: "missing.json".into(),
            ..Default::default()
        };
        let err = serve(&resolver, &response, None, &scope).await.unwrap_err();
        assert!(matches!(err, EngineError::FileServing(_)));
    }
}
