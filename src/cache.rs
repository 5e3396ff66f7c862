//! Filesystem cache for query results, keyed by canonical query text.
//!
//! A CSV manifest maps raw queries to JSON filenames; the cache directory
//! holds one envelope per filename. Reads are miss-tolerant (any I/O or parse
//! problem is a miss), writes are atomic (temp file + rename) and re-validated
//! immediately, so a failed write never leaves a silently-corrupt entry that
//! is treated as accepted.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use crate::canon::{canonicalize, NORM_VERSION};

/// One validated manifest row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    /// CSV row number (header is row 1, data starts at 2).
    pub line_no: usize,
    pub query_raw: String,
    pub query_norm: String,
    /// Filename exactly as in the manifest.
    pub filename: String,
}

/// Persisted cache record wrapping a result with provenance metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub query_raw: String,
    pub query_norm: String,
    pub generated_at: DateTime<Utc>,
    pub meta: EnvelopeMeta,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub source: String,
    pub file: String,
    pub norm_version: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Envelope {
    pub fn new(row: &QueryRow, source: &str, result: Value) -> Self {
        Envelope {
            query_raw: row.query_raw.clone(),
            query_norm: row.query_norm.clone(),
            generated_at: Utc::now(),
            meta: EnvelopeMeta {
                source: source.to_string(),
                file: row.filename.clone(),
                norm_version: NORM_VERSION.to_string(),
                extra: serde_json::Map::new(),
            },
            result,
        }
    }
}

/// Filename rules: allowed chars, `.json` ending, length, safe path.
pub fn validate_filename(name: &str) -> bool {
    if name.len() > 80 {
        return false;
    }
    if !name.ends_with(".json") {
        return false;
    }
    if name.starts_with('.') || name.contains("..") {
        return false;
    }
    name.strip_suffix(".json")
        .map(|stem| {
            !stem.is_empty()
                && stem
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        })
        .unwrap_or(false)
}

/// Read the manifest CSV into validated rows.
///
/// Fails the whole load, naming the offending row, on: empty query or file,
/// invalid filename, duplicate canonical key, duplicate filename.
pub fn read_rows(csv_path: &Path) -> Result<Vec<QueryRow>> {
    let content = std::fs::read_to_string(csv_path)
        .with_context(|| format!("Failed to read manifest: {}", csv_path.display()))?;
    // Tolerate a UTF-8 BOM from spreadsheet exports
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let query_col = headers
        .iter()
        .position(|h| h.trim() == "query")
        .context("Manifest is missing a 'query' column")?;
    let file_col = headers
        .iter()
        .position(|h| h.trim() == "file")
        .context("Manifest is missing a 'file' column")?;

    let mut rows: Vec<QueryRow> = Vec::new();
    let mut seen_keys: HashMap<String, usize> = HashMap::new();
    let mut seen_files: HashMap<String, usize> = HashMap::new();

    for (i, record) in reader.records().enumerate() {
        let line_no = i + 2; // header is row 1
        let record = record.with_context(|| format!("Row {line_no}: malformed CSV record"))?;

        let query_raw = record.get(query_col).unwrap_or("").trim().to_string();
        let filename = record.get(file_col).unwrap_or("").trim().to_string();

        if query_raw.is_empty() || filename.is_empty() {
            bail!("Row {line_no}: empty query or file");
        }
        if !validate_filename(&filename) {
            bail!("Row {line_no}: invalid filename '{filename}'");
        }

        let key = canonicalize(&query_raw);
        if let Some(first) = seen_keys.get(&key) {
            bail!("Row {line_no}: duplicate canonical key '{key}' (first seen at row {first})");
        }
        if let Some(first) = seen_files.get(&filename) {
            bail!("Row {line_no}: duplicate file name '{filename}' (first seen at row {first})");
        }

        seen_keys.insert(key.clone(), line_no);
        seen_files.insert(filename.clone(), line_no);
        rows.push(QueryRow {
            line_no,
            query_raw,
            query_norm: key,
            filename,
        });
    }

    Ok(rows)
}

/// Load the manifest into `{canonical_key -> filename}`.
pub fn load_index(csv_path: &Path) -> Result<HashMap<String, String>> {
    let rows = read_rows(csv_path)?;
    let index = rows
        .into_iter()
        .map(|r| (r.query_norm, r.filename))
        .collect::<HashMap<_, _>>();
    tracing::info!(entries = index.len(), path = %csv_path.display(), "loaded query manifest");
    Ok(index)
}

/// Return the cached result for a canonical key, or `None`.
///
/// Misses: key absent from the manifest, backing file missing, or any
/// I/O/parse error. A stored `query_norm` that disagrees with the key still
/// returns the stored result; the cache is advisory, not a correctness
/// oracle.
pub fn read_cached(dir: &Path, canonical_key: &str, index: &HashMap<String, String>) -> Option<Value> {
    let filename = index.get(canonical_key)?;
    let path = dir.join(filename);
    if !path.exists() {
        return None;
    }

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "cache read failed, treating as miss");
            return None;
        }
    };
    let envelope: Value = match serde_json::from_str(&content) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "cache entry unparseable, treating as miss");
            return None;
        }
    };
    if envelope.get("query_norm").and_then(|v| v.as_str()) != Some(canonical_key) {
        tracing::debug!(path = %path.display(), "cached query_norm differs from lookup key");
    }
    envelope.get("result").cloned()
}

/// Atomically write an envelope to `dir/filename` and re-open it to validate
/// the JSON on disk. Returns the full path.
pub fn write_cache(dir: &Path, filename: &str, envelope: &Envelope) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(filename);
    let tmp = dir.join(format!("{filename}.tmp"));

    // Basic sanity before writing
    if !envelope.query_norm.is_empty() && !envelope.result.is_object() {
        bail!("Envelope missing or invalid 'result' object");
    }

    let body = serde_json::to_string_pretty(envelope)?;
    std::fs::write(&tmp, body)
        .with_context(|| format!("Failed to write temp cache file: {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to rename cache file into place: {}", path.display()))?;

    // Re-open to catch partial writes; a corrupt entry must surface here,
    // not on some later read
    let written = std::fs::read_to_string(&path)?;
    serde_json::from_str::<Value>(&written)
        .with_context(|| format!("Cache file failed post-write validation: {}", path.display()))?;

    Ok(path)
}

/// Precompute cache files for manifest rows using `fetch(query_raw)`.
///
/// Runs sequentially; rows with existing files are skipped unless
/// `overwrite`. A fetch or write error propagates immediately — callers that
/// want per-row isolation wrap each row themselves (the CLI prewarm command
/// does).
///
/// Returns `(total, written, skipped)`.
pub async fn prewarm<F, Fut>(
    dir: &Path,
    rows: &[QueryRow],
    mut fetch: F,
    overwrite: bool,
    limit: Option<usize>,
) -> Result<(usize, usize, usize)>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    std::fs::create_dir_all(dir)?;

    let mut total = 0usize;
    let mut written = 0usize;
    let mut skipped = 0usize;

    for row in rows {
        if let Some(limit) = limit {
            if total >= limit {
                break;
            }
        }
        total += 1;

        let path = dir.join(&row.filename);
        if path.exists() && !overwrite {
            skipped += 1;
            continue;
        }

        let result = fetch(row.query_raw.clone()).await?;
        let envelope = Envelope::new(row, "prewarm_from_file", result);
        write_cache(dir, &row.filename, &envelope)?;
        written += 1;
    }

    Ok((total, written, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_manifest(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("queries.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn sample_row(filename: &str) -> QueryRow {
        QueryRow {
            line_no: 2,
            query_raw: "Um casamento à tarde".to_string(),
            query_norm: canonicalize("Um casamento à tarde"),
            filename: filename.to_string(),
        }
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("wedding_day.json"));
        assert!(validate_filename("q-01.v2.json"));
        assert!(!validate_filename("../x.json"));
        assert!(!validate_filename(".hidden.json"));
        assert!(!validate_filename("nope.txt"));
        assert!(!validate_filename(".json"));
        assert!(!validate_filename("has space.json"));
        let long = format!("{}.json", "a".repeat(81));
        assert!(!validate_filename(&long));
    }

    #[test]
    fn test_read_rows_happy_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_manifest(
            tmp.path(),
            "query,file\nUm casamento à tarde,wedding.json\nLook para praia,beach.json\n",
        );
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line_no, 2);
        assert_eq!(rows[0].query_norm, "um casamento a tarde");
        assert_eq!(rows[1].filename, "beach.json");
    }

    #[test]
    fn test_read_rows_rejects_traversal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_manifest(tmp.path(), "query,file\ncasamento,../x.json\n");
        let err = read_rows(&path).unwrap_err().to_string();
        assert!(err.contains("Row 2"), "error was: {err}");
        assert!(err.contains("invalid filename"), "error was: {err}");
    }

    #[test]
    fn test_read_rows_rejects_long_filename() {
        let tmp = tempfile::TempDir::new().unwrap();
        let long = format!("{}.json", "a".repeat(81));
        let path = write_manifest(tmp.path(), &format!("query,file\ncasamento,{long}\n"));
        let err = read_rows(&path).unwrap_err().to_string();
        assert!(err.contains("Row 2"), "error was: {err}");
    }

    #[test]
    fn test_read_rows_rejects_duplicate_canonical_key() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_manifest(
            tmp.path(),
            "query,file\n\"Um Casamento, à Tarde!\",a.json\num casamento a tarde,b.json\n",
        );
        let err = read_rows(&path).unwrap_err().to_string();
        assert!(err.contains("Row 3"), "error was: {err}");
        assert!(err.contains("duplicate canonical key"), "error was: {err}");
        assert!(err.contains("row 2"), "error was: {err}");
    }

    #[test]
    fn test_read_rows_rejects_duplicate_filename() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_manifest(
            tmp.path(),
            "query,file\ncasamento,same.json\npraia,same.json\n",
        );
        let err = read_rows(&path).unwrap_err().to_string();
        assert!(err.contains("duplicate file name"), "error was: {err}");
    }

    #[test]
    fn test_read_rows_rejects_empty_fields() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_manifest(tmp.path(), "query,file\n,missing.json\n");
        let err = read_rows(&path).unwrap_err().to_string();
        assert!(err.contains("empty query or file"), "error was: {err}");
    }

    #[test]
    fn test_read_rows_tolerates_bom() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_manifest(tmp.path(), "\u{feff}query,file\ncasamento,a.json\n");
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let row = sample_row("wedding.json");
        let result = json!({"Vestidos": [{"product_id": 1, "name": "Vestido Midi"}]});
        let envelope = Envelope::new(&row, "test", result.clone());

        write_cache(tmp.path(), &row.filename, &envelope).unwrap();

        let mut index = HashMap::new();
        index.insert(row.query_norm.clone(), row.filename.clone());
        let cached = read_cached(tmp.path(), &row.query_norm, &index).unwrap();
        assert_eq!(cached, result);
    }

    #[test]
    fn test_read_missing_file_is_miss() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut index = HashMap::new();
        index.insert("um casamento a tarde".to_string(), "gone.json".to_string());
        assert!(read_cached(tmp.path(), "um casamento a tarde", &index).is_none());
    }

    #[test]
    fn test_read_corrupt_file_is_miss() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("bad.json"), "{not json").unwrap();
        let mut index = HashMap::new();
        index.insert("key".to_string(), "bad.json".to_string());
        assert!(read_cached(tmp.path(), "key", &index).is_none());
    }

    #[test]
    fn test_read_mismatched_norm_still_returns_result() {
        // Preserved behavior: the stored query_norm is advisory
        let tmp = tempfile::TempDir::new().unwrap();
        let row = sample_row("wedding.json");
        let envelope = Envelope::new(&row, "test", json!({"ok": true}));
        write_cache(tmp.path(), &row.filename, &envelope).unwrap();

        let mut index = HashMap::new();
        index.insert("some other key".to_string(), row.filename.clone());
        let cached = read_cached(tmp.path(), "some other key", &index).unwrap();
        assert_eq!(cached, json!({"ok": true}));
    }

    #[test]
    fn test_write_rejects_non_object_result() {
        let tmp = tempfile::TempDir::new().unwrap();
        let row = sample_row("wedding.json");
        let envelope = Envelope::new(&row, "test", json!("just a string"));
        assert!(write_cache(tmp.path(), &row.filename, &envelope).is_err());
    }

    #[tokio::test]
    async fn test_prewarm_skips_existing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rows = vec![
            QueryRow {
                line_no: 2,
                query_raw: "casamento".to_string(),
                query_norm: "casamento".to_string(),
                filename: "a.json".to_string(),
            },
            QueryRow {
                line_no: 3,
                query_raw: "praia".to_string(),
                query_norm: "praia".to_string(),
                filename: "b.json".to_string(),
            },
        ];

        // Pre-seed one file
        let envelope = Envelope::new(&rows[0], "test", json!({}));
        write_cache(tmp.path(), "a.json", &envelope).unwrap();

        let (total, written, skipped) = prewarm(
            tmp.path(),
            &rows,
            |_q| async { Ok(json!({"Vestidos": []})) },
            false,
            None,
        )
        .await
        .unwrap();

        assert_eq!((total, written, skipped), (2, 1, 1));
        assert!(tmp.path().join("b.json").exists());
    }

    #[tokio::test]
    async fn test_prewarm_propagates_fetch_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rows = vec![QueryRow {
            line_no: 2,
            query_raw: "casamento".to_string(),
            query_norm: "casamento".to_string(),
            filename: "a.json".to_string(),
        }];

        let result = prewarm(
            tmp.path(),
            &rows,
            |_q| async { anyhow::bail!("model unavailable") },
            false,
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_prewarm_respects_limit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rows: Vec<QueryRow> = (0..5)
            .map(|i| QueryRow {
                line_no: i + 2,
                query_raw: format!("query {i}"),
                query_norm: format!("query {i}"),
                filename: format!("q{i}.json"),
            })
            .collect();

        let (total, written, skipped) = prewarm(
            tmp.path(),
            &rows,
            |_q| async { Ok(json!({})) },
            false,
            Some(2),
        )
        .await
        .unwrap();
        assert_eq!((total, written, skipped), (2, 2, 0));
    }
}
