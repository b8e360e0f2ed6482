//! On-disk document cache shared by every fetch path.
//!
//! Layout:
//! - `{root}/index/{id:010}.json` per-registrant index documents, freshness governed
//! - `{root}/index/{id:010}-submissions-NNN.json` overflow continuations
//! - `{root}/web/{sha256(url)}.txt` any other fetched document, presence is a hit
//!
//! Writers never lock. Every write lands in a private temp file that is then
//! renamed over the entry, so readers see either the old or the new document,
//! never a truncated one. Rewriting identical content is harmless and a stale
//! entry that loses a race is still usable data.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::pad_registrant_id;

#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    freshness: Duration,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            root: root.into(),
            freshness,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self, registrant_id: &str) -> PathBuf {
        self.root
            .join("index")
            .join(format!("{}.json", pad_registrant_id(registrant_id)))
    }

    /// Overflow names arrive as `CIK0000000000-submissions-001.json`; the cache drops the prefix.
    pub fn overflow_path(&self, file_name: &str) -> PathBuf {
        let trimmed = file_name.trim().trim_start_matches("CIK");
        self.root.join("index").join(trimmed)
    }

    pub fn web_path(&self, url: &str) -> PathBuf {
        self.root.join("web").join(format!("{}.txt", hash_url(url)))
    }

    pub fn read_index(&self, registrant_id: &str) -> Option<String> {
        self.read_index_at(registrant_id, SystemTime::now())
    }

    /// Entries whose age reaches the freshness window count as a miss.
    pub fn read_index_at(&self, registrant_id: &str, now: SystemTime) -> Option<String> {
        let path = self.index_path(registrant_id);
        let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok()?;
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age >= self.freshness {
            debug!(registrant_id, age_secs = age.as_secs(), "index cache entry is stale");
            return None;
        }
        read_lossy(&path)
    }

    pub fn write_index(&self, registrant_id: &str, content: &str) -> io::Result<()> {
        replace_file(&self.index_path(registrant_id), content.as_bytes())
    }

    pub fn read_overflow(&self, file_name: &str) -> Option<String> {
        read_lossy(&self.overflow_path(file_name))
    }

    pub fn write_overflow(&self, file_name: &str, content: &[u8]) -> io::Result<()> {
        replace_file(&self.overflow_path(file_name), content)
    }

    pub fn read_web_bytes(&self, url: &str) -> Option<Vec<u8>> {
        fs::read(self.web_path(url)).ok()
    }

    pub fn read_web(&self, url: &str) -> Option<String> {
        self.read_web_bytes(url)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_web(&self, url: &str, content: &[u8]) -> io::Result<()> {
        replace_file(&self.web_path(url), content)
    }
}

pub fn hash_url(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn read_lossy(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `content` beside `path` under a name unique to this writer, then
/// rename it into place.
pub(crate) fn replace_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no parent: {}", path.display()),
        )
    })?;
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {}", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(format!(
        ".{}.{}.tmp",
        process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let temp_path = parent.join(temp_name);
    if let Err(error) = fs::write(&temp_path, content) {
        let _ = fs::remove_file(&temp_path);
        return Err(error);
    }
    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, SystemTime};

    use tempfile::tempdir;

    use super::{DiskCache, hash_url};

    const HOUR: Duration = Duration::from_secs(3600);

    fn backdate(path: &std::path::Path, age: Duration) {
        let file = fs::File::options().write(true).open(path).expect("open cached file");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    #[test]
    fn index_entry_older_than_window_is_a_miss() {
        let temp = tempdir().expect("tempdir");
        let cache = DiskCache::new(temp.path(), 6 * HOUR);
        cache.write_index("1174610", "{\"cik\":\"1174610\"}").expect("write");
        backdate(&cache.index_path("1174610"), 7 * HOUR);
        assert!(cache.read_index("1174610").is_none());
    }

    #[test]
    fn index_entry_inside_window_is_a_hit() {
        let temp = tempdir().expect("tempdir");
        let cache = DiskCache::new(temp.path(), 6 * HOUR);
        cache.write_index("1174610", "{\"cik\":\"1174610\"}").expect("write");
        backdate(&cache.index_path("1174610"), 5 * HOUR);
        assert_eq!(
            cache.read_index("1174610").as_deref(),
            Some("{\"cik\":\"1174610\"}")
        );
    }

    #[test]
    fn index_layout_uses_ten_digit_id() {
        let temp = tempdir().expect("tempdir");
        let cache = DiskCache::new(temp.path(), HOUR);
        assert_eq!(
            cache.index_path("826732"),
            temp.path().join("index").join("0000826732.json")
        );
        assert_eq!(
            cache.overflow_path("CIK0000826732-submissions-001.json"),
            temp.path()
                .join("index")
                .join("0000826732-submissions-001.json")
        );
    }

    #[test]
    fn web_entries_have_no_ttl() {
        let temp = tempdir().expect("tempdir");
        let cache = DiskCache::new(temp.path(), HOUR);
        let url = "https://www.sec.gov/Archives/edgar/data/1/000000000125000001.txt";
        assert!(cache.read_web(url).is_none());
        cache.write_web(url, b"<SEC-DOCUMENT>").expect("write");
        backdate(&cache.web_path(url), 1000 * HOUR);
        assert_eq!(cache.read_web(url).as_deref(), Some("<SEC-DOCUMENT>"));
        assert!(
            cache
                .web_path(url)
                .to_string_lossy()
                .ends_with(&format!("{}.txt", hash_url(url)))
        );
    }

    #[test]
    fn concurrent_rewrites_never_expose_a_partial_document() {
        let temp = tempdir().expect("tempdir");
        let cache = DiskCache::new(temp.path(), HOUR);
        let url = "https://www.sec.gov/Archives/edgar/data/1/big.txt";
        let body = "x".repeat(512 * 1024);
        cache.write_web(url, body.as_bytes()).expect("seed");

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        cache.write_web(url, body.as_bytes()).expect("rewrite");
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..200 {
                    let seen = cache.read_web(url).expect("entry stays present");
                    assert_eq!(seen.len(), body.len());
                }
            });
        });

        let leftovers = fs::read_dir(temp.path().join("web"))
            .expect("list web dir")
            .count();
        assert_eq!(leftovers, 1, "temp files are renamed away");
    }

    #[test]
    fn url_hash_is_full_sha256_hex() {
        let hashed = hash_url("https://example.org");
        assert_eq!(hashed.len(), 64);
        assert!(hashed.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
