//! File lifecycle management for encoding artifacts.
//!
//! One book owns a directory tree `<root>/book/<book_id>/{uploads,media,temp,archive}`.
//! The manager derives canonical paths for a chapter's original, encoded and
//! temporary files, validates file integrity before and after encoding, and
//! cleans up temporary and stale artifacts. The temp directory is shared by
//! every chapter of a book, so per-chapter cleanup filters on the chapter id
//! embedded in temp file names.
//!
//! Filesystem errors never cross the contract boundary as panics: sweeps log
//! and skip, move operations report a boolean, and integrity checks return a
//! typed error for the caller to judge.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

const BOOKS_DIR: &str = "book";
const UPLOADS_DIR: &str = "uploads";
const MEDIA_DIR: &str = "media";
const TEMP_DIR: &str = "temp";
const ARCHIVE_DIR: &str = "archive";

/// Placeholder used when sanitization leaves nothing of a filename.
const FALLBACK_FILENAME: &str = "unnamed_audio";

/// Error type for file integrity validation.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Empty file: {0}")]
    Empty(PathBuf),

    #[error("File unreadable: {0}")]
    Unreadable(std::io::Error),
}

/// Canonical paths for one chapter's encoding artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterPaths {
    pub uploads_dir: PathBuf,
    pub media_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub original_file: PathBuf,
    pub encoded_file: PathBuf,
    pub temp_original: PathBuf,
    pub temp_encoded: PathBuf,
}

/// Snapshot of one file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub created_at_ms: i64,
    pub exists: bool,
}

/// Filesystem view of one chapter's encoding artifacts, derived on demand.
#[derive(Debug, Clone, Default)]
pub struct EncodingFileSet {
    pub original_file: Option<FileInfo>,
    pub encoded_file: Option<FileInfo>,
    pub temp_files: Vec<FileInfo>,
    pub total_size: u64,
}

/// Aggregate storage statistics across all books.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageStats {
    pub total_books: usize,
    pub total_original_files: usize,
    pub total_encoded_files: usize,
    pub total_temp_files: usize,
    pub original_size: u64,
    pub encoded_size: u64,
    pub temp_size: u64,
    /// original bytes / encoded bytes, when both are non-zero.
    pub compression_ratio: f64,
}

/// Byte usage per storage category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub uploads: u64,
    pub media: u64,
    pub temp: u64,
    pub archive: u64,
    pub total: u64,
}

/// Outcome of deleting a chapter's files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub encoded_removed: bool,
    pub original_removed: bool,
    pub temp_removed: usize,
}

/// Replace unsafe path characters and whitespace, collapse separator runs,
/// and strip leading/trailing dots and underscores. An empty result falls
/// back to a fixed placeholder.
pub fn sanitize_filename(filename: &str) -> String {
    let mut replaced = String::with_capacity(filename.len());
    for c in filename.chars() {
        match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => replaced.push('_'),
            c if c.is_whitespace() => replaced.push('_'),
            c => replaced.push(c),
        }
    }

    let mut collapsed = String::with_capacity(replaced.len());
    let mut prev_underscore = false;
    for c in replaced.chars() {
        if c == '_' {
            if !prev_underscore {
                collapsed.push(c);
            }
            prev_underscore = true;
        } else {
            collapsed.push(c);
            prev_underscore = false;
        }
    }

    let trimmed = collapsed.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Manages the on-disk lifecycle of encoding artifacts under one storage root.
#[derive(Debug, Clone)]
pub struct EncodingFileManager {
    root: PathBuf,
    output_format: String,
}

impl EncodingFileManager {
    pub fn new<P: Into<PathBuf>>(root: P, output_format: &str) -> Self {
        Self {
            root: root.into(),
            output_format: output_format.to_string(),
        }
    }

    fn books_root(&self) -> PathBuf {
        self.root.join(BOOKS_DIR)
    }

    fn book_dir(&self, book_id: &str) -> PathBuf {
        self.books_root().join(book_id)
    }

    /// Derive the canonical path set for a chapter. Pure function of the
    /// inputs and the sanitization rules.
    pub fn paths_for(&self, book_id: &str, chapter_id: &str, filename: &str) -> ChapterPaths {
        let safe = sanitize_filename(filename);
        let stem = Path::new(&safe)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| safe.clone());

        let book_dir = self.book_dir(book_id);
        let uploads_dir = book_dir.join(UPLOADS_DIR);
        let media_dir = book_dir.join(MEDIA_DIR);
        let temp_dir = book_dir.join(TEMP_DIR);

        ChapterPaths {
            original_file: uploads_dir.join(&safe),
            encoded_file: media_dir.join(format!("{}.{}", stem, self.output_format)),
            temp_original: temp_dir.join(format!("temp_{}_{}", chapter_id, safe)),
            temp_encoded: temp_dir.join(format!(
                "temp_{}_{}.{}",
                chapter_id, stem, self.output_format
            )),
            uploads_dir,
            media_dir,
            temp_dir,
        }
    }

    /// Idempotently create a book's working directories.
    pub fn ensure_directories(&self, book_id: &str) -> std::io::Result<()> {
        let book_dir = self.book_dir(book_id);
        for dir in [UPLOADS_DIR, MEDIA_DIR, TEMP_DIR] {
            fs::create_dir_all(book_dir.join(dir))?;
        }
        Ok(())
    }

    /// Snapshot one file's size, creation time and existence.
    pub fn file_info(&self, path: &Path) -> FileInfo {
        match fs::metadata(path) {
            Ok(metadata) => FileInfo {
                path: path.to_path_buf(),
                size: metadata.len(),
                created_at_ms: metadata
                    .created()
                    .or_else(|_| metadata.modified())
                    .map(system_time_ms)
                    .unwrap_or(0),
                exists: true,
            },
            Err(_) => FileInfo {
                path: path.to_path_buf(),
                size: 0,
                created_at_ms: 0,
                exists: false,
            },
        }
    }

    /// Collect the filesystem view of one chapter's artifacts.
    pub fn file_set(&self, book_id: &str, chapter_id: &str, filename: &str) -> EncodingFileSet {
        let paths = self.paths_for(book_id, chapter_id, filename);

        let original = self.file_info(&paths.original_file);
        let encoded = self.file_info(&paths.encoded_file);

        let mut temp_files = Vec::new();
        if let Ok(entries) = fs::read_dir(&paths.temp_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.contains(chapter_id) {
                    temp_files.push(self.file_info(&entry.path()));
                }
            }
        }

        let total_size = original.size
            + encoded.size
            + temp_files.iter().map(|f| f.size).sum::<u64>();

        EncodingFileSet {
            original_file: original.exists.then_some(original),
            encoded_file: encoded.exists.then_some(encoded),
            temp_files,
            total_size,
        }
    }

    /// Validate that a file exists, is non-empty and is readable (first-KiB
    /// read probe).
    pub fn validate_integrity(&self, path: &Path) -> Result<(), IntegrityError> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Err(IntegrityError::NotFound(path.to_path_buf())),
        };

        if metadata.len() == 0 {
            return Err(IntegrityError::Empty(path.to_path_buf()));
        }

        let mut file = fs::File::open(path).map_err(IntegrityError::Unreadable)?;
        let mut probe = [0u8; 1024];
        file.read(&mut probe).map_err(IntegrityError::Unreadable)?;

        Ok(())
    }

    /// Delete the temp files belonging to one chapter, leaving other
    /// chapters' temp files in the shared directory untouched.
    pub fn cleanup_temp(&self, book_id: &str, chapter_id: &str) -> usize {
        let temp_dir = self.book_dir(book_id).join(TEMP_DIR);

        let entries = match fs::read_dir(&temp_dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.contains(chapter_id) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to remove temp file");
                }
            }
        }
        removed
    }

    /// Sweep every book's temp directory, removing files older than the age
    /// threshold regardless of chapter.
    pub fn cleanup_old_temp(&self, max_age_hours: u64) -> usize {
        let books = match fs::read_dir(self.books_root()) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let cutoff = SystemTime::now() - std::time::Duration::from_secs(max_age_hours * 3600);
        let mut removed = 0;

        for book in books.flatten() {
            let temp_dir = book.path().join(TEMP_DIR);
            let entries = match fs::read_dir(&temp_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for entry in entries.flatten() {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or_else(|_| SystemTime::now());

                if modified < cutoff {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            warn!(path = %entry.path().display(), error = %e, "failed to remove stale temp file");
                        }
                    }
                }
            }
        }
        removed
    }

    /// Move a chapter's original file into the book's archive directory.
    pub fn archive_original(&self, book_id: &str, chapter_id: &str, filename: &str) -> bool {
        let paths = self.paths_for(book_id, chapter_id, filename);
        let archive_dir = self.book_dir(book_id).join(ARCHIVE_DIR);

        if !paths.original_file.exists() {
            return false;
        }
        if let Err(e) = fs::create_dir_all(&archive_dir) {
            warn!(dir = %archive_dir.display(), error = %e, "failed to create archive directory");
            return false;
        }

        let archive_path = archive_dir.join(sanitize_filename(filename));
        move_file(&paths.original_file, &archive_path)
    }

    /// Move a chapter's original file back from the archive into uploads.
    pub fn restore_from_archive(&self, book_id: &str, chapter_id: &str, filename: &str) -> bool {
        let paths = self.paths_for(book_id, chapter_id, filename);
        let archive_path = self
            .book_dir(book_id)
            .join(ARCHIVE_DIR)
            .join(sanitize_filename(filename));

        if !archive_path.exists() {
            return false;
        }
        if let Err(e) = fs::create_dir_all(&paths.uploads_dir) {
            warn!(dir = %paths.uploads_dir.display(), error = %e, "failed to create uploads directory");
            return false;
        }

        move_file(&archive_path, &paths.original_file)
    }

    /// Delete a chapter's encoded file, optionally its original, and its
    /// temp files.
    pub fn delete_chapter_files(
        &self,
        book_id: &str,
        chapter_id: &str,
        filename: &str,
        keep_original: bool,
    ) -> DeleteOutcome {
        let paths = self.paths_for(book_id, chapter_id, filename);
        let mut outcome = DeleteOutcome::default();

        if paths.encoded_file.exists() {
            match fs::remove_file(&paths.encoded_file) {
                Ok(()) => outcome.encoded_removed = true,
                Err(e) => {
                    warn!(path = %paths.encoded_file.display(), error = %e, "failed to delete encoded file");
                }
            }
        }

        if !keep_original && paths.original_file.exists() {
            match fs::remove_file(&paths.original_file) {
                Ok(()) => outcome.original_removed = true,
                Err(e) => {
                    warn!(path = %paths.original_file.display(), error = %e, "failed to delete original file");
                }
            }
        }

        outcome.temp_removed = self.cleanup_temp(book_id, chapter_id);
        outcome
    }

    /// Aggregate file counts and byte sizes across all books.
    pub fn storage_stats(&self) -> StorageStats {
        let mut stats = StorageStats::default();

        let books = match fs::read_dir(self.books_root()) {
            Ok(entries) => entries,
            Err(_) => return stats,
        };

        for book in books.flatten() {
            stats.total_books += 1;
            let book_path = book.path();

            let (uploads_count, uploads_size) = count_files(&book_path.join(UPLOADS_DIR));
            stats.total_original_files += uploads_count;
            stats.original_size += uploads_size;

            let (media_count, media_size) = count_files(&book_path.join(MEDIA_DIR));
            stats.total_encoded_files += media_count;
            stats.encoded_size += media_size;

            let (temp_count, temp_size) = count_files(&book_path.join(TEMP_DIR));
            stats.total_temp_files += temp_count;
            stats.temp_size += temp_size;
        }

        if stats.original_size > 0 && stats.encoded_size > 0 {
            stats.compression_ratio = stats.original_size as f64 / stats.encoded_size as f64;
        }

        stats
    }

    /// Byte usage per category for one book, or summed over all books.
    pub fn disk_usage(&self, book_id: Option<&str>) -> DiskUsage {
        match book_id {
            Some(book_id) => {
                let book_path = self.book_dir(book_id);
                let usage = DiskUsage {
                    uploads: dir_size(&book_path.join(UPLOADS_DIR)),
                    media: dir_size(&book_path.join(MEDIA_DIR)),
                    temp: dir_size(&book_path.join(TEMP_DIR)),
                    archive: dir_size(&book_path.join(ARCHIVE_DIR)),
                    total: 0,
                };
                DiskUsage {
                    total: usage.uploads + usage.media + usage.temp + usage.archive,
                    ..usage
                }
            }
            None => {
                let mut total = DiskUsage::default();
                if let Ok(books) = fs::read_dir(self.books_root()) {
                    for book in books.flatten() {
                        let name = book.file_name().to_string_lossy().into_owned();
                        let usage = self.disk_usage(Some(&name));
                        total.uploads += usage.uploads;
                        total.media += usage.media;
                        total.temp += usage.temp;
                        total.archive += usage.archive;
                        total.total += usage.total;
                    }
                }
                total
            }
        }
    }
}

/// Move a file, falling back to copy-and-remove across filesystems.
fn move_file(from: &Path, to: &Path) -> bool {
    if fs::rename(from, to).is_ok() {
        return true;
    }
    match fs::copy(from, to).and_then(|_| fs::remove_file(from)) {
        Ok(()) => true,
        Err(e) => {
            warn!(from = %from.display(), to = %to.display(), error = %e, "failed to move file");
            false
        }
    }
}

/// Count regular files and their total size directly under a directory.
fn count_files(dir: &Path) -> (usize, u64) {
    let mut count = 0;
    let mut size = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    count += 1;
                    size += metadata.len();
                }
            }
        }
    }
    (count, size)
}

/// Recursive directory size in bytes.
fn dir_size(dir: &Path) -> u64 {
    if !dir.exists() {
        return 0;
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

fn system_time_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn make_manager(root: &Path) -> EncodingFileManager {
        EncodingFileManager::new(root, "m4a")
    }

    fn write_file(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("chapter 01.wav"), "chapter_01.wav");
        assert_eq!(sanitize_filename("a<b>c:d.mp3"), "a_b_c_d.mp3");
        assert_eq!(sanitize_filename("  spaced   out .wav"), "spaced_out_.wav");
        assert_eq!(sanitize_filename("___x___"), "x");
        assert_eq!(sanitize_filename("..hidden.."), "hidden");
        assert_eq!(sanitize_filename(""), "unnamed_audio");
        assert_eq!(sanitize_filename("***"), "unnamed_audio");
    }

    #[test]
    fn test_sanitize_collapses_runs() {
        assert_eq!(sanitize_filename("a  \t b.wav"), "a_b.wav");
        assert_eq!(sanitize_filename("a//b\\\\c.wav"), "a_b_c.wav");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Sanitization is idempotent and never yields forbidden characters.
        #[test]
        fn prop_sanitize_idempotent(input in "\\PC{0,40}") {
            let once = sanitize_filename(&input);
            let twice = sanitize_filename(&once);
            prop_assert_eq!(&once, &twice);
            prop_assert!(!once.is_empty());
            for c in once.chars() {
                prop_assert!(!matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'));
                prop_assert!(!c.is_whitespace());
            }
        }

        // Path derivation is a pure function: identical inputs yield
        // identical path sets.
        #[test]
        fn prop_paths_for_deterministic(
            book in "[a-z0-9-]{1,16}",
            chapter in "[a-z0-9-]{1,16}",
            filename in "[a-zA-Z0-9 ._-]{1,30}",
        ) {
            let manager = EncodingFileManager::new("/srv/storage", "m4a");
            let first = manager.paths_for(&book, &chapter, &filename);
            let second = manager.paths_for(&book, &chapter, &filename);
            prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn test_paths_for_layout() {
        let manager = EncodingFileManager::new("/srv/storage", "m4a");
        let paths = manager.paths_for("book-9", "ch-3", "intro part 1.wav");

        assert_eq!(
            paths.uploads_dir,
            PathBuf::from("/srv/storage/book/book-9/uploads")
        );
        assert_eq!(
            paths.original_file,
            PathBuf::from("/srv/storage/book/book-9/uploads/intro_part_1.wav")
        );
        assert_eq!(
            paths.encoded_file,
            PathBuf::from("/srv/storage/book/book-9/media/intro_part_1.m4a")
        );
        assert_eq!(
            paths.temp_original,
            PathBuf::from("/srv/storage/book/book-9/temp/temp_ch-3_intro_part_1.wav")
        );
        assert_eq!(
            paths.temp_encoded,
            PathBuf::from("/srv/storage/book/book-9/temp/temp_ch-3_intro_part_1.m4a")
        );
    }

    #[test]
    fn test_ensure_directories_idempotent() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());

        manager.ensure_directories("book-1").unwrap();
        manager.ensure_directories("book-1").unwrap();

        for dir in ["uploads", "media", "temp"] {
            assert!(tmp.path().join("book/book-1").join(dir).is_dir());
        }
    }

    #[test]
    fn test_validate_integrity() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());

        let missing = tmp.path().join("missing.wav");
        assert!(matches!(
            manager.validate_integrity(&missing),
            Err(IntegrityError::NotFound(_))
        ));

        let empty = tmp.path().join("empty.wav");
        write_file(&empty, b"");
        assert!(matches!(
            manager.validate_integrity(&empty),
            Err(IntegrityError::Empty(_))
        ));

        let valid = tmp.path().join("valid.wav");
        write_file(&valid, b"RIFF....WAVEfmt data");
        assert!(manager.validate_integrity(&valid).is_ok());
    }

    #[test]
    fn test_integrity_error_text_carries_not_found_cue() {
        let error = IntegrityError::NotFound(PathBuf::from("/x.wav"));
        assert!(error.to_string().to_lowercase().contains("not found"));
    }

    #[test]
    fn test_cleanup_temp_is_scoped_to_chapter() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        manager.ensure_directories("book-1").unwrap();

        let temp_dir = tmp.path().join("book/book-1/temp");
        let a1 = temp_dir.join("temp_ch-a_one.wav");
        let a2 = temp_dir.join("temp_ch-a_one.m4a");
        let b1 = temp_dir.join("temp_ch-b_two.wav");
        write_file(&a1, b"aaaa");
        write_file(&a2, b"aa");
        write_file(&b1, b"bbbbbb");

        let removed = manager.cleanup_temp("book-1", "ch-a");

        assert_eq!(removed, 2);
        assert!(!a1.exists());
        assert!(!a2.exists());
        // The sibling chapter's temp file is untouched, same size
        assert!(b1.exists());
        assert_eq!(fs::metadata(&b1).unwrap().len(), 6);
    }

    #[test]
    fn test_cleanup_temp_missing_dir_is_zero() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        assert_eq!(manager.cleanup_temp("no-book", "no-chapter"), 0);
    }

    #[test]
    fn test_cleanup_old_temp_by_age() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        manager.ensure_directories("book-1").unwrap();
        manager.ensure_directories("book-2").unwrap();

        write_file(&tmp.path().join("book/book-1/temp/temp_x.wav"), b"x");
        write_file(&tmp.path().join("book/book-2/temp/temp_y.wav"), b"y");

        // Fresh files survive a generous threshold
        assert_eq!(manager.cleanup_old_temp(24), 0);

        // With a zero threshold everything already written is stale
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(manager.cleanup_old_temp(0), 2);
        assert!(!tmp.path().join("book/book-1/temp/temp_x.wav").exists());
    }

    #[test]
    fn test_archive_and_restore_round_trip() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        manager.ensure_directories("book-1").unwrap();

        let original = tmp.path().join("book/book-1/uploads/ch1.wav");
        write_file(&original, b"audio bytes");

        assert!(manager.archive_original("book-1", "ch-1", "ch1.wav"));
        assert!(!original.exists());
        assert!(tmp.path().join("book/book-1/archive/ch1.wav").exists());

        // Archiving again has nothing to move
        assert!(!manager.archive_original("book-1", "ch-1", "ch1.wav"));

        assert!(manager.restore_from_archive("book-1", "ch-1", "ch1.wav"));
        assert!(original.exists());
        assert_eq!(fs::read(&original).unwrap(), b"audio bytes");
        assert!(!manager.restore_from_archive("book-1", "ch-1", "ch1.wav"));
    }

    #[test]
    fn test_file_set() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        manager.ensure_directories("book-1").unwrap();

        write_file(&tmp.path().join("book/book-1/uploads/ch1.wav"), b"12345678");
        write_file(&tmp.path().join("book/book-1/media/ch1.m4a"), b"1234");
        write_file(
            &tmp.path().join("book/book-1/temp/temp_ch-1_ch1.wav"),
            b"12",
        );
        write_file(
            &tmp.path().join("book/book-1/temp/temp_ch-2_other.wav"),
            b"zz",
        );

        let set = manager.file_set("book-1", "ch-1", "ch1.wav");

        assert_eq!(set.original_file.as_ref().unwrap().size, 8);
        assert_eq!(set.encoded_file.as_ref().unwrap().size, 4);
        assert_eq!(set.temp_files.len(), 1);
        assert_eq!(set.total_size, 8 + 4 + 2);
    }

    #[test]
    fn test_file_set_missing_files_are_none() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());

        let set = manager.file_set("book-1", "ch-1", "ch1.wav");
        assert!(set.original_file.is_none());
        assert!(set.encoded_file.is_none());
        assert!(set.temp_files.is_empty());
        assert_eq!(set.total_size, 0);
    }

    #[test]
    fn test_storage_stats_and_compression_ratio() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        manager.ensure_directories("book-1").unwrap();
        manager.ensure_directories("book-2").unwrap();

        write_file(&tmp.path().join("book/book-1/uploads/a.wav"), &[0u8; 1000]);
        write_file(&tmp.path().join("book/book-1/media/a.m4a"), &[0u8; 100]);
        write_file(&tmp.path().join("book/book-2/uploads/b.wav"), &[0u8; 500]);
        write_file(&tmp.path().join("book/book-2/temp/t.wav"), &[0u8; 50]);

        let stats = manager.storage_stats();

        assert_eq!(stats.total_books, 2);
        assert_eq!(stats.total_original_files, 2);
        assert_eq!(stats.total_encoded_files, 1);
        assert_eq!(stats.total_temp_files, 1);
        assert_eq!(stats.original_size, 1500);
        assert_eq!(stats.encoded_size, 100);
        assert_eq!(stats.temp_size, 50);
        assert!((stats.compression_ratio - 15.0).abs() < 0.001);
    }

    #[test]
    fn test_storage_stats_empty_root() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        assert_eq!(manager.storage_stats(), StorageStats::default());
    }

    #[test]
    fn test_disk_usage_per_book_and_total() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        manager.ensure_directories("book-1").unwrap();
        manager.ensure_directories("book-2").unwrap();

        write_file(&tmp.path().join("book/book-1/uploads/a.wav"), &[0u8; 300]);
        write_file(&tmp.path().join("book/book-1/media/a.m4a"), &[0u8; 30]);
        write_file(&tmp.path().join("book/book-2/uploads/b.wav"), &[0u8; 200]);

        let book1 = manager.disk_usage(Some("book-1"));
        assert_eq!(book1.uploads, 300);
        assert_eq!(book1.media, 30);
        assert_eq!(book1.total, 330);

        let all = manager.disk_usage(None);
        assert_eq!(all.uploads, 500);
        assert_eq!(all.total, 530);

        let missing = manager.disk_usage(Some("nope"));
        assert_eq!(missing, DiskUsage::default());
    }

    #[test]
    fn test_delete_chapter_files() {
        let tmp = TempDir::new().unwrap();
        let manager = make_manager(tmp.path());
        manager.ensure_directories("book-1").unwrap();

        let original = tmp.path().join("book/book-1/uploads/ch1.wav");
        let encoded = tmp.path().join("book/book-1/media/ch1.m4a");
        let temp = tmp.path().join("book/book-1/temp/temp_ch-1_ch1.wav");
        write_file(&original, b"orig");
        write_file(&encoded, b"enc");
        write_file(&temp, b"tmp");

        let outcome = manager.delete_chapter_files("book-1", "ch-1", "ch1.wav", true);
        assert!(outcome.encoded_removed);
        assert!(!outcome.original_removed);
        assert_eq!(outcome.temp_removed, 1);
        assert!(original.exists());

        let outcome = manager.delete_chapter_files("book-1", "ch-1", "ch1.wav", false);
        assert!(outcome.original_removed);
        assert!(!original.exists());
    }
}
