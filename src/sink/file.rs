//! Rotating JSON-lines file sink.
//!
//! Layout of the output directory:
//!
//! - `metrics.<UTC timestamp>.jsonl`: archive files. Each starts with a
//!   metadata record (the on-rotate sample) followed by chunk records.
//! - `metrics.interim`: the chunk currently being filled, rewritten every
//!   interim window so that a crash loses at most one window of samples.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::{CollectContext, CollectorRegistry, Document};
use crate::config::Configuration;
use crate::sink::{PersistenceSink, SinkError, SinkFactory};

// =============================================================================
// Constants
// =============================================================================

/// File holding the not-yet-archived chunk.
pub const INTERIM_FILE_NAME: &str = "metrics.interim";

const INTERIM_TEMP_FILE_NAME: &str = "metrics.interim.tmp";

const ARCHIVE_PREFIX: &str = "metrics.";

const ARCHIVE_SUFFIX: &str = ".jsonl";

/// Whether `name` is an archive file produced by [`FileSink`].
pub fn is_archive_file(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)
}

// =============================================================================
// Records
// =============================================================================

/// One persisted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSample {
    pub ts: DateTime<Utc>,
    pub document: Document,
}

/// One line of an archive file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArchiveRecord {
    /// On-rotate sample written at the head of each file.
    Metadata { ts: DateTime<Utc>, document: Document },
    /// A batch of periodic samples.
    Chunk { samples: Vec<ArchivedSample> },
}

/// Read every record of an archive file.
pub fn read_archive(path: &Path) -> Result<Vec<ArchiveRecord>, SinkError> {
    let file = File::open(path).map_err(SinkError::io(path))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(SinkError::io(path))?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

// =============================================================================
// Factory
// =============================================================================

/// Factory producing [`FileSink`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSinkFactory;

impl SinkFactory for FileSinkFactory {
    fn create(
        &mut self,
        config: &Configuration,
        directory: &Path,
        on_rotate: CollectorRegistry,
        ctx: &CollectContext,
    ) -> Result<Box<dyn PersistenceSink>, SinkError> {
        let sink = FileSink::open(config, directory, on_rotate, ctx)?;
        Ok(Box::new(sink))
    }
}

// =============================================================================
// Sink
// =============================================================================

struct ArchiveFile {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

impl ArchiveFile {
    fn create(path: PathBuf) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(SinkError::io(&path))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes: 0,
        })
    }

    /// Append one record and flush it to the OS.
    fn append(&mut self, record: &ArchiveRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(SinkError::io(&self.path))?;
        self.writer.flush().map_err(SinkError::io(&self.path))?;
        self.bytes += line.len() as u64;
        Ok(())
    }
}

/// JSON-lines persistence sink with chunking, interim updates, rotation and
/// directory pruning.
///
/// Thresholds are taken from the configuration passed to each `write`.
pub struct FileSink {
    directory: PathBuf,
    on_rotate: CollectorRegistry,
    current: Option<ArchiveFile>,
    pending: Vec<ArchivedSample>,
    closed: bool,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("directory", &self.directory)
            .field("current", &self.current.as_ref().map(|c| &c.path))
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl FileSink {
    /// Open the sink: create the directory, start a new archive file and
    /// fold any interim chunk left by a previous process into it.
    pub fn open(
        config: &Configuration,
        directory: &Path,
        on_rotate: CollectorRegistry,
        ctx: &CollectContext,
    ) -> Result<Self, SinkError> {
        fs::create_dir_all(directory).map_err(SinkError::io(directory))?;

        let mut sink = Self {
            directory: directory.to_path_buf(),
            on_rotate,
            current: None,
            pending: Vec::new(),
            closed: false,
        };

        let recovered = sink.recover_interim()?;
        sink.start_file(ctx)?;
        if let Some(samples) = recovered {
            tracing::info!(count = samples.len(), "Recovered interim samples");
            sink.current_mut()?
                .append(&ArchiveRecord::Chunk { samples })?;
        }
        sink.remove_interim()?;
        sink.prune(config.max_directory_size_bytes())?;

        Ok(sink)
    }

    /// Path of the archive file currently being written.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    fn current_mut(&mut self) -> Result<&mut ArchiveFile, SinkError> {
        self.current.as_mut().ok_or(SinkError::Closed)
    }

    fn interim_path(&self) -> PathBuf {
        self.directory.join(INTERIM_FILE_NAME)
    }

    fn next_archive_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.6fZ").to_string();
        let mut path = self
            .directory
            .join(format!("{ARCHIVE_PREFIX}{stamp}{ARCHIVE_SUFFIX}"));
        let mut n = 1;
        while path.exists() {
            path = self
                .directory
                .join(format!("{ARCHIVE_PREFIX}{stamp}_{n}{ARCHIVE_SUFFIX}"));
            n += 1;
        }
        path
    }

    /// Sample the on-rotate collectors and begin a new archive file.
    fn start_file(&mut self, ctx: &CollectContext) -> Result<(), SinkError> {
        let sample = self.on_rotate.collect(&ctx.for_rotation())?;

        let mut file = ArchiveFile::create(self.next_archive_path())?;
        if !sample.is_empty() {
            file.append(&ArchiveRecord::Metadata {
                ts: sample.start,
                document: sample.to_document(),
            })?;
        }

        tracing::info!(path = %file.path.display(), "Started archive file");
        self.current = Some(file);
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let samples = std::mem::take(&mut self.pending);
        let count = samples.len();
        self.current_mut()?
            .append(&ArchiveRecord::Chunk { samples })?;
        tracing::debug!(count, "Chunk archived");
        Ok(())
    }

    fn write_interim(&self) -> Result<(), SinkError> {
        let record = ArchiveRecord::Chunk {
            samples: self.pending.clone(),
        };
        let temp = self.directory.join(INTERIM_TEMP_FILE_NAME);
        let path = self.interim_path();

        fs::write(&temp, serde_json::to_vec(&record)?).map_err(SinkError::io(&temp))?;
        fs::rename(&temp, &path).map_err(SinkError::io(&path))?;
        tracing::trace!(count = self.pending.len(), "Interim chunk updated");
        Ok(())
    }

    fn remove_interim(&self) -> Result<(), SinkError> {
        let path = self.interim_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkError::io(&path)(e)),
        }
    }

    fn recover_interim(&self) -> Result<Option<Vec<ArchivedSample>>, SinkError> {
        let path = self.interim_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SinkError::io(&path)(e)),
        };

        let mut samples = match serde_json::from_slice::<ArchiveRecord>(&bytes) {
            Ok(ArchiveRecord::Chunk { samples }) => samples,
            Ok(ArchiveRecord::Metadata { .. }) => return Ok(None),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable interim file");
                return Ok(None);
            }
        };

        // A crash between appending a chunk and removing the interim file
        // leaves the same samples in both places.
        if let Some(archived) = self.last_archived_ts()? {
            let before = samples.len();
            samples.retain(|s| s.ts > archived);
            if samples.len() < before {
                tracing::info!(
                    skipped = before - samples.len(),
                    "Skipping interim samples already archived"
                );
            }
        }

        Ok((!samples.is_empty()).then_some(samples))
    }

    /// Timestamp of the newest sample in the newest archive file.
    ///
    /// Unparseable lines, such as a record cut short by a crash, are skipped.
    fn last_archived_ts(&self) -> Result<Option<DateTime<Utc>>, SinkError> {
        let mut newest: Option<PathBuf> = None;
        for entry in fs::read_dir(&self.directory).map_err(SinkError::io(&self.directory))? {
            let path = entry.map_err(SinkError::io(&self.directory))?.path();
            let is_archive = path
                .file_name()
                .is_some_and(|name| is_archive_file(&name.to_string_lossy()));
            if is_archive && newest.as_ref().is_none_or(|n| path > *n) {
                newest = Some(path);
            }
        }
        let Some(path) = newest else {
            return Ok(None);
        };

        let file = File::open(&path).map_err(SinkError::io(&path))?;
        let mut last = None;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(SinkError::io(&path))?;
            if let Ok(ArchiveRecord::Chunk { samples }) = serde_json::from_str(&line) {
                last = samples.iter().map(|s| s.ts).max().max(last);
            }
        }
        Ok(last)
    }

    /// Delete the oldest archive files until the directory fits its budget.
    ///
    /// The file being written is never removed.
    fn prune(&self, max_directory_size_bytes: u64) -> Result<(), SinkError> {
        let io = SinkError::io(&self.directory);
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory).map_err(io)? {
            let entry = entry.map_err(SinkError::io(&self.directory))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_archive_file(&name) && name != INTERIM_FILE_NAME {
                continue;
            }
            let path = entry.path();
            let len = entry.metadata().map_err(SinkError::io(&path))?.len();
            files.push((name, path, len));
        }
        files.sort();

        let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();
        let current = self.current_path();

        for (name, path, len) in &files {
            if total <= max_directory_size_bytes {
                break;
            }
            if !is_archive_file(name) || current == Some(path.as_path()) {
                continue;
            }
            fs::remove_file(path).map_err(SinkError::io(path))?;
            total -= len;
            tracing::info!(path = %path.display(), bytes = len, "Removed archive file over directory budget");
        }

        Ok(())
    }
}

impl PersistenceSink for FileSink {
    fn write(
        &mut self,
        ctx: &CollectContext,
        config: &Configuration,
        document: &Document,
        ts: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }

        self.pending.push(ArchivedSample {
            ts,
            document: document.clone(),
        });

        if self.pending.len() >= config.max_samples_per_archive_chunk() {
            self.flush_chunk()?;
            self.remove_interim()?;

            if self.current_mut()?.bytes >= config.max_file_size_bytes() {
                tracing::info!(
                    max_file_size_bytes = config.max_file_size_bytes(),
                    "Rotating archive file"
                );
                self.start_file(ctx)?;
                self.prune(config.max_directory_size_bytes())?;
            }
        } else if self.pending.len() % config.max_samples_per_interim_chunk() == 0 {
            self.write_interim()?;
        }

        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.flush_chunk()?;
        self.remove_interim()?;
        if let Some(mut file) = self.current.take() {
            file.writer.flush().map_err(SinkError::io(&file.path))?;
            tracing::info!(path = %file.path.display(), "Archive file closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectorError, FnCollector};
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;

    fn config(archive_chunk: usize, interim_chunk: usize) -> Configuration {
        let mut config = Configuration::default();
        config.set_max_samples_per_archive_chunk(archive_chunk).unwrap();
        config.set_max_samples_per_interim_chunk(interim_chunk).unwrap();
        config
    }

    fn on_rotate() -> CollectorRegistry {
        let mut registry = CollectorRegistry::new();
        registry.add(Box::new(FnCollector::new("meta", |_: &CollectContext| {
            let mut doc = Document::new();
            doc.insert("version".into(), "test".into());
            Ok(doc)
        })));
        registry
    }

    fn doc(n: i64) -> Document {
        let mut doc = Document::new();
        doc.insert("n".into(), n.into());
        doc
    }

    fn archives(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| is_archive_file(&p.file_name().unwrap().to_string_lossy()))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_open_writes_metadata() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("diag");
        let ctx = CollectContext::periodic(1);

        let sink = FileSink::open(&config(3, 2), &out, on_rotate(), &ctx).unwrap();
        let path = sink.current_path().unwrap().to_path_buf();
        assert_eq!(archives(&out), vec![path.clone()]);

        let records = read_archive(&path).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            ArchiveRecord::Metadata { document, .. } => {
                assert_eq!(document["meta"]["version"], "test");
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn test_open_without_on_rotate_collectors() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let sink =
            FileSink::open(&config(3, 2), dir.path(), CollectorRegistry::new(), &ctx).unwrap();
        assert!(read_archive(sink.current_path().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_and_interim() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let cfg = config(3, 2);
        let mut sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
        let interim = dir.path().join(INTERIM_FILE_NAME);

        sink.write(&ctx, &cfg, &doc(1), Utc::now()).unwrap();
        assert!(!interim.exists());

        sink.write(&ctx, &cfg, &doc(2), Utc::now()).unwrap();
        assert!(interim.exists());
        let record: ArchiveRecord = serde_json::from_slice(&fs::read(&interim).unwrap()).unwrap();
        assert!(matches!(record, ArchiveRecord::Chunk { ref samples } if samples.len() == 2));

        sink.write(&ctx, &cfg, &doc(3), Utc::now()).unwrap();
        assert!(!interim.exists());

        let records = read_archive(sink.current_path().unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        match &records[1] {
            ArchiveRecord::Chunk { samples } => {
                let ns: Vec<_> = samples.iter().map(|s| s.document["n"].clone()).collect();
                assert_eq!(ns, vec![1, 2, 3]);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_threshold_change_applies_to_open_sink() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let mut sink = FileSink::open(&config(10, 5), dir.path(), on_rotate(), &ctx).unwrap();

        sink.write(&ctx, &config(10, 5), &doc(1), Utc::now()).unwrap();
        sink.write(&ctx, &config(2, 5), &doc(2), Utc::now()).unwrap();

        let records = read_archive(sink.current_path().unwrap()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_close_flushes_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let cfg = config(5, 2);
        let mut sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
        let path = sink.current_path().unwrap().to_path_buf();

        sink.write(&ctx, &cfg, &doc(1), Utc::now()).unwrap();
        sink.write(&ctx, &cfg, &doc(2), Utc::now()).unwrap();
        assert!(dir.path().join(INTERIM_FILE_NAME).exists());

        sink.close().unwrap();
        sink.close().unwrap();
        assert!(!dir.path().join(INTERIM_FILE_NAME).exists());
        assert!(sink.current_path().is_none());

        let records = read_archive(&path).unwrap();
        assert!(matches!(&records[1], ArchiveRecord::Chunk { samples } if samples.len() == 2));

        let err = sink.write(&ctx, &cfg, &doc(3), Utc::now()).unwrap_err();
        assert!(matches!(err, SinkError::Closed));
    }

    #[test]
    fn test_interim_recovered_on_open() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let cfg = config(10, 2);

        {
            let mut sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
            for n in 0..4 {
                sink.write(&ctx, &cfg, &doc(n), Utc::now()).unwrap();
            }
            // Dropped without close, as after a crash.
        }
        assert!(dir.path().join(INTERIM_FILE_NAME).exists());

        let sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
        assert!(!dir.path().join(INTERIM_FILE_NAME).exists());

        let records = read_archive(sink.current_path().unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[1], ArchiveRecord::Chunk { samples } if samples.len() == 4));
    }

    #[test]
    fn test_recovery_skips_already_archived_samples() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let cfg = config(10, 2);
        let base = Utc::now() - chrono::TimeDelta::seconds(60);
        let sample = |n: i64| ArchivedSample {
            ts: base + chrono::TimeDelta::seconds(n),
            document: doc(n),
        };

        // Chunk of samples 0..3 appended, but the process died before the
        // interim copy of those samples (plus one newer) was removed.
        let archived = ArchiveRecord::Chunk {
            samples: (0..3).map(sample).collect(),
        };
        let mut line = serde_json::to_vec(&archived).unwrap();
        line.extend_from_slice(b"\n{\"type\":\"chu");
        fs::write(
            dir.path().join("metrics.2000-01-01T00-00-00.000000Z.jsonl"),
            line,
        )
        .unwrap();
        let interim = ArchiveRecord::Chunk {
            samples: (0..4).map(sample).collect(),
        };
        fs::write(
            dir.path().join(INTERIM_FILE_NAME),
            serde_json::to_vec(&interim).unwrap(),
        )
        .unwrap();

        let sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
        assert!(!dir.path().join(INTERIM_FILE_NAME).exists());

        let records = read_archive(sink.current_path().unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        match &records[1] {
            ArchiveRecord::Chunk { samples } => {
                let ns: Vec<_> = samples.iter().map(|s| s.document["n"].clone()).collect();
                assert_eq!(ns, vec![3]);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_fully_archived_interim_adds_nothing() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let cfg = config(3, 2);

        {
            let mut sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
            for n in 0..3 {
                sink.write(&ctx, &cfg, &doc(n), Utc::now()).unwrap();
            }
            // Interim copy of the archived chunk left behind by a crash.
            let records = read_archive(sink.current_path().unwrap()).unwrap();
            let chunk = records.last().unwrap();
            fs::write(
                dir.path().join(INTERIM_FILE_NAME),
                serde_json::to_vec(chunk).unwrap(),
            )
            .unwrap();
        }

        let sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
        let records = read_archive(sink.current_path().unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], ArchiveRecord::Metadata { .. }));
    }

    #[test]
    fn test_corrupt_interim_discarded() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(INTERIM_FILE_NAME), b"{not json").unwrap();

        let ctx = CollectContext::periodic(1);
        let sink = FileSink::open(&config(10, 2), dir.path(), on_rotate(), &ctx).unwrap();
        assert!(!dir.path().join(INTERIM_FILE_NAME).exists());
        assert_eq!(read_archive(sink.current_path().unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn test_rotation_and_pruning() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let mut cfg = config(2, 2);
        cfg.set_max_file_size_bytes(MIB).unwrap();
        cfg.set_max_directory_size_bytes(10 * MIB).unwrap();

        let mut sink = FileSink::open(&cfg, dir.path(), on_rotate(), &ctx).unwrap();
        let first = sink.current_path().unwrap().to_path_buf();

        let mut big = Document::new();
        big.insert("blob".into(), "x".repeat(MIB as usize).into());

        // Every chunk holds ~2 MiB, so every chunk rotates.
        for _ in 0..14 {
            sink.write(&ctx, &cfg, &big, Utc::now()).unwrap();
        }

        let files = archives(dir.path());
        assert!(files.len() > 1, "expected rotation, got {files:?}");
        assert!(!files.contains(&first), "oldest file should be pruned");
        assert_eq!(files.last().map(PathBuf::as_path), sink.current_path());

        let total: u64 = files.iter().map(|p| fs::metadata(p).unwrap().len()).sum();
        assert!(total <= 10 * MIB, "directory is {total} bytes");
    }

    #[test]
    fn test_on_rotate_failure_propagates() {
        let dir = tempdir().unwrap();
        let mut registry = CollectorRegistry::new();
        registry.add(Box::new(FnCollector::new("bad", |_: &CollectContext| {
            Err(CollectorError::failed("bad", "no data"))
        })));

        let ctx = CollectContext::periodic(1);
        let err = FileSink::open(&config(2, 2), dir.path(), registry, &ctx).unwrap_err();
        assert!(matches!(err, SinkError::Collector(_)));
    }

    #[test]
    fn test_factory_creates_file_sink() {
        let dir = tempdir().unwrap();
        let ctx = CollectContext::periodic(1);
        let cfg = config(2, 2);
        let mut sink = FileSinkFactory
            .create(&cfg, dir.path(), on_rotate(), &ctx)
            .unwrap();
        sink.write(&ctx, &cfg, &doc(1), Utc::now()).unwrap();
        sink.close().unwrap();
        assert_eq!(archives(dir.path()).len(), 1);
    }
}
