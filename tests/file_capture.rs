//! End-to-end capture into a directory with the file sink.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use diagcap::collector::system::{BuildInfoCollector, HostCollector, ProcessCollector};
use diagcap::sink::file::{INTERIM_FILE_NAME, is_archive_file};
use diagcap::sink::{ArchiveRecord, read_archive};
use diagcap::{CaptureConfig, Controller, FileSinkFactory};
use tempfile::tempdir;

fn archives(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| is_archive_file(&p.file_name().unwrap().to_string_lossy()))
        .collect();
    files.sort();
    files
}

fn capturing_controller() -> Controller {
    let controller = Controller::new(FileSinkFactory).with_fatal_handler(|e| {
        panic!("unexpected fatal error: {e}");
    });
    controller.add_periodic_collector(ProcessCollector::new());
    controller.add_periodic_collector(HostCollector);
    controller.add_on_rotate_collector(BuildInfoCollector);
    controller
}

#[test]
fn test_capture_to_directory() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("diagnostic.data");

    let controller = capturing_controller();
    controller.set_directory(&output).unwrap();
    controller.set_period(Duration::from_millis(100)).unwrap();
    controller.set_max_samples_per_archive_chunk(4).unwrap();
    controller.set_max_samples_per_interim_chunk(2).unwrap();
    controller.set_enabled(true).unwrap();
    controller.start().unwrap();

    thread::sleep(Duration::from_millis(1000));
    controller.stop();

    assert!(!output.join(INTERIM_FILE_NAME).exists());
    let files = archives(&output);
    assert_eq!(files.len(), 1);

    let records = read_archive(&files[0]).unwrap();
    match &records[0] {
        ArchiveRecord::Metadata { document, .. } => {
            assert_eq!(document["buildInfo"]["name"], "diagcap");
        }
        other => panic!("expected metadata first, got {other:?}"),
    }

    let samples: Vec<_> = records[1..]
        .iter()
        .flat_map(|r| match r {
            ArchiveRecord::Chunk { samples } => samples.clone(),
            ArchiveRecord::Metadata { .. } => panic!("metadata after the first record"),
        })
        .collect();
    assert!(samples.len() >= 3, "only {} samples", samples.len());
    assert!(records[1..records.len() - 1].iter().all(|r| match r {
        ArchiveRecord::Chunk { samples } => samples.len() == 4,
        ArchiveRecord::Metadata { .. } => false,
    }));

    for pair in samples.windows(2) {
        assert!(pair[0].ts <= pair[1].ts);
    }
    let last = &samples[samples.len() - 1].document;
    assert_eq!(*last, controller.most_recent_document());
    assert!(last.contains_key("process"));
    assert!(last.contains_key("host"));
}

#[test]
fn test_yaml_config_drives_capture() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("out");
    let config_path = dir.path().join("capture.yaml");
    std::fs::write(
        &config_path,
        format!(
            "directory: {}\nenabled: true\nperiod: 100ms\nmax_samples_per_archive_chunk: 2\n",
            output.display()
        ),
    )
    .unwrap();

    let config = CaptureConfig::load(&config_path).unwrap();
    let controller = capturing_controller();
    config.apply_to(&controller).unwrap();

    let active = controller.configuration();
    assert!(active.enabled());
    assert_eq!(active.period(), Duration::from_millis(100));
    assert_eq!(active.max_samples_per_archive_chunk(), 2);

    controller.start().unwrap();
    thread::sleep(Duration::from_millis(500));
    controller.stop();

    let files = archives(&output);
    assert_eq!(files.len(), 1);
    let chunks = read_archive(&files[0])
        .unwrap()
        .into_iter()
        .filter(|r| matches!(r, ArchiveRecord::Chunk { .. }))
        .count();
    assert!(chunks >= 2);
}

#[test]
fn test_restart_starts_new_file() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("diagnostic.data");

    for _ in 0..2 {
        let controller = capturing_controller();
        controller.set_directory(&output).unwrap();
        controller.set_period(Duration::from_millis(100)).unwrap();
        controller.set_enabled(true).unwrap();
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        controller.stop();
    }

    let files = archives(&output);
    assert_eq!(files.len(), 2);
    for file in &files {
        let records = read_archive(file).unwrap();
        assert!(matches!(records[0], ArchiveRecord::Metadata { .. }));
    }
}
