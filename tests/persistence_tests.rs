/// Persistent-tier behaviour observed through the controller: corruption
/// detection, compaction alongside readers, and the disk capacity cap.
use rand::RngCore;
use ramlake::{HybridController, LakeConfig, LakeError, ManualClock, Partition, TierState};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::TempDir;

fn open(config: LakeConfig) -> HybridController {
    HybridController::open(config, Arc::new(ManualClock::starting_now())).unwrap()
}

fn segment_files(data_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(data_dir.join("segments"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "seg"))
        .collect();
    files.sort();
    files
}

fn noise(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[test]
fn test_corrupt_segment_is_reported_on_read() {
    let dir = TempDir::new().unwrap();
    let lake = open(LakeConfig::new(dir.path()));
    lake.write(Partition::Code, "only", &[42u8; 600], None).unwrap();
    lake.flush().unwrap();
    lake.evict("only").unwrap();
    assert_eq!(lake.tier_state("only"), Some(TierState::Cold));

    let segments = segment_files(dir.path());
    assert_eq!(segments.len(), 1);
    let mut bytes = fs::read(&segments[0]).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&segments[0], bytes).unwrap();

    assert!(matches!(
        lake.read("only"),
        Err(LakeError::Corruption { .. })
    ));
}

#[test]
fn test_corrupt_segment_fails_open() {
    let dir = TempDir::new().unwrap();
    {
        let lake = open(LakeConfig::new(dir.path()));
        lake.write(Partition::History, "e", b"event body", None).unwrap();
        lake.flush().unwrap();
    }
    let segments = segment_files(dir.path());
    let mut bytes = fs::read(&segments[0]).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&segments[0], bytes).unwrap();

    let result = HybridController::open(
        LakeConfig::new(dir.path()),
        Arc::new(ManualClock::starting_now()),
    );
    assert!(matches!(result, Err(LakeError::Corruption { .. })));
}

#[test]
fn test_compaction_runs_alongside_readers() {
    let dir = TempDir::new().unwrap();
    let lake = Arc::new(open(
        LakeConfig::new(dir.path()).with_memtable_flush_records(8),
    ));
    for i in 0..64 {
        lake.write(Partition::Code, &format!("k{:02}", i), format!("v0-{}", i).as_bytes(), None)
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|r| {
            let lake = Arc::clone(&lake);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    for i in (r..64).step_by(4) {
                        let key = format!("k{:02}", i);
                        // Cold reads exercise the segment path.
                        lake.evict(&key).unwrap();
                        let bytes = lake.read(&key).unwrap();
                        let text = String::from_utf8(bytes).unwrap();
                        assert!(text.ends_with(&format!("-{}", i)), "{} -> {}", key, text);
                        reads += 1;
                    }
                }
                reads
            })
        })
        .collect();

    for round in 1..=5 {
        for i in 0..64 {
            lake.write(
                Partition::Code,
                &format!("k{:02}", i),
                format!("v{}-{}", round, i).as_bytes(),
                None,
            )
            .unwrap();
        }
        lake.compact().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    let report = lake.compact().unwrap();
    assert_eq!(report.segments_after, 1);
    assert_eq!(segment_files(dir.path()).len(), 1);
    for i in 0..64 {
        assert_eq!(lake.read(&format!("k{:02}", i)).unwrap(), format!("v5-{}", i).as_bytes());
    }
}

#[test]
fn test_capacity_exceeded_rejects_write() {
    let dir = TempDir::new().unwrap();
    let lake = open(LakeConfig::new(dir.path()).with_max_cold_bytes(8 * 1024));

    let mut accepted = Vec::new();
    let error = loop {
        let key = format!("blob-{}", accepted.len());
        match lake.write(Partition::Metadata, &key, &noise(1024), None) {
            Ok(_) => accepted.push(key),
            Err(e) => break e,
        }
        assert!(accepted.len() < 100, "cap never enforced");
    };
    assert!(matches!(error, LakeError::CapacityExceeded { .. }));
    assert!(error.is_retryable());
    assert!(!accepted.is_empty());

    // Nothing from the rejected write is visible.
    let rejected = format!("blob-{}", accepted.len());
    assert_eq!(lake.tier_state(&rejected), None);

    // Deletes are always accepted, and every accepted write is readable.
    lake.delete(&accepted[0]).unwrap();
    for key in &accepted[1..] {
        assert_eq!(lake.read(key).unwrap().len(), 1024);
    }
}

#[test]
fn test_partition_of_live_key_is_fixed() {
    let dir = TempDir::new().unwrap();
    let lake = open(LakeConfig::new(dir.path()));
    lake.write(Partition::Vectors, "k", b"x", Some(&[1.0, 2.0])).unwrap();
    match lake.write(Partition::Metadata, "k", b"y", None) {
        Err(LakeError::PartitionMismatch {
            existing, requested, ..
        }) => {
            assert_eq!(existing, "vectors");
            assert_eq!(requested, "metadata");
        }
        other => panic!("expected a partition mismatch, got {:?}", other),
    }
    assert_eq!(lake.read("k").unwrap(), b"x");
}

#[test]
fn test_compression_ratio_for_text() {
    let dir = TempDir::new().unwrap();
    let lake = open(LakeConfig::new(dir.path()));
    let source = "impl Display for Partition { fn fmt(&self, f: &mut Formatter) -> Result { todo!() } }\n";
    for i in 0..50 {
        lake.write(Partition::Code, &format!("file-{}.rs", i), source.repeat(30).as_bytes(), None)
            .unwrap();
    }
    lake.flush().unwrap();
    let ratio = lake.stats().compression_ratio;
    assert!(ratio > 2.5, "ratio {}", ratio);
}

#[test]
fn test_leftover_temp_segment_is_ignored() {
    let dir = TempDir::new().unwrap();
    {
        let lake = open(LakeConfig::new(dir.path()));
        lake.write(Partition::Code, "a", b"alpha", None).unwrap();
        lake.flush().unwrap();
    }
    let stray = dir.path().join("segments").join("00000000000000ff.seg.tmp");
    fs::write(&stray, b"half written").unwrap();

    let lake = open(LakeConfig::new(dir.path()));
    assert_eq!(lake.read("a").unwrap(), b"alpha");
    assert!(!stray.exists());
}
