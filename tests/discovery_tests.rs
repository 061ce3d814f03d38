use faz_segmentation::{CaseDiscovery, ResumeFilter, SegmentationError};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn touch(dir: &Path, name: &str) {
    fs::write(dir.join(name), b"x").unwrap();
}

#[test]
fn test_prefix_colliding_case_ids_are_separated() {
    let input = TempDir::new().unwrap();
    for name in ["case1_0000.vol", "case1_0001.vol", "case10_0000.vol", "case10_0001.vol"] {
        touch(input.path(), name);
    }

    let discovery = CaseDiscovery::new(input.path(), input.path().join("out"), ".vol", 2);
    let cases = discovery.discover().unwrap();

    assert_eq!(cases.len(), 2);
    assert_eq!(cases[0].case_id, "case1");
    assert_eq!(cases[1].case_id, "case10");
    assert_eq!(
        cases[0].input_paths,
        vec![input.path().join("case1_0000.vol"), input.path().join("case1_0001.vol")]
    );
    assert_eq!(cases[1].output_path, input.path().join("out").join("case10.vol"));
}

#[test]
fn test_missing_modality_is_mismatch() {
    let input = TempDir::new().unwrap();
    touch(input.path(), "eye_a_0000.vol");
    touch(input.path(), "eye_a_0001.vol");
    touch(input.path(), "eye_b_0000.vol");

    let discovery = CaseDiscovery::new(input.path(), input.path(), ".vol", 2);
    match discovery.discover() {
        Err(SegmentationError::DiscoveryMismatch { case_id, expected, found }) => {
            assert_eq!(case_id, "eye_b");
            assert_eq!(expected, 2);
            assert_eq!(found, 1);
        }
        other => panic!("expected a discovery mismatch, got {:?}", other),
    }
}

#[test]
fn test_gap_in_modality_numbering_is_mismatch() {
    let input = TempDir::new().unwrap();
    touch(input.path(), "eye_0000.vol");
    touch(input.path(), "eye_0002.vol");

    let discovery = CaseDiscovery::new(input.path(), input.path(), ".vol", 2);
    assert!(matches!(
        discovery.discover(),
        Err(SegmentationError::DiscoveryMismatch { .. })
    ));
}

#[test]
fn test_unrelated_files_are_ignored() {
    let input = TempDir::new().unwrap();
    touch(input.path(), "eye_0000.vol");
    touch(input.path(), "notes.vol");
    touch(input.path(), "eye_0000.txt");
    touch(input.path(), ".eye_0001.vol.tmp");
    fs::create_dir(input.path().join("nested_0000.vol")).unwrap();

    let discovery = CaseDiscovery::new(input.path(), input.path(), ".vol", 1);
    assert_eq!(discovery.list_volume_files().unwrap(), vec!["eye_0000.vol", "notes.vol"]);

    let cases = discovery.discover().unwrap();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].case_id, "eye");
}

#[test]
fn test_resume_filter_skips_finished_cases() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    for name in ["a_0000.vol", "b_0000.vol", "c_0000.vol"] {
        touch(input.path(), name);
    }
    touch(output.path(), "b.vol");

    let cases = CaseDiscovery::new(input.path(), output.path(), ".vol", 1)
        .discover()
        .unwrap();
    let pending = ResumeFilter::new(false, false).apply(cases.clone());
    let ids: Vec<&str> = pending.iter().map(|c| c.case_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);

    assert_eq!(ResumeFilter::new(true, false).apply(cases).len(), 3);
}
