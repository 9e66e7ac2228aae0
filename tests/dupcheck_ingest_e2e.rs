use distpilot::amg::scanner::{ScanCtx, scan_directory};
use distpilot::config::WorkDir;
use distpilot::dupcheck::{DC_ACTION_DELETE, DC_CONTENT, DupCheck};
use distpilot::logging::{DeleteLog, InputLog};
use distpilot::options::{DirOptions, parse_dir_options};

// Ingest-side duplicate suppression: the same content arriving twice within
// the timeout window is deleted on the second scan and logged.

fn dir_opts(lines: &[&str]) -> DirOptions {
    parse_dir_options(&lines.iter().map(|s| s.to_string()).collect::<Vec<_>>())
}

#[test]
fn second_arrival_within_window_is_deleted() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("in");
    std::fs::create_dir_all(&src).expect("src");

    let opts = dir_opts(&["dupcheck 60 content delete"]);
    assert_eq!(opts.dup_check_flag, DC_CONTENT | DC_ACTION_DELETE);

    let dup = DupCheck::open(&work.dup_db_file(), &work.store_dir()).expect("dup");
    let input_log = InputLog::open(&work.log_dir()).expect("input log");
    let delete_log = DeleteLog::open(&work.log_dir()).expect("delete log");
    let masks = vec![vec!["*".to_string()]];

    // first arrival passes
    std::fs::write(src.join("a.bin"), b"payload").expect("first");
    let now = chrono::Utc::now().timestamp();
    let ctx = ScanCtx {
        dup: Some(&dup),
        input_log: &input_log,
        delete_log: &delete_log,
        all_mask_groups: &masks,
        now,
    };
    let out = scan_directory(&src, 0x11, &opts, &ctx).expect("scan");
    assert_eq!(out.picked.len(), 1);
    // consume it like the materialiser would
    std::fs::remove_file(&out.picked[0].path).expect("consume");

    // same bytes under another name inside the window: deleted, not picked
    std::fs::write(src.join("b.bin"), b"payload").expect("second");
    let ctx = ScanCtx {
        dup: Some(&dup),
        input_log: &input_log,
        delete_log: &delete_log,
        all_mask_groups: &masks,
        now: now + 5,
    };
    let out = scan_directory(&src, 0x11, &opts, &ctx).expect("scan");
    assert!(out.picked.is_empty());
    assert!(!src.join("b.bin").exists(), "duplicate must be deleted");

    let dl = std::fs::read_to_string(work.log_dir().join("DELETE_LOG.jsonl")).expect("log");
    assert!(dl.contains("DUP_INPUT"));
    assert!(dl.contains("b.bin"));
}

#[test]
fn arrival_after_timeout_is_fresh_again() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("in");
    std::fs::create_dir_all(&src).expect("src");
    let opts = dir_opts(&["dupcheck 60 name delete"]);
    let dup = DupCheck::open(&work.dup_db_file(), &work.store_dir()).expect("dup");
    let input_log = InputLog::open(&work.log_dir()).expect("input log");
    let delete_log = DeleteLog::open(&work.log_dir()).expect("delete log");
    let masks = vec![vec!["*".to_string()]];

    std::fs::write(src.join("a.bin"), b"x").expect("first");
    let t0 = 1_000_000;
    let ctx = ScanCtx {
        dup: Some(&dup),
        input_log: &input_log,
        delete_log: &delete_log,
        all_mask_groups: &masks,
        now: t0,
    };
    assert_eq!(scan_directory(&src, 0x11, &opts, &ctx).expect("scan").picked.len(), 1);
    std::fs::remove_file(src.join("a.bin")).expect("consume");

    // 61 seconds later the entry has expired
    std::fs::write(src.join("a.bin"), b"x").expect("again");
    let ctx = ScanCtx {
        dup: Some(&dup),
        input_log: &input_log,
        delete_log: &delete_log,
        all_mask_groups: &masks,
        now: t0 + 61,
    };
    assert_eq!(scan_directory(&src, 0x11, &opts, &ctx).expect("scan").picked.len(), 1);
}
