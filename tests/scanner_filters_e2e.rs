use distpilot::amg::scanner::{ScanCtx, scan_directory};
use distpilot::config::WorkDir;
use distpilot::logging::{DeleteLog, InputLog};
use distpilot::options::parse_dir_options;

// Scanner filter behaviour over a real directory: dot files, ignore-size
// predicates, per-scan ceilings with the re-queue flag, and accumulate
// thresholds holding small batches back.

struct Fixture {
    _tmp: tempfile::TempDir,
    src: std::path::PathBuf,
    input_log: InputLog,
    delete_log: DeleteLog,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("in");
    std::fs::create_dir_all(&src).expect("src");
    let input_log = InputLog::open(&work.log_dir()).expect("input");
    let delete_log = DeleteLog::open(&work.log_dir()).expect("delete");
    Fixture { _tmp: tmp, src, input_log, delete_log }
}

fn lines(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn scan(fx: &Fixture, opts_lines: &[&str]) -> distpilot::amg::scanner::ScanOutcome {
    let opts = parse_dir_options(&lines(opts_lines));
    let masks = vec![vec!["*".to_string()]];
    let ctx = ScanCtx {
        dup: None,
        input_log: &fx.input_log,
        delete_log: &fx.delete_log,
        all_mask_groups: &masks,
        now: chrono::Utc::now().timestamp(),
    };
    scan_directory(&fx.src, 1, &opts, &ctx).expect("scan")
}

#[test]
fn dot_files_ignored_unless_accepted() {
    let fx = fixture();
    std::fs::write(fx.src.join(".hidden"), b"h").unwrap();
    std::fs::write(fx.src.join("plain"), b"p").unwrap();
    let out = scan(&fx, &[]);
    assert_eq!(out.picked.len(), 1);
    assert_eq!(out.picked[0].name, "plain");
    let out = scan(&fx, &["accept dot files"]);
    assert_eq!(out.picked.len(), 2);
}

#[test]
fn ignore_size_predicate_blocks_matching_files() {
    let fx = fixture();
    std::fs::write(fx.src.join("small"), b"xy").unwrap();
    std::fs::write(fx.src.join("large"), vec![0u8; 4096]).unwrap();
    // ignore files larger than 1 KiB
    let out = scan(&fx, &["ignore size >1024"]);
    assert_eq!(out.picked.len(), 1);
    assert_eq!(out.picked[0].name, "small");
    // zero threshold means no predicate at all
    let out = scan(&fx, &["ignore size 0"]);
    assert_eq!(out.picked.len(), 2);
}

#[test]
fn max_files_ceiling_sets_requeue_flag() {
    let fx = fixture();
    for i in 0..5 {
        std::fs::write(fx.src.join(format!("f{}", i)), b"x").unwrap();
    }
    let out = scan(&fx, &["max files 2"]);
    assert_eq!(out.picked.len(), 2);
    assert!(out.hit_ceiling, "capped scan must ask for a re-queue");
    // unlimited when zero
    let out = scan(&fx, &[]);
    assert_eq!(out.picked.len(), 5);
    assert!(!out.hit_ceiling);
}

#[test]
fn accumulate_holds_until_threshold() {
    let fx = fixture();
    std::fs::write(fx.src.join("one"), b"aa").unwrap();
    let out = scan(&fx, &["accumulate 3"]);
    assert!(out.picked.is_empty(), "below the count threshold nothing moves");
    assert_eq!(out.files_seen, 1);
    std::fs::write(fx.src.join("two"), b"bb").unwrap();
    std::fs::write(fx.src.join("three"), b"cc").unwrap();
    let out = scan(&fx, &["accumulate 3"]);
    assert_eq!(out.picked.len(), 3, "threshold reached releases the batch");
    // size threshold alone: three files of 2 bytes each
    let out = scan(&fx, &["accumulate size 7"]);
    assert!(out.picked.is_empty(), "6 bytes stay under the size threshold");
    let out = scan(&fx, &["accumulate size 5"]);
    assert_eq!(out.picked.len(), 3);
}

#[test]
fn wait_for_gate_blocks_until_marker_appears() {
    let fx = fixture();
    std::fs::write(fx.src.join("data.bin"), b"d").unwrap();
    let out = scan(&fx, &["wait for go.*"]);
    assert!(out.picked.is_empty());
    std::fs::write(fx.src.join("go.now"), b"").unwrap();
    let out = scan(&fx, &["wait for go.*"]);
    assert!(out.picked.iter().any(|p| p.name == "data.bin"));
}
