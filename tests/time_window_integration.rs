use distpilot::amg::materialise::{MatchedGroup, materialise};
use distpilot::amg::scanner::PickedFile;
use distpilot::config::WorkDir;
use distpilot::options::parse_local_options;
use distpilot::rename::RenameRules;
use distpilot::ruledb::JobRule;
use distpilot::timejob::CronSpec;

// Send windows at the materialiser: a collect window defers the message to
// the next cron firing; a no-collect window drops files arriving outside it.

fn picked(dir: &std::path::Path, name: &str) -> PickedFile {
    let path = dir.join(name);
    std::fs::write(&path, b"w").expect("write");
    PickedFile { path, name: name.to_string(), size: 1, mtime: 0 }
}

fn rule(dir: &std::path::Path, local_options: Vec<String>) -> JobRule {
    JobRule {
        dir: dir.to_path_buf(),
        dir_alias: "in".to_string(),
        priority: b'5',
        file_masks: vec!["*".to_string()],
        local_options,
        std_options: Vec::new(),
        recipient: "sftp://u@h/out".to_string(),
    }
}

#[test]
fn collect_window_defers_next_start_time() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("in");
    std::fs::create_dir_all(&src).expect("src");
    let files = vec![picked(&src, "a.bin")];
    // a window that can never be "now": Feb 1st, 00:00
    let spec_str = "0 0 1 2 *";
    let r = rule(&src, vec![format!("time {}", spec_str)]);
    let groups = vec![MatchedGroup {
        rule: &r,
        local_opts: parse_local_options(&r.local_options),
        host_alias: "h".to_string(),
        files: vec![0],
    }];
    let staged = materialise(&work, &files, &groups, &RenameRules::default(), false)
        .expect("stage");
    assert_eq!(staged.len(), 1);
    let now = chrono::Utc::now().timestamp();
    let expected = CronSpec::parse(spec_str).unwrap().next_after(now).unwrap();
    let got = staged[0].message.next_start_time;
    // staged moments apart from `now`; allow the minute boundary to differ
    assert!(got > now, "deferred into the future");
    assert!((got - expected).abs() <= 60, "{} vs {}", got, expected);
    // the file itself is staged and waiting
    assert!(staged[0].staging_dir.join("a.bin").exists());
}

#[test]
fn no_collect_window_drops_out_of_window_files() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("in");
    std::fs::create_dir_all(&src).expect("src");
    let files = vec![picked(&src, "a.bin")];
    let r = rule(&src, vec!["time no collect 0 0 1 2 *".to_string()]);
    let groups = vec![MatchedGroup {
        rule: &r,
        local_opts: parse_local_options(&r.local_options),
        host_alias: "h".to_string(),
        files: vec![0],
    }];
    let staged =
        materialise(&work, &files, &groups, &RenameRules::default(), false).expect("stage");
    assert!(staged.is_empty(), "no message outside the window");
    assert!(!files[0].path.exists(), "out-of-window file dropped");
}

#[test]
fn always_open_no_collect_window_passes_files_through() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("in");
    std::fs::create_dir_all(&src).expect("src");
    let files = vec![picked(&src, "a.bin")];
    let r = rule(&src, vec!["time no collect * * * * *".to_string()]);
    let groups = vec![MatchedGroup {
        rule: &r,
        local_opts: parse_local_options(&r.local_options),
        host_alias: "h".to_string(),
        files: vec![0],
    }];
    let staged =
        materialise(&work, &files, &groups, &RenameRules::default(), false).expect("stage");
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].message.next_start_time, 0, "in-window sends immediately");
}
