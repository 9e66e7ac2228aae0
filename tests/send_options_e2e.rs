use distpilot::config::{Config, WorkDir};
use distpilot::logging::read_output_log;
use distpilot::msg::MsgName;
use distpilot::ruledb::{JobRule, store_amg_data};
use distpilot::state::fsa::{Fsa, HostSeed};
use distpilot::state::jid::{Jid, JobSeed};
use distpilot::workers::{WorkerTask, run_delivery};

// Send-side options through a full local delivery: DOT locking uploads under
// a hidden name, trans_rename rewrites the final name, chmod applies, and
// the archive option moves the staged source into an hour bucket.

fn setup(tmp: &std::path::Path, std_options: Vec<String>) -> (WorkDir, MsgName, std::path::PathBuf) {
    let work = WorkDir::at(tmp.join("work"));
    work.ensure_layout().expect("layout");
    let dst = tmp.join("out");
    let rules = vec![JobRule {
        dir: tmp.join("in"),
        dir_alias: "in".to_string(),
        priority: b'5',
        file_masks: vec!["*".to_string()],
        local_options: Vec::new(),
        std_options,
        recipient: format!("file://{}", dst.display()),
    }];
    store_amg_data(&work.amg_data_file(), &rules).expect("amg_data");
    std::fs::write(work.rename_rule_file(), "[upper]\n*.txt %1.TXT\n").expect("rename.rule");
    let job_id = rules[0].job_id();
    Fsa::create(&work.fsa_file(), &[HostSeed { alias: "local".to_string(), ..HostSeed::default() }])
        .expect("fsa");
    Jid::create(
        &work.jid_file(),
        &[JobSeed {
            job_id,
            dir_id: rules[0].dir_id(),
            dir_no: 0,
            host_id: 1,
            priority: b'5',
            scheme: 0,
            no_of_files: 1,
            host_alias: "local".to_string(),
            recipient: rules[0].recipient.clone(),
        }],
    )
    .expect("jid");
    distpilot::fifo::mkfifo_if_missing(&work.sf_fin_fifo()).expect("fin");

    let name = MsgName {
        job_id,
        dir_no: 0,
        creation_time: chrono::Utc::now().timestamp(),
        unique_number: 1,
        split_job_counter: 0,
    };
    let staging = work.staging_dir(&name.to_string());
    std::fs::create_dir_all(&staging).expect("staging");
    std::fs::write(staging.join("report.txt"), b"data").expect("file");
    let fsa = Fsa::attach(&work.fsa_file()).expect("fsa");
    fsa.add_queued(0, 1, 4).expect("queued");
    (work, name, dst)
}

fn deliver(work: &WorkDir, name: &MsgName) {
    let fsa = Fsa::attach(&work.fsa_file()).expect("fsa");
    let slot = fsa.claim_slot(0, name.job_id, 0).expect("claim").expect("slot");
    run_delivery(&WorkerTask {
        work: work.clone(),
        cfg: Config::default(),
        host_idx: 0,
        slot,
        msg_name: name.to_string(),
        toggle_hint: None,
        retries: 0,
    })
    .expect("delivery");
}

#[test]
fn dot_lock_with_trans_rename_and_chmod() {
    use std::os::unix::fs::PermissionsExt;
    let tmp = tempfile::tempdir().expect("tempdir");
    let (work, name, dst) = setup(
        tmp.path(),
        vec!["lock DOT".to_string(), "trans_rename upper".to_string(), "chmod 600".to_string()],
    );
    deliver(&work, &name);

    // final name rewritten, no dot-name leftover, mode applied
    assert!(dst.join("report.TXT").exists());
    assert!(!dst.join(".report.TXT").exists());
    assert!(!dst.join("report.txt").exists());
    let mode = std::fs::metadata(dst.join("report.TXT")).expect("meta").permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let recs = read_output_log(&work.log_dir().join("OUTPUT_LOG")).expect("log");
    assert_eq!(recs[0].file_name, "report.TXT");
}

#[test]
fn archive_option_buckets_the_source() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (work, name, dst) = setup(tmp.path(), vec!["archive 2".to_string()]);
    deliver(&work, &name);

    assert!(dst.join("report.txt").exists());
    // staged source moved under archive/<host>/<user>/<job>/<YYYYMMDDHH>/
    let mut found = None;
    for e in walk(&work.archive_dir()) {
        if e.file_name() == Some(std::ffi::OsStr::new("report.txt")) {
            found = Some(e);
        }
    }
    let archived = found.expect("archived copy");
    let bucket = archived.parent().expect("bucket").file_name().unwrap().to_string_lossy();
    assert_eq!(bucket.len(), 10, "YYYYMMDDHH bucket, got {}", bucket);
    let recs = read_output_log(&work.log_dir().join("OUTPUT_LOG")).expect("log");
    assert!(recs[0].archive_path.as_deref().unwrap().contains(&*bucket));
}

fn walk(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(d) = stack.pop() {
        if let Ok(rd) = std::fs::read_dir(&d) {
            for e in rd.flatten() {
                let p = e.path();
                if p.is_dir() {
                    stack.push(p);
                } else {
                    out.push(p);
                }
            }
        }
    }
    out
}
