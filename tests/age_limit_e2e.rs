use std::time::Duration;

use distpilot::DeliveryError;
use distpilot::config::{Config, WorkDir};
use distpilot::logging::{OT_AGE_LIMIT_DELETE, read_output_log};
use distpilot::msg::MsgName;
use distpilot::ruledb::{JobRule, store_amg_data};
use distpilot::state::fsa::{Fsa, HostSeed};
use distpilot::state::jid::{Jid, JobSeed};
use distpilot::workers::{WorkerTask, run_delivery};

// A staged file older than the job's age-limit is deleted at send time with
// an AGE_LIMIT output record; when every file of the message ages out the
// worker reports the distinguished all-aged-out code and the counters drain.

#[test]
fn aged_out_message_returns_distinguished_code() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let dst = tmp.path().join("out");

    let rules = vec![JobRule {
        dir: tmp.path().join("in"),
        dir_alias: "in".to_string(),
        priority: b'5',
        file_masks: vec!["*".to_string()],
        local_options: vec!["age-limit 1".to_string()],
        std_options: Vec::new(),
        recipient: format!("file://{}", dst.display()),
    }];
    store_amg_data(&work.amg_data_file(), &rules).expect("amg_data");
    let job_id = rules[0].job_id();

    let fsa = Fsa::create(
        &work.fsa_file(),
        &[HostSeed { alias: "local".to_string(), ..HostSeed::default() }],
    )
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
    distpilot::fifo::mkfifo_if_missing(&work.sf_fin_fifo()).expect("fin fifo");

    // stage one file by hand, account for it, then let it age past 1 second
    let name = MsgName {
        job_id,
        dir_no: 0,
        creation_time: chrono::Utc::now().timestamp(),
        unique_number: 1,
        split_job_counter: 0,
    };
    let staging = work.staging_dir(&name.to_string());
    std::fs::create_dir_all(&staging).expect("staging");
    std::fs::write(staging.join("a.bin"), b"0123456789").expect("file");
    fsa.add_queued(0, 1, 10).expect("queued");

    std::thread::sleep(Duration::from_secs(3));

    let slot = fsa.claim_slot(0, job_id, 0).expect("claim").expect("slot");
    let task = WorkerTask {
        work: work.clone(),
        cfg: Config::default(),
        host_idx: 0,
        slot,
        msg_name: name.to_string(),
        toggle_hint: None,
        retries: 0,
    };
    let err = run_delivery(&task).expect_err("must age out");
    assert_eq!(err, DeliveryError::AllFilesAgedOut);

    // nothing delivered, staging gone, counters drained
    assert!(!dst.join("a.bin").exists());
    assert!(!staging.exists());
    let h = fsa.read_host(0).expect("host");
    assert_eq!(h.total_file_counter, 0);
    assert_eq!(h.total_file_size, 0);

    let recs = read_output_log(&work.log_dir().join("OUTPUT_LOG")).expect("log");
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].output_type, OT_AGE_LIMIT_DELETE);
    assert_eq!(recs[0].file_name, "a.bin");

    // the all-aged-out kind neither retries nor blames the host
    assert!(!err.is_retryable());
    assert!(!err.counts_against_host());
}
