use std::io::BufRead;
use std::os::unix::fs::MetadataExt;

use distpilot::amg::Amg;
use distpilot::config::{Config, WorkDir};
use distpilot::msg::Message;
use distpilot::ruledb::{JobRule, store_amg_data};
use distpilot::state::fsa::Fsa;
use distpilot::workers::{WorkerTask, run_delivery};

// One file matched by two destinations on the same filesystem: both staging
// directories share the inode, the source disappears once both are staged,
// and both deliveries succeed independently.

#[test]
fn one_file_two_destinations_both_delivered() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("in");
    std::fs::create_dir_all(&src).expect("src");
    let out1 = tmp.path().join("out1");
    let out2 = tmp.path().join("out2");

    let mk_rule = |out: &std::path::Path| JobRule {
        dir: src.clone(),
        dir_alias: "in".to_string(),
        priority: b'5',
        file_masks: vec!["*".to_string()],
        local_options: Vec::new(),
        std_options: Vec::new(),
        recipient: format!("file://{}", out.display()),
    };
    let rules = vec![mk_rule(&out1), mk_rule(&out2)];
    store_amg_data(&work.amg_data_file(), &rules).expect("amg_data");
    distpilot::fifo::mkfifo_if_missing(&work.msg_fifo()).expect("fifo");
    distpilot::fifo::mkfifo_if_missing(&work.sf_fin_fifo()).expect("fin");

    std::fs::write(src.join("a.bin"), b"both of you").expect("drop");

    let amg = Amg::new(work.clone(), Config::default());
    let shared = amg.build_state().expect("state");
    amg.scan_once(&shared).expect("scan");

    assert!(!src.join("a.bin").exists(), "source consumed after staging");

    // both messages are on the pipe
    let f = distpilot::fifo::open_rw(&work.msg_fifo()).expect("fifo");
    let mut reader = std::io::BufReader::new(f);
    let mut msgs: Vec<Message> = Vec::new();
    for _ in 0..2 {
        let mut line = String::new();
        reader.read_line(&mut line).expect("line");
        msgs.push(serde_json::from_str(line.trim()).expect("json"));
    }
    assert_ne!(msgs[0].job_id, msgs[1].job_id);

    // staged copies share one inode until delivery
    let p0 = work.staging_dir(&msgs[0].name().to_string()).join("a.bin");
    let p1 = work.staging_dir(&msgs[1].name().to_string()).join("a.bin");
    assert_eq!(
        std::fs::metadata(&p0).expect("p0").ino(),
        std::fs::metadata(&p1).expect("p1").ino()
    );

    let fsa = Fsa::attach(&work.fsa_file()).expect("fsa");
    for msg in &msgs {
        let hi = fsa.find_host(&msg.host_alias).expect("host");
        let slot = fsa.claim_slot(hi, msg.job_id, 0).expect("claim").expect("slot");
        run_delivery(&WorkerTask {
            work: work.clone(),
            cfg: Config::default(),
            host_idx: hi,
            slot,
            msg_name: msg.name().to_string(),
            toggle_hint: None,
            retries: 0,
        })
        .expect("delivery");
    }

    assert_eq!(std::fs::read(out1.join("a.bin")).expect("out1"), b"both of you");
    assert_eq!(std::fs::read(out2.join("a.bin")).expect("out2"), b"both of you");
    assert!(!p0.exists() && !p1.exists(), "staged links consumed");
}
