use distpilot::amg::Amg;
use distpilot::config::{Config, WorkDir};
use distpilot::ruledb::{JobRule, Scheme, store_amg_data};
use distpilot::state::fsa::Fsa;
use distpilot::state::fra::Fra;
use distpilot::state::jid::Jid;

// Building the shared regions from the rule database: hosts deduped across
// rules, HOST_CONFIG overrides applied, directory options folded into the
// FRA record, the job catalogue complete, and the authoritative job list
// written for the dispatcher.

fn rules(src: &std::path::Path) -> Vec<JobRule> {
    vec![
        JobRule {
            dir: src.to_path_buf(),
            dir_alias: "feed".to_string(),
            priority: b'2',
            file_masks: vec!["*.bin".to_string()],
            local_options: vec![
                "accept dot files".to_string(),
                "max files 7".to_string(),
                "age-limit 120".to_string(),
            ],
            std_options: vec!["lock DOT".to_string()],
            recipient: "sftp://feed@edge.example:2022/in".to_string(),
        },
        JobRule {
            dir: src.to_path_buf(),
            dir_alias: "feed".to_string(),
            priority: b'7',
            file_masks: vec!["*.txt".to_string()],
            local_options: Vec::new(),
            std_options: Vec::new(),
            recipient: "scp://feed@edge.example:2022/txt".to_string(),
        },
    ]
}

#[test]
fn regions_reflect_rules_and_overrides() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("feed");
    std::fs::create_dir_all(&src).expect("src");
    let rules = rules(&src);
    store_amg_data(&work.amg_data_file(), &rules).expect("amg_data");
    std::fs::write(
        work.host_config_file(),
        r#"[{"alias":"edge.example","allowed_transfers":4,"max_errors":3,
            "second_hostname":"edge-b.example","auto_toggle":true,
            "transfer_rate_limit":8192}]"#,
    )
    .expect("host config");

    let amg = Amg::new(work.clone(), Config::default());
    let shared = amg.build_state().expect("state");
    drop(shared);

    // one host record for both rules, with the overrides applied
    let fsa = Fsa::attach(&work.fsa_file()).expect("fsa");
    assert_eq!(fsa.len(), 1);
    let hi = fsa.find_host("edge.example").expect("host");
    let h = fsa.read_host(hi).expect("read");
    assert_eq!(h.allowed_transfers, 4);
    assert_eq!(h.max_errors, 3);
    assert_eq!(h.auto_toggle, 1);
    assert_eq!(h.transfer_rate_limit, 8192);
    assert_eq!(h.current_real_hostname(), "edge.example");
    assert!(h.scheme_mask & Scheme::Sftp.bit() != 0);
    assert!(h.scheme_mask & Scheme::Scp.bit() != 0);

    // one directory record carrying the dir-level options
    let fra = Fra::attach(&work.fra_file()).expect("fra");
    assert_eq!(fra.len(), 1);
    let d = fra.read_dir(0).expect("dir");
    assert_eq!(d.alias(), "feed");
    assert_eq!(d.accept_dot_files, 1);
    assert_eq!(d.max_copied_files, 7);

    // both jobs catalogued with their recipients
    let jid = Jid::attach(&work.jid_file()).expect("jid");
    assert_eq!(jid.len(), 2);
    for rule in &rules {
        let j = jid.lookup(rule.job_id()).expect("job");
        assert_eq!(j.recipient(), rule.recipient);
        assert_eq!(j.host_alias(), "edge.example");
    }

    // the authoritative list names every live job id
    let list = std::fs::read_to_string(work.current_msg_list_file()).expect("list");
    for rule in &rules {
        assert!(list.contains(&format!("{:x}", rule.job_id())));
    }
}

#[test]
fn rebuild_bumps_generation_for_attached_readers() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let src = tmp.path().join("feed");
    std::fs::create_dir_all(&src).expect("src");
    store_amg_data(&work.amg_data_file(), &rules(&src)).expect("amg_data");

    let amg = Amg::new(work.clone(), Config::default());
    let _ = amg.build_state().expect("first build");
    let mut fsa = Fsa::attach(&work.fsa_file()).expect("attach");
    assert!(fsa.check_generation().is_ok());

    let _ = amg.build_state().expect("second build");
    assert!(fsa.check_generation().is_err(), "reader must notice the rebuild");
    fsa.reattach().expect("reattach");
    assert!(fsa.check_generation().is_ok());
}
