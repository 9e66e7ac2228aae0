use distpilot::config::WorkDir;
use distpilot::fd::dispatch::Dispatcher;
use distpilot::msg::Message;
use distpilot::state::fixed_str;
use distpilot::state::fsa::{ConnectState, Fsa, HostSeed, MAX_UNIQUE_NAME};

// Burst handshake, dispatcher side: a compatible busy slot receives the
// follow-on message name in its unique_name field; incompatible or already
// loaded slots are skipped.

fn msg(job_id: u32, unique: u32) -> Message {
    Message {
        priority: b'5',
        creation_time: 1000,
        unique_number: unique,
        split_job_counter: 0,
        job_id,
        dir_no: 0,
        dir_id: 1,
        host_alias: "edge".to_string(),
        files: 1,
        bytes: 4,
        retries: 0,
        next_start_time: 0,
    }
}

#[test]
fn burst_lands_in_compatible_active_slot_only() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let fsa = Fsa::create(
        &work.fsa_file(),
        &[HostSeed { alias: "edge".to_string(), allowed_transfers: 2, ..HostSeed::default() }],
    )
    .expect("fsa");
    let mut dispatcher = Dispatcher::new(work.clone());

    // no session at all: nothing to burst into
    assert!(!dispatcher.grant_burst(&fsa, 0, &msg(0x42, 2)));

    // a connecting slot is not burstable either
    let slot = fsa.claim_slot(0, 0x42, 2).expect("claim").expect("slot");
    assert!(!dispatcher.grant_burst(&fsa, 0, &msg(0x42, 2)));

    // once the worker is mid-session, the grant lands
    fsa.with_slot_mut(0, slot, |s| s.connect_status = ConnectState::Active.as_u8())
        .expect("slot");
    let m = msg(0x42, 2);
    assert!(dispatcher.grant_burst(&fsa, 0, &m));
    let s = fsa.read_slot(0, slot).expect("slot");
    assert_eq!(fixed_str(&s.unique_name), m.name().to_string());

    // the slot is loaded now: a second grant is refused
    assert!(!dispatcher.grant_burst(&fsa, 0, &msg(0x42, 3)));

    // a different job is never compatible
    let other_slot = fsa.claim_slot(0, 0x99, 2).expect("claim").expect("slot");
    fsa.with_slot_mut(0, other_slot, |s| s.connect_status = ConnectState::Active.as_u8())
        .expect("slot");
    assert!(!dispatcher.grant_burst(&fsa, 0, &msg(0x42, 4)));

    // the worker acknowledges by clearing the field
    fsa.with_slot_mut(0, slot, |s| {
        s.unique_name = [0; MAX_UNIQUE_NAME];
        s.connect_status = ConnectState::Burst.as_u8();
    })
    .expect("slot");
    assert!(dispatcher.grant_burst(&fsa, 0, &msg(0x42, 5)), "burst state accepts again");
}
