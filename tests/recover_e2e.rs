use distpilot::config::WorkDir;
use distpilot::fd::queue::MsgQueue;
use distpilot::fd::recover::check_file_dir;
use distpilot::logging::DeleteLog;
use distpilot::msg::{Message, MsgName};
use distpilot::state::jid::{Jid, JobSeed};

// Crash recovery: the staging sweep removes directories of vanished jobs,
// re-enqueues live directories nobody mirrors, and prunes empty leftovers —
// reconstructing message identity from the directory name alone.

fn seed(job_id: u32) -> JobSeed {
    JobSeed {
        job_id,
        dir_id: 0x77,
        dir_no: 0,
        host_id: 1,
        priority: b'4',
        scheme: 0,
        no_of_files: 1,
        host_alias: "edge".to_string(),
        recipient: "sftp://u@edge/in".to_string(),
    }
}

#[test]
fn sweep_reconciles_staging_with_catalogue_and_queue() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let work = WorkDir::at(tmp.path().join("work"));
    work.ensure_layout().expect("layout");
    let jid = Jid::create(&work.jid_file(), &[seed(0xaa)]).expect("jid");
    let delete_log = DeleteLog::open(&work.log_dir()).expect("log");
    let mut queue = MsgQueue::new();

    // 1. live job, not mirrored, has a file -> re-enqueued
    let live = MsgName {
        job_id: 0xaa,
        dir_no: 0,
        creation_time: 0x68ab_0000,
        unique_number: 7,
        split_job_counter: 1,
    };
    let live_dir = work.staging_dir(&live.to_string());
    std::fs::create_dir_all(&live_dir).expect("dir");
    std::fs::write(live_dir.join("x.bin"), b"12345").expect("file");

    // 2. job no longer catalogued -> removed wholesale
    let orphan = MsgName {
        job_id: 0xdead,
        dir_no: 0,
        creation_time: 0x68ab_0001,
        unique_number: 8,
        split_job_counter: 0,
    };
    let orphan_dir = work.staging_dir(&orphan.to_string());
    std::fs::create_dir_all(&orphan_dir).expect("dir");
    std::fs::write(orphan_dir.join("y.bin"), b"zz").expect("file");

    // 3. live job, empty directory -> pruned
    let empty = MsgName {
        job_id: 0xaa,
        dir_no: 0,
        creation_time: 0x68ab_0002,
        unique_number: 9,
        split_job_counter: 0,
    };
    std::fs::create_dir_all(work.staging_dir(&empty.to_string())).expect("dir");

    // 4. live job already mirrored -> left alone
    let mirrored = MsgName {
        job_id: 0xaa,
        dir_no: 0,
        creation_time: 0x68ab_0003,
        unique_number: 10,
        split_job_counter: 0,
    };
    let mirrored_dir = work.staging_dir(&mirrored.to_string());
    std::fs::create_dir_all(&mirrored_dir).expect("dir");
    std::fs::write(mirrored_dir.join("z.bin"), b"1").expect("file");
    queue.push(Message {
        priority: b'4',
        creation_time: mirrored.creation_time,
        unique_number: mirrored.unique_number,
        split_job_counter: 0,
        job_id: 0xaa,
        dir_no: 0,
        dir_id: 0x77,
        host_alias: "edge".to_string(),
        files: 1,
        bytes: 1,
        retries: 0,
        next_start_time: 0,
    });

    let stats = check_file_dir(&work, &jid, &mut queue, &delete_log, 1000).expect("sweep");
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.removed_orphans, 1);
    assert_eq!(stats.removed_empty, 1);

    assert!(queue.contains(&live), "live staging must be re-enqueued");
    let m = queue.iter().find(|m| m.name() == live).expect("requeued");
    // identity reconstructed from the directory name
    assert_eq!(m.creation_time, 0x68ab_0000);
    assert_eq!(m.unique_number, 7);
    assert_eq!(m.split_job_counter, 1);
    assert_eq!(m.files, 1);
    assert_eq!(m.bytes, 5);
    assert_eq!(m.host_alias, "edge");
    assert_eq!(m.priority, b'4');

    assert!(!orphan_dir.exists(), "orphan staging must be removed");
    assert!(!work.staging_dir(&empty.to_string()).exists(), "empty dir pruned");
    assert!(mirrored_dir.exists(), "mirrored staging untouched");
    assert_eq!(queue.len(), 2);

    // a second sweep is a no-op
    let stats = check_file_dir(&work, &jid, &mut queue, &delete_log, 1001).expect("sweep");
    assert_eq!(stats, distpilot::fd::recover::RecoveryStats::default());
}
