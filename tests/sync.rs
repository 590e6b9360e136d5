use std::io::{self, Cursor, Write};
use std::sync::Arc;

use depot::session::serve;
use depot::{
    Connection, Connector, DelayedWork, DelayedWorkQueue, Depot, DepotConfig, Job, MemoryStore,
    Session, SyncCoordinator, SyncState, WorkQueue,
};
use depot::logging::LogControl;
use parking_lot::Mutex;
use tempfile::TempDir;

fn coordinator(dir: &TempDir) -> SyncCoordinator {
    let delayed = DelayedWorkQueue::open(&dir.path().join("depot.work")).unwrap();
    SyncCoordinator::new(delayed, WorkQueue::new(None))
}

fn drain_live(sync: &SyncCoordinator) -> Vec<DelayedWork> {
    let mut items = Vec::new();
    while let Some(job) = sync.live_queue().try_take() {
        match job {
            Job::Apply(work) => items.push(work),
            other => panic!("unexpected job {:?}", other),
        }
    }
    items
}

#[test]
fn delayed_work_is_refused_while_unlocked() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let sync = coordinator(&temp_dir);
    assert!(!sync.work_queue_is_locked());
    assert!(!sync.add_delayed_work(&DelayedWork::suite("<a/>")).unwrap());
    assert_eq!(sync.delayed_len(), 0);

    sync.start_sync_response().unwrap();
    assert!(sync.work_queue_is_locked());
    assert!(sync.add_delayed_work(&DelayedWork::suite("<a/>")).unwrap());
    assert_eq!(sync.delayed_len(), 1);
}

#[test]
fn removing_the_lock_replays_in_order_once() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let sync = coordinator(&temp_dir);
    sync.start_sync_request().unwrap();
    assert_eq!(sync.state(), SyncState::RequestingSyncLocked);

    let work: Vec<DelayedWork> = (0..20)
        .map(|i| DelayedWork::report("host1", &format!("ctx{}", i), "<r/>"))
        .collect();
    for item in &work {
        sync.submit(item.clone()).unwrap();
    }
    assert!(sync.live_queue().is_empty());

    assert_eq!(sync.remove_sync_lock().unwrap(), 20);
    assert_eq!(sync.state(), SyncState::RequestingSyncUnlocked);
    assert!(sync.requesting_sync());
    assert!(!sync.work_queue_is_locked());
    assert_eq!(drain_live(&sync), work);

    // a second release finds nothing left to move
    assert_eq!(sync.remove_sync_lock().unwrap(), 0);
    sync.submit(DelayedWork::suite("<late/>")).unwrap();
    assert_eq!(drain_live(&sync), vec![DelayedWork::suite("<late/>")]);

    sync.end_sync().unwrap();
    assert_eq!(sync.state(), SyncState::NotSynchronizing);
}

#[test]
fn only_one_sync_at_a_time() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let sync = coordinator(&temp_dir);
    sync.start_sync_response().unwrap();
    let err = sync.start_sync_request().unwrap_err();
    assert_eq!(err.to_string(), "synchronizing");
    assert!(sync.responding_to_sync());

    sync.submit(DelayedWork::suite("<a/>")).unwrap();
    sync.end_sync().unwrap();
    assert!(!sync.sync_in_progress());
    assert_eq!(drain_live(&sync), vec![DelayedWork::suite("<a/>")]);
    sync.start_sync_request().unwrap();
}

#[test]
fn recovery_resubmits_or_discards() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    {
        let sync = coordinator(&temp_dir);
        sync.start_sync_request().unwrap();
        sync.submit(DelayedWork::suite("<one/>")).unwrap();
        sync.submit(DelayedWork::suite("<two/>")).unwrap();
        // dropped while locked, as if the process died mid sync
    }

    let sync = coordinator(&temp_dir);
    assert_eq!(sync.delayed_len(), 2);
    assert_eq!(sync.recover(true).unwrap(), 2);
    assert_eq!(
        drain_live(&sync),
        vec![DelayedWork::suite("<one/>"), DelayedWork::suite("<two/>")]
    );

    sync.start_sync_request().unwrap();
    sync.submit(DelayedWork::suite("<stale/>")).unwrap();
    drop(sync);
    let sync = coordinator(&temp_dir);
    assert_eq!(sync.recover(false).unwrap(), 1);
    assert_eq!(sync.delayed_len(), 0);
    assert!(sync.live_queue().is_empty());
}

#[derive(Clone, Default)]
struct Output(Arc<Mutex<Vec<u8>>>);

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Output {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

// runs `input` through a depot session and returns what the depot wrote back
fn converse(depot: &Arc<Depot>, input: &str) -> String {
    let output = Output::default();
    let connection = Connection {
        reader: Box::new(Cursor::new(input.as_bytes().to_vec())),
        writer: Box::new(output.clone()),
        session: Session::anonymous(),
    };
    serve(&depot.registry(), connection).unwrap();
    output.text()
}

fn open_depot(dir: &TempDir) -> Arc<Depot> {
    let config = DepotConfig {
        var_dir: dir.path().to_path_buf(),
        ..DepotConfig::default()
    };
    Depot::open(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(LogControl::detached()),
        Connector::new(),
    )
    .unwrap()
}

fn report(context: &str) -> String {
    format!(
        "REPORT host1\n{}\n\r\nSTDOUT <report/>\r\nSYSUSAGE cpu_secs=1\r\n",
        context
    )
}

#[test]
fn inserts_during_syncstart_reach_the_live_queue_in_order() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let depot = open_depot(&temp_dir);

    let input = format!("SYNCSTART\r\n{}{}{}", report("a"), report("b"), report("c"));
    assert_eq!(converse(&depot, &input), "OK\r\nOK a\r\nOK b\r\nOK c\r\n");
    assert_eq!(depot.sync().delayed_len(), 3);
    assert!(depot.work_queue().is_empty());

    assert_eq!(converse(&depot, "SYNCEND\r\n"), "OK\r\n");
    assert_eq!(depot.sync().state(), SyncState::NotSynchronizing);
    let contexts: Vec<String> = drain_live(depot.sync())
        .into_iter()
        .map(|work| match work {
            DelayedWork::InsertReport(report) => report.context,
            other => panic!("unexpected work {}", other),
        })
        .collect();
    assert_eq!(contexts, vec!["a", "b", "c"]);
}

#[test]
fn second_syncstart_is_refused() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let depot = open_depot(&temp_dir);
    assert_eq!(
        converse(&depot, "SYNCSTART\r\nSYNCSTART\r\nSYNC\r\n"),
        "OK\r\nERROR synchronizing\r\nERROR synchronizing\r\n"
    );
}

#[test]
fn sync_response_streams_a_snapshot_and_closes() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let depot = open_depot(&temp_dir);
    depot.store().apply(&DelayedWork::suite("<suite/>")).unwrap();

    let reply = converse(&depot, "SYNC\r\nPING never read\r\n");
    assert!(reply.starts_with("OK "));
    assert!(reply.ends_with("\r\n"));
    assert_eq!(reply.matches("\r\n").count(), 1);
    assert!(!depot.sync().sync_in_progress());

    // the payload loads into another store
    let saved = temp_dir.path().join("snapshot.b64");
    std::fs::write(&saved, reply.trim_start_matches("OK ").trim_end()).unwrap();
    let target = MemoryStore::new();
    assert_eq!(depot::depot::load_sync_data(&target, &saved).unwrap(), 1);
    assert_eq!(target.items(), vec![DelayedWork::suite("<suite/>")]);
}

#[test]
fn report_without_stdout_is_rejected() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let depot = open_depot(&temp_dir);
    let reply = converse(&depot, "REPORT host1 ctx\r\nSYSUSAGE x\r\n");
    assert!(reply.starts_with("ERROR STDOUT section missing from REPORT message\r\n"));
    assert!(depot.work_queue().is_empty());
}
