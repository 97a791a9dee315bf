//! End-to-end scenarios driving the public runtime surface.

use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use lpel::{
    platform, yield_current, Config, Error, Flags, Lpel, Mode, MonitorConfig, MonitorFlags,
    Stream, StreamDesc, TaskState,
};

const STACK: usize = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn monitored_config(num_workers: usize, dir: &std::path::Path, tag: &str) -> Config {
    Config {
        num_workers,
        monitoring: Some(MonitorConfig {
            prefix: format!("{}/{}_", dir.display(), tag),
            postfix: ".log".into(),
        }),
        ..Config::default()
    }
}

/// Dispatch count from the final (zombie) stop record of the named task.
fn disp_of(log: &str, name: &str) -> u64 {
    log.lines()
        .filter(|l| l.contains(&format!(" {name} ")) && l.contains("st Z"))
        .map(|l| {
            let toks: Vec<&str> = l.split_whitespace().collect();
            let i = toks.iter().position(|t| *t == "disp").unwrap();
            toks[i + 1].parse().unwrap()
        })
        .next_back()
        .unwrap_or_else(|| panic!("no zombie record for {name} in: {log}"))
}

#[test]
fn ping_pong_on_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Lpel::init(monitored_config(1, dir.path(), "e1")).unwrap();

    let s = Stream::new(4);

    let sp = Arc::clone(&s);
    let producer = rt.task_create(
        0,
        move || {
            let w = StreamDesc::open(&sp, Mode::Write);
            for v in 1..=3 {
                w.write(v);
                yield_current();
            }
            w.close();
        },
        STACK,
    );
    rt.task_monitor(&producer, "prod", MonitorFlags::NONE);

    let (tx, rx) = mpsc::channel();
    let sc = Arc::clone(&s);
    let consumer = rt.task_create(
        0,
        move || {
            let r = StreamDesc::open(&sc, Mode::Read);
            for _ in 0..3 {
                tx.send(r.read()).unwrap();
                yield_current();
            }
            r.close();
        },
        STACK,
    );
    rt.task_monitor(&consumer, "cons", MonitorFlags::NONE);

    rt.task_run(Arc::clone(&producer));
    rt.task_run(Arc::clone(&consumer));

    let got: Vec<i32> = (0..3)
        .map(|_| rx.recv_timeout(RECV_TIMEOUT).unwrap())
        .collect();
    assert_eq!(got, vec![1, 2, 3]);

    rt.stop();
    rt.cleanup();
    assert_eq!(producer.state(), TaskState::Zombie);
    assert_eq!(consumer.state(), TaskState::Zombie);

    let log = fs::read_to_string(dir.path().join("e1_worker00.log")).unwrap();
    assert!(disp_of(&log, "prod") >= 3, "log: {log}");
    assert!(disp_of(&log, "cons") >= 3, "log: {log}");
}

#[test]
fn cross_worker_wake_records_input_block() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Lpel::init(monitored_config(2, dir.path(), "e2")).unwrap();

    let s = Stream::new(4);

    let (tx, rx) = mpsc::channel();
    let sc = Arc::clone(&s);
    let sink = rt.task_create(
        1,
        move || {
            let r = StreamDesc::open(&sc, Mode::Read);
            tx.send(r.read()).unwrap();
            r.close();
        },
        STACK,
    );
    rt.task_monitor(&sink, "sink", MonitorFlags::STREAMS);
    rt.task_run(sink);

    // Let the sink block on the empty stream before the source exists.
    std::thread::sleep(Duration::from_millis(100));

    let sp = Arc::clone(&s);
    let source = rt.task_create(
        0,
        move || {
            let w = StreamDesc::open(&sp, Mode::Write);
            w.write(42);
            w.close();
        },
        STACK,
    );
    rt.task_run(source);

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 42);
    rt.stop();
    rt.cleanup();

    let log = fs::read_to_string(dir.path().join("e2_worker01.log")).unwrap();
    assert!(log.contains("st Bi"), "log: {log}");
}

#[test]
fn exclusive_without_pinned_is_invalid() {
    let cfg = Config {
        flags: Flags::EXCLUSIVE,
        ..Config::default()
    };
    assert!(matches!(Lpel::init(cfg), Err(Error::Inval)));
}

#[test]
fn exclusive_without_capability_is_rejected() {
    // Only meaningful where the probe works and answers "no".
    if platform::can_set_exclusive() != Ok(false) {
        return;
    }
    let cfg = Config {
        flags: Flags::PINNED | Flags::EXCLUSIVE,
        ..Config::default()
    };
    assert!(matches!(Lpel::init(cfg), Err(Error::Excl)));
}

#[test]
fn shutdown_drains_all_ready_tasks() {
    let rt = Lpel::init(Config {
        num_workers: 4,
        ..Config::default()
    })
    .unwrap();

    static DONE: AtomicU32 = AtomicU32::new(0);

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let t = rt.task_create(
                i % 4,
                || {
                    yield_current();
                    DONE.fetch_add(1, Ordering::SeqCst);
                },
                STACK,
            );
            rt.task_run(Arc::clone(&t));
            t
        })
        .collect();

    rt.stop();
    rt.cleanup();

    assert_eq!(DONE.load(Ordering::SeqCst), 100);
    for t in &tasks {
        assert_eq!(t.state(), TaskState::Zombie);
    }
}

#[test]
fn dirty_list_flush_shows_open_and_close() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Lpel::init(monitored_config(1, dir.path(), "e6")).unwrap();

    let s: Arc<Stream<u8>> = Stream::new(4);
    let sid = s.uid();

    let sp = Arc::clone(&s);
    let t = rt.task_create(
        0,
        move || {
            let w = StreamDesc::open(&sp, Mode::Write);
            w.write(1);
            w.close();
        },
        STACK,
    );
    rt.task_monitor(&t, "", MonitorFlags::STREAMS);
    rt.task_run(t);

    rt.stop();
    rt.cleanup();

    let log = fs::read_to_string(dir.path().join("e6_worker00.log")).unwrap();
    let expected = format!("[{sid},w,O,1,--*;{sid},w,C,1,---;] ");
    assert!(log.contains(&expected), "log: {log}");
}

#[test]
fn capacity_one_stream_alternates() {
    let rt = Lpel::init(Config::default()).unwrap();

    let s = Stream::new(1);

    let sp = Arc::clone(&s);
    let producer = rt.task_create(
        0,
        move || {
            let w = StreamDesc::open(&sp, Mode::Write);
            for v in 1..=6 {
                w.write(v);
            }
            w.close();
        },
        STACK,
    );

    let (tx, rx) = mpsc::channel();
    let sc = Arc::clone(&s);
    let consumer = rt.task_create(
        0,
        move || {
            let r = StreamDesc::open(&sc, Mode::Read);
            for _ in 0..6 {
                tx.send(r.read()).unwrap();
            }
            r.close();
        },
        STACK,
    );

    rt.task_run(producer);
    rt.task_run(consumer);

    let got: Vec<i32> = (0..6)
        .map(|_| rx.recv_timeout(RECV_TIMEOUT).unwrap())
        .collect();
    assert_eq!(got, vec![1, 2, 3, 4, 5, 6]);

    rt.stop();
    rt.cleanup();
}

#[test]
fn default_stack_size_runs_simple_tasks() {
    let rt = Lpel::init(Config::default()).unwrap();

    let (tx, rx) = mpsc::channel();
    let t = rt.task_create(
        0,
        move || {
            let mut acc: u64 = 0;
            for i in 0..1000u64 {
                acc = acc.wrapping_add(i * i);
            }
            tx.send(acc).unwrap();
        },
        0,
    );
    rt.task_run(t);

    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        (0..1000u64).map(|i| i * i).sum::<u64>()
    );

    rt.stop();
    rt.cleanup();
}

#[test]
fn explicit_exit_terminates_task() {
    let rt = Lpel::init(Config::default()).unwrap();

    let (tx, rx) = mpsc::channel();
    let t = rt.task_create(
        0,
        move || {
            tx.send(1).unwrap();
            lpel::exit_current();
        },
        STACK,
    );
    rt.task_run(Arc::clone(&t));

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 1);
    for _ in 0..500 {
        if t.state() == TaskState::Zombie {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(t.state(), TaskState::Zombie);

    rt.stop();
    rt.cleanup();
}

#[test]
fn thread_assign_pins_caller() {
    let rt = Lpel::init(Config::default()).unwrap();
    // The others set covers the worker cores here; pinning the test
    // thread to it must succeed.
    rt.thread_assign(-1).unwrap();
    rt.thread_assign(0).unwrap();
    rt.stop();
    rt.cleanup();
}
