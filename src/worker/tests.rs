use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::Level;
use uuid::Uuid;

use super::producer::LogRecord;
use super::standard;
use super::{Consumer, LoopStats, StandardWorker, Verdict, Worker, WorkerCore};
use crate::broker::Delivery;
use crate::broker::topology::{DEAD_LETTER, EXCHANGE, Exchange, LOGS, Queue};
use crate::config::Settings;
use crate::message::IncomingMessage;
use crate::utils::error::{BrokerError, WorkerError};

const TICK: Duration = Duration::from_millis(10);

/// What a scripted callback does.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Answer(&'static str, Verdict),
    Fail(&'static str),
    Crash(&'static str),
}

#[derive(Debug)]
struct Scripted {
    core: WorkerCore<Step>,
    steps: Vec<Step>,
    calls: Vec<&'static str>,
}

impl Scripted {
    fn new(settings: &Settings, steps: Vec<Step>) -> Self {
        Self {
            core: WorkerCore::new("scripted", settings),
            steps,
            calls: Vec::new(),
        }
    }
}

impl Worker for Scripted {
    type Callback = Step;

    fn core(&self) -> &WorkerCore<Step> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WorkerCore<Step> {
        &mut self.core
    }

    fn exchanges(&self) -> Vec<Exchange> {
        standard::exchanges(false)
    }

    fn queues(&self) -> Vec<Queue> {
        let mut queues = standard::queues(false);
        queues.push(standard::message_queue("work", false));
        queues
    }

    fn consumers(&self) -> Vec<Consumer<Step>> {
        vec![Consumer::new("work", self.steps.clone())]
    }

    fn handle(&mut self, step: &Step, _: &Delivery) -> Result<Verdict, WorkerError> {
        match step {
            Step::Answer(name, verdict) => {
                self.calls.push(name);
                Ok(*verdict)
            }
            Step::Fail(name) => {
                self.calls.push(name);
                Err(WorkerError::from_handler(name, "boom".into()))
            }
            Step::Crash(name) => {
                self.calls.push(name);
                Err(BrokerError::Closed.into())
            }
        }
    }
}

fn isolated() -> Settings {
    Settings::isolated(&Uuid::new_v4().to_string())
}

/// A second worker on the same virtual host, to publish and inspect queues.
fn client(settings: &Settings) -> StandardWorker {
    let mut client = StandardWorker::new("client", settings);
    client.connect().unwrap();
    client
}

fn publish(client: &mut StandardWorker, routing_key: &str, body: Value) {
    client
        .core_mut()
        .connection()
        .unwrap()
        .publish(EXCHANGE, routing_key, body)
        .unwrap();
}

fn get(client: &mut StandardWorker, queue: &str) -> Option<Delivery> {
    client.core_mut().connection().unwrap().get(queue).unwrap()
}

#[test]
fn test_verdicts() {
    assert!(!Verdict::Pass.acks());
    assert!(Verdict::Handled.acks());
    assert!(Verdict::Stop.acks());
    assert_eq!(Verdict::from(true), Verdict::Handled);
    assert_eq!(Verdict::from(false), Verdict::Pass);
}

#[test]
fn test_connect_is_idempotent() {
    let mut worker = Scripted::new(&isolated(), vec![]);
    assert!(!worker.core().is_connected());
    worker.connect().unwrap();
    worker.connect().unwrap();
    assert!(worker.core().is_connected());
    worker.release().unwrap();
    assert!(!worker.core().is_connected());
}

#[test]
fn test_purge_requires_connection() {
    let mut worker = Scripted::new(&isolated(), vec![]);
    assert!(matches!(worker.purge(), Err(WorkerError::NotBound)));
}

#[test]
fn test_unsupported_broker_transport_fails_connect() {
    let mut settings = isolated();
    settings.message_broker.transport = "carrier-pigeon".into();
    let mut worker = Scripted::new(&settings, vec![]);
    let err = worker.connect().unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Broker(BrokerError::UnsupportedTransport(_))
    ));
}

#[test]
fn test_main_loop_counts_down_idle_timeouts_only() {
    let settings = isolated();
    let mut worker = Scripted::new(&settings, vec![Step::Answer("a", Verdict::Handled)]);
    worker.connect().unwrap();
    let mut client = client(&settings);
    publish(&mut client, "work", json!(1));
    publish(&mut client, "work", json!(2));

    let stats = worker.main_loop(TICK, Some(3)).unwrap();
    assert_eq!(
        stats,
        LoopStats {
            deliveries: 2,
            timeouts: 3
        }
    );
}

#[test]
fn test_callbacks_fire_in_order_and_ack_once() {
    let settings = isolated();
    let mut worker = Scripted::new(
        &settings,
        vec![
            Step::Answer("first", Verdict::Pass),
            Step::Answer("second", Verdict::Handled),
            Step::Answer("third", Verdict::Handled),
        ],
    );
    worker.connect().unwrap();
    let mut client = client(&settings);
    publish(&mut client, "work", json!("x"));

    worker.main_loop(TICK, Some(1)).unwrap();
    assert_eq!(worker.calls, vec!["first", "second", "third"]);

    // Acked: nothing comes back once the worker is gone.
    worker.release().unwrap();
    assert!(get(&mut client, "work").is_none());
}

#[test]
fn test_unhandled_delivery_is_redelivered_after_release() {
    let settings = isolated();
    let mut worker = Scripted::new(&settings, vec![Step::Answer("idle", Verdict::Pass)]);
    worker.connect().unwrap();
    let mut client = client(&settings);
    publish(&mut client, "work", json!("x"));

    worker.main_loop(TICK, Some(1)).unwrap();
    worker.release().unwrap();

    let delivery = get(&mut client, "work").unwrap();
    assert!(delivery.redelivered);
}

#[test]
fn test_stop_verdict_skips_remaining_callbacks() {
    let settings = isolated();
    let mut worker = Scripted::new(
        &settings,
        vec![
            Step::Answer("veto", Verdict::Stop),
            Step::Answer("never", Verdict::Handled),
        ],
    );
    worker.connect().unwrap();
    let mut client = client(&settings);
    publish(&mut client, "work", json!("x"));

    worker.main_loop(TICK, Some(1)).unwrap();
    assert_eq!(worker.calls, vec!["veto"]);
    worker.release().unwrap();
    assert!(get(&mut client, "work").is_none());
}

#[test]
fn test_handler_error_is_not_fatal() {
    let settings = isolated();
    let mut worker = Scripted::new(
        &settings,
        vec![Step::Fail("broken"), Step::Answer("after", Verdict::Pass)],
    );
    worker.connect().unwrap();
    let mut client = client(&settings);
    publish(&mut client, "work", json!("x"));

    let stats = worker.main_loop(TICK, Some(1)).unwrap();
    assert_eq!(stats.deliveries, 1);
    assert_eq!(worker.calls, vec!["broken", "after"]);
}

#[test]
fn test_broker_error_in_callback_stops_the_loop() {
    let settings = isolated();
    let mut worker = Scripted::new(&settings, vec![Step::Crash("crash")]);
    let mut client = client(&settings);
    client
        .core_mut()
        .connection()
        .unwrap()
        .declare_queue(&standard::message_queue("work", false))
        .unwrap();
    publish(&mut client, "work", json!("x"));

    let err = worker.start(TICK, Some(5), Some(false)).unwrap_err();
    assert!(err.is_broker());
    // Released anyway, the message is back in its queue.
    assert!(!worker.core().is_connected());
    assert!(get(&mut client, "work").unwrap().redelivered);
}

#[test]
fn test_start_purges_when_asked() {
    let settings = isolated();
    let mut client = client(&settings);
    client
        .core_mut()
        .connection()
        .unwrap()
        .declare_queue(&standard::message_queue("work", false))
        .unwrap();
    publish(&mut client, "work", json!("stale"));

    let mut worker = Scripted::new(&settings, vec![Step::Answer("a", Verdict::Handled)]);
    let stats = worker.start(TICK, Some(2), Some(true)).unwrap();
    assert_eq!(stats.deliveries, 0);
    assert!(worker.calls.is_empty());
}

#[test]
fn test_start_purges_by_default_when_not_persistent() {
    let mut settings = isolated();
    settings.persistent_message_queues = false;
    let mut client = client(&settings);
    publish(&mut client, DEAD_LETTER, json!("old"));

    let mut worker = Scripted::new(&settings, vec![]);
    worker.start(TICK, Some(1), None).unwrap();
    assert!(get(&mut client, DEAD_LETTER).is_none());
}

#[test]
fn test_stop_clears_callbacks_and_flag() {
    let settings = isolated();
    let mut worker = Scripted::new(&settings, vec![Step::Answer("a", Verdict::Handled)]);
    worker.connect().unwrap();
    worker.stop();

    assert!(!worker.core().is_running());
    assert!(worker.core().consumers().iter().all(|c| c.callbacks.is_empty()));
    // The loop exits right away.
    assert_eq!(worker.main_loop(TICK, None).unwrap(), LoopStats::default());
    assert!(worker.core().is_connected());
}

#[test]
fn test_running_flag_stops_loop_from_another_thread() {
    let mut worker = Scripted::new(&isolated(), vec![]);
    worker.connect().unwrap();
    let flag = worker.core().running_flag();

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        flag.store(false, std::sync::atomic::Ordering::SeqCst);
    });
    let stats = worker.main_loop(TICK, None).unwrap();
    stopper.join().unwrap();
    assert!(stats.timeouts > 0);
}

#[test]
fn test_log_is_queued_when_connected() {
    let settings = isolated();
    let mut worker = Scripted::new(&settings, vec![]);
    worker.connect().unwrap();

    let mut kwargs = Map::new();
    kwargs.insert("count".into(), json!(3));
    worker
        .core_mut()
        .log(Level::WARN, "queue {} is {}", vec![json!("work"), json!("late")], kwargs);

    let mut client = client(&settings);
    let delivery = get(&mut client, LOGS).unwrap();
    let record: LogRecord = serde_json::from_value(delivery.body).unwrap();
    assert_eq!(record.lvl, "warn");
    assert_eq!(record.level(), Level::WARN);
    assert_eq!(record.origin, "scripted");
    assert_eq!(record.render(), "queue work is late count=3");
}

#[test]
fn test_log_without_connection_does_not_fail() {
    let mut worker = Scripted::new(&isolated(), vec![]);
    worker.log(Level::INFO, "not connected yet");
}

#[test]
fn test_log_record_render_keeps_extra_placeholders() {
    let record = LogRecord {
        lvl: "info".into(),
        msg: "{} and {}".into(),
        args: vec![json!(1)],
        kwargs: Map::new(),
        origin: String::new(),
    };
    assert_eq!(record.render(), "1 and {}");
}

#[test]
fn test_standard_worker_dispatch_keeps_message_for_router() {
    let settings = isolated();
    let mut client = StandardWorker::new("client", &settings);
    let message = IncomingMessage::new("+1555", "ping");
    client.dispatch(&message).unwrap();

    let delivery = get(&mut client, "incoming_messages").unwrap();
    let received = IncomingMessage::from_wire(&delivery.body).unwrap();
    assert_eq!(received, message);
}
