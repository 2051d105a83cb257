use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use super::backends::{CmdOptions, DummyOptions};
use super::{
    CmdTransport, Daemon, DummyTransport, Inbox, MessageTransport, Purpose, TransportBackend,
    TransportDaemons,
};
use crate::broker::topology::{EXCHANGE, INCOMING_MESSAGES, LOGS, transport_queue};
use crate::config::Settings;
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::utils::error::{DaemonError, HandlerError, WorkerError};
use crate::worker::{LogRecord, Producer, StandardWorker, Verdict, Worker};

const TICK: Duration = Duration::from_millis(10);

/// Records what it is asked to send and answers with a fixed verdict.
struct Recorder {
    sent: Arc<Mutex<Vec<String>>>,
    verdict: Verdict,
}

impl TransportBackend for Recorder {
    fn on_send_message(
        &mut self,
        message: &OutgoingMessage,
        _producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        self.sent.lock().unwrap().push(message.text.clone());
        Ok(self.verdict)
    }
}

/// Receives a fixed list of messages, then returns.
struct Scripted(Vec<(&'static str, &'static str)>);

impl TransportBackend for Scripted {
    fn start_incoming_messages_loop(&mut self, inbox: &mut Inbox<'_>) -> Result<(), HandlerError> {
        for (author, text) in &self.0 {
            inbox.dispatch(*author, *text)?;
        }
        Ok(())
    }
}

/// Keeps the defaults.
struct Idle;

impl TransportBackend for Idle {}

fn isolated() -> Settings {
    Settings::isolated(&Uuid::new_v4().to_string())
}

fn client(settings: &Settings) -> StandardWorker {
    let mut client = StandardWorker::new("client", settings);
    client.connect().unwrap();
    client
}

/// Queue an outgoing message on the relay queue of `transport`, as the
/// router would.
fn relay(settings: &Settings, transport: &str, text: &str) {
    let mut sender = MessageTransport::new(transport, Purpose::ReceiveMessages, Box::new(Idle), settings);
    sender.connect().unwrap();
    let body = OutgoingMessage::new("+1555", text)
        .on_channel(transport)
        .to_wire()
        .unwrap();
    sender
        .core_mut()
        .producer()
        .unwrap()
        .publish(&transport_queue(transport), body)
        .unwrap();
    sender.release().unwrap();
}

fn recorder(
    settings: &Settings,
    name: &str,
    verdict: Verdict,
) -> (MessageTransport, Arc<Mutex<Vec<String>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let backend = Recorder {
        sent: sent.clone(),
        verdict,
    };
    let transport = MessageTransport::new(name, Purpose::SendMessages, Box::new(backend), settings);
    (transport, sent)
}

#[test]
fn test_purpose_names() {
    assert_eq!(Purpose::SendMessages.to_string(), "send_messages");
    assert_eq!("receive_messages".parse::<Purpose>().unwrap(), Purpose::ReceiveMessages);
    assert!(matches!(
        "read_messages".parse::<Purpose>(),
        Err(DaemonError::UnknownPurpose(name)) if name == "read_messages"
    ));
}

#[test]
fn test_send_loop_delivers_and_acknowledges() {
    let settings = isolated();
    relay(&settings, "sms", "hello");
    relay(&settings, "sms", "world");

    let (mut transport, sent) = recorder(&settings, "sms", Verdict::Handled);
    transport
        .start_outgoing_messages_loop(TICK, Some(2))
        .unwrap();

    assert_eq!(*sent.lock().unwrap(), vec!["hello", "world"]);
    assert_eq!(transport.delivered(), 2);
    let mut client = client(&settings);
    assert!(
        client
            .core_mut()
            .connection()
            .unwrap()
            .get(&transport_queue("sms"))
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_undelivered_message_stays_queued() {
    let settings = isolated();
    relay(&settings, "sms", "hello");

    let (mut transport, sent) = recorder(&settings, "sms", Verdict::Pass);
    transport
        .start_outgoing_messages_loop(TICK, Some(2))
        .unwrap();
    assert_eq!(sent.lock().unwrap().len(), 1);
    assert_eq!(transport.delivered(), 0);

    let mut client = client(&settings);
    let delivery = client
        .core_mut()
        .connection()
        .unwrap()
        .get(&transport_queue("sms"))
        .unwrap()
        .unwrap();
    assert!(delivery.redelivered);
}

#[test]
fn test_send_loop_ignores_other_transports() {
    let settings = isolated();
    relay(&settings, "other", "not for sms");

    let (mut transport, sent) = recorder(&settings, "sms", Verdict::Handled);
    transport
        .start_outgoing_messages_loop(TICK, Some(2))
        .unwrap();
    assert!(sent.lock().unwrap().is_empty());
}

#[test]
fn test_delivery_limit_stops_send_loop() {
    let settings = isolated();
    relay(&settings, "sms", "first");
    relay(&settings, "sms", "second");

    let (transport, sent) = recorder(&settings, "sms", Verdict::Handled);
    let mut transport = transport.stop_after(1);
    let stats = transport
        .start_outgoing_messages_loop(TICK, Some(50))
        .unwrap();

    assert_eq!(stats.deliveries, 1);
    assert_eq!(*sent.lock().unwrap(), vec!["first"]);
}

#[test]
fn test_receive_loop_dispatches_on_transport_channel() {
    let settings = isolated();
    let backend = Scripted(vec![("+1555", "ping"), ("+1666", "pong")]);
    let mut transport =
        MessageTransport::new("sms", Purpose::ReceiveMessages, Box::new(backend), &settings);
    transport.run().unwrap();
    assert!(!transport.core().is_connected());

    let mut client = client(&settings);
    let connection = client.core_mut().connection().unwrap();
    let received: Vec<IncomingMessage> = std::iter::from_fn(|| connection.get(INCOMING_MESSAGES).unwrap())
        .map(|delivery| IncomingMessage::from_wire(&delivery.body).unwrap())
        .collect();
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|m| m.channel_name == "sms"));
    assert_eq!(received[0].author, "+1555");
    assert_eq!(received[1].text, "pong");
}

#[test]
fn test_default_receive_loop_idles_until_stopped() {
    let settings = isolated();
    let mut transport = MessageTransport::new("sms", Purpose::ReceiveMessages, Box::new(Idle), &settings);
    let running = transport.core().running_flag();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
    });
    transport.run().unwrap();
    stopper.join().unwrap();

    let mut client = client(&settings);
    let connection = client.core_mut().connection().unwrap();
    let lines: Vec<String> = std::iter::from_fn(|| connection.get(LOGS).unwrap())
        .map(|delivery| serde_json::from_value::<LogRecord>(delivery.body).unwrap().render())
        .collect();
    assert_eq!(
        lines,
        vec![
            "Transport \"sms\" starts listening for incoming messages",
            "Transport \"sms\" stops listening for incoming messages",
        ]
    );
}

#[test]
fn test_receive_loop_handler_error_is_reported() {
    struct Broken;
    impl TransportBackend for Broken {
        fn start_incoming_messages_loop(&mut self, _: &mut Inbox<'_>) -> Result<(), HandlerError> {
            Err("modem unplugged".into())
        }
    }

    let mut transport =
        MessageTransport::new("gsm", Purpose::ReceiveMessages, Box::new(Broken), &isolated());
    let err = transport.run().unwrap_err();
    assert!(matches!(err, WorkerError::Handler { reason, .. } if reason == "modem unplugged"));
    assert!(!transport.core().is_connected());
}

#[test]
fn test_dummy_transport_accepts_and_heartbeats() {
    let settings = isolated();
    relay(&settings, "default", "hello");
    let mut sender = MessageTransport::new(
        "default",
        Purpose::SendMessages,
        Box::new(DummyTransport::default()),
        &settings,
    );
    sender.start_outgoing_messages_loop(TICK, Some(2)).unwrap();
    assert_eq!(sender.delivered(), 1);

    let backend = DummyTransport::new(DummyOptions {
        activity: "testing".into(),
        interval_ms: 5,
    });
    let mut receiver =
        MessageTransport::new("default", Purpose::ReceiveMessages, Box::new(backend), &settings);
    let running = receiver.core().running_flag();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        running.store(false, Ordering::SeqCst);
    });
    receiver.run().unwrap();
    stopper.join().unwrap();

    let mut client = client(&settings);
    let connection = client.core_mut().connection().unwrap();
    let heartbeats = std::iter::from_fn(|| connection.get(LOGS).unwrap())
        .map(|delivery| serde_json::from_value::<LogRecord>(delivery.body).unwrap().render())
        .filter(|line| line == "Doing 'testing'")
        .count();
    assert!(heartbeats >= 1);
}

#[test]
fn test_cmd_transport_reads_lines() {
    let settings = isolated();
    let backend = CmdTransport::new(CmdOptions {
        phone_number: "+3360000".into(),
    })
    .with_input(Cursor::new("hello\n\n  world  \n"));
    let mut transport =
        MessageTransport::new("cmd", Purpose::ReceiveMessages, Box::new(backend), &settings);
    transport.run().unwrap();

    let mut client = client(&settings);
    let connection = client.core_mut().connection().unwrap();
    let texts: Vec<(String, String)> = std::iter::from_fn(|| connection.get(INCOMING_MESSAGES).unwrap())
        .map(|delivery| IncomingMessage::from_wire(&delivery.body).unwrap())
        .map(|m| (m.author, m.text))
        .collect();
    assert_eq!(
        texts,
        vec![
            ("+3360000".to_string(), "hello".to_string()),
            ("+3360000".to_string(), "world".to_string()),
        ]
    );
}

#[test]
fn test_fake_sms_reception_dispatches_then_stops_at_first_reply() {
    let settings = isolated();
    let (mut transport, sent) = recorder(&settings, "cmd", Verdict::Handled);

    // Stands in for the router: answers the first incoming message.
    let router_settings = settings.clone();
    let router = thread::spawn(move || {
        let mut client = client(&router_settings);
        let connection = client.core_mut().connection().unwrap();
        let incoming = loop {
            if let Some(delivery) = connection.get(INCOMING_MESSAGES).unwrap() {
                break IncomingMessage::from_wire(&delivery.body).unwrap();
            }
            thread::sleep(TICK);
        };
        let reply = incoming.create_response("pong").to_wire().unwrap();
        connection
            .publish(
                EXCHANGE,
                &transport_queue(&incoming.channel_name),
                reply,
            )
            .unwrap();
        incoming
    });

    let stats = transport.fake_sms_reception("+1555", "ping").unwrap();
    let incoming = router.join().unwrap();

    assert_eq!(incoming.author, "+1555");
    assert_eq!(incoming.channel_name, "cmd");
    assert_eq!(stats.deliveries, 1);
    assert_eq!(*sent.lock().unwrap(), vec!["pong"]);
}

#[test]
fn test_daemon_files_live_in_process_dir() {
    let tmp = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.process_dir = tmp.path().to_path_buf();

    let daemon = Daemon::with_program(&settings, "default", Purpose::SendMessages, "textroute");
    let dir = tmp.path().join("default");
    assert_eq!(daemon.pidfile(), dir.join("send_messages.pid"));
    assert_eq!(daemon.stdout_path(), dir.join("send_messages_stdout"));
    assert_eq!(daemon.stderr_path(), dir.join("send_messages_stderr"));
    assert_eq!(daemon.stdin_path(), dir.join("send_messages_stdin"));
}

#[test]
fn test_stopping_a_stopped_daemon_is_not_an_error() {
    let tmp = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.process_dir = tmp.path().to_path_buf();

    let mut daemons = TransportDaemons::with_program(&settings, "default", "textroute");
    assert_eq!(daemons.running(), 0);
    assert_eq!(daemons.stop().unwrap(), 0);
    assert_eq!(daemons.daemons().len(), 2);
}

#[test]
fn test_garbage_pidfile_means_not_running() {
    let tmp = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.process_dir = tmp.path().to_path_buf();

    let mut daemon =
        Daemon::with_program(&settings, "default", Purpose::ReceiveMessages, "textroute");
    std::fs::create_dir_all(tmp.path().join("default")).unwrap();
    std::fs::write(daemon.pidfile(), "not a pid\n").unwrap();

    assert_eq!(daemon.pid().unwrap(), None);
    assert!(!daemon.is_running());
    assert!(!daemon.stop().unwrap());
    assert!(!daemon.pidfile().exists());
}

#[test]
fn test_spawn_failure_keeps_process_files() {
    let tmp = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.process_dir = tmp.path().to_path_buf();

    let missing = tmp.path().join("no-such-program");
    let mut daemon = Daemon::with_program(&settings, "default", Purpose::SendMessages, missing);
    let err = daemon.start().unwrap_err();

    assert!(matches!(err, DaemonError::Spawn { name, .. } if name == "default/send_messages"));
    assert!(daemon.stdout_path().exists());
    assert!(daemon.stdin_path().exists());
    assert!(!daemon.pidfile().exists());
}
