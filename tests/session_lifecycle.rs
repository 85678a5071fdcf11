//! Call session lifecycle against a journaling fake engine.

mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use support::{pcmu, FakeEngine, FakeSockets, Journal};
use voe_call::engine::{Facet, Transport};
use voe_call::observer::EngineEvent;
use voe_call::session::TransportFactory;
use voe_call::transport::SocketTransport;
use voe_call::{
    CallSession, EngineInstance, MediaSelection, SessionConfig, SessionState, Step, StepFailure,
    StopSignal, VoeError,
};

struct Harness {
    journal: Journal,
    engine: Arc<FakeEngine>,
    sockets: Arc<FakeSockets>,
}

impl Harness {
    fn new() -> Self {
        let journal = Journal::default();
        Self {
            engine: FakeEngine::new(journal.clone()),
            sockets: FakeSockets::new(journal.clone()),
            journal,
        }
    }

    fn session(&self, config: SessionConfig) -> CallSession {
        let sockets = self.sockets.clone();
        let factory: TransportFactory =
            Arc::new(move |_channel| sockets.clone() as Arc<dyn SocketTransport>);
        let instance = EngineInstance::create(self.engine.clone());
        CallSession::with_transport_factory(instance, config, factory)
    }

    fn before(&self, first: &str, second: &str) -> bool {
        match (self.journal.position(first), self.journal.position(second)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

#[test]
fn test_happy_path_call() {
    let h = Harness::new();
    let mut session = h.session(SessionConfig::default());

    session.bring_up(&MediaSelection::default()).unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.channel(), Some(0));
    assert_eq!(session.version(), Some("FakeEngine 1.0"));
    assert_eq!(session.send_codec(), Some(&pcmu()));
    assert_eq!(h.engine.send_codec(), Some((0, pcmu())));

    // Addresses from the defaults, destination set before the receiver
    assert_eq!(h.sockets.local_port(), Some(800));
    assert_eq!(
        h.sockets.destination(),
        Some("127.0.0.1:800".parse().unwrap())
    );
    assert_eq!(h.sockets.receive_buffers(), Some(500));
    assert!(h.before("InitializeSendSockets", "InitializeReceiveSockets"));
    assert!(h.engine.has_transport(0));

    assert_eq!(
        h.journal.only(&["StartReceive", "StartPlayout", "StartSend"]),
        vec!["StartReceive", "StartPlayout", "StartSend"]
    );
    assert!(h.before("StartSend", "StartRecordingMicrophone"));

    // Inbound packet reaches the channel verbatim
    let packet: Vec<u8> = (0..20).collect();
    assert!(h.sockets.deliver_rtp(&packet));
    assert_eq!(h.engine.received_rtp(), vec![(0, packet)]);
    assert_eq!(session.relay_stats().unwrap().rtp_forwarded, 1);

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::TornDown);
    assert_eq!(
        h.journal.only(&["StopSend", "StopPlayout", "StopReceive"]),
        vec!["StopSend", "StopPlayout", "StopReceive"]
    );
    assert!(h.before("StopRecordingMicrophone", "StopSend"));

    let report = session.teardown().unwrap();
    assert_eq!(report.remaining_references, 0);
    assert_eq!(session.state(), SessionState::Terminated);

    assert!(h.before("DeRegisterExternalTransport", "DestroySockets"));
    assert!(h.before("DestroySockets", "DeleteChannel"));
    assert!(h.before("DeleteChannel", "DeregisterObserver"));
    assert!(h.before("DeregisterObserver", "Terminate"));
    assert!(h.before("Terminate", "Delete"));
    assert_eq!(h.engine.total_references(), 0);
    assert!(h.engine.is_deleted());

    // Stops issued once, by stop() only
    assert_eq!(h.journal.only(&["StopSend"]).len(), 1);
}

#[test]
fn test_start_receive_failure_aborts_and_teardown_cleans_up() {
    let h = Harness::new();
    h.engine.fail("StartReceive", -1);
    let mut session = h.session(SessionConfig::default());

    let err = session.bring_up(&MediaSelection::default()).unwrap_err();
    assert!(matches!(
        err,
        VoeError::FacetCallFailed {
            step: Step::StartReceive,
            code: -1,
            last_error: None
        }
    ));
    assert_eq!(session.state(), SessionState::Configured);
    assert!(!h.journal.contains("StartPlayout"));
    assert!(!h.journal.contains("StartSend"));
    assert!(!h.journal.contains("StartRecordingMicrophone"));

    let report = session.teardown().unwrap();
    assert_eq!(report.remaining_references, 0);
    assert!(!h.journal.contains("StopReceive"));
    assert!(h.journal.contains("DeRegisterExternalTransport"));
    assert!(h.journal.contains("DeleteChannel"));
    assert!(h.engine.is_deleted());
    assert_eq!(h.engine.total_references(), 0);
}

#[test]
fn test_failure_carries_engine_last_error() {
    let h = Harness::new();
    h.engine.fail("StartSend", -1);
    h.engine.set_last_error(8104);
    let mut session = h.session(SessionConfig::default());

    let err = session.bring_up(&MediaSelection::default()).unwrap_err();
    assert!(matches!(
        err,
        VoeError::FacetCallFailed {
            step: Step::StartSend,
            code: -1,
            last_error: Some(8104)
        }
    ));
    assert!(err.to_string().contains("engine error 8104"));
    assert!(h.before("StartSend", "LastError"));

    session.teardown().unwrap();
}

#[test]
fn test_teardown_attempts_every_step_and_reports_failures() {
    let h = Harness::new();
    h.engine.fail("StopSend", -1);
    h.engine.fail("DeleteChannel", 8002);
    let mut session = h.session(SessionConfig::default());
    session.bring_up(&MediaSelection::default()).unwrap();

    let err = session.teardown().unwrap_err();
    match err {
        VoeError::TeardownPartialFailure { steps } => assert_eq!(
            steps,
            vec![
                StepFailure {
                    step: Step::StopSend,
                    code: -1
                },
                StepFailure {
                    step: Step::DeleteChannel,
                    code: 8002
                },
            ]
        ),
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(h.journal.contains("StopPlayout"));
    assert!(h.journal.contains("StopReceive"));
    assert!(h.journal.contains("Terminate"));
    assert!(h.journal.contains("Delete"));
    assert_eq!(h.engine.total_references(), 0);
}

#[test]
fn test_bind_failure_still_destroys_relay() {
    let h = Harness::new();
    h.sockets.fail_bind();
    let mut session = h.session(SessionConfig::default());

    let err = session.bring_up(&MediaSelection::default()).unwrap_err();
    assert!(matches!(err, VoeError::BindFailed { port: 800, .. }));
    assert_eq!(session.state(), SessionState::ChannelCreated);

    session.teardown().unwrap();
    assert!(h.sockets.is_destroyed());
    assert!(h.before("DeRegisterExternalTransport", "DeleteChannel"));
    assert!(!h.engine.has_transport(0));
}

#[test]
fn test_invalid_destination_is_rejected_before_binding() {
    let h = Harness::new();
    let config = SessionConfig {
        remote_ip: "not-an-address".to_string(),
        ..Default::default()
    };
    let mut session = h.session(config);

    let err = session.bring_up(&MediaSelection::default()).unwrap_err();
    assert!(matches!(err, VoeError::InvalidDestination { port: 800, .. }));
    assert!(!h.journal.contains("InitializeReceiveSockets"));
    session.teardown().unwrap();
}

#[test]
fn test_recording_failure_is_fatal() {
    let h = Harness::new();
    h.engine.fail("StartRecordingPlayout", -1);
    let mut session = h.session(SessionConfig::default());

    let err = session.bring_up(&MediaSelection::default()).unwrap_err();
    assert!(matches!(
        err,
        VoeError::FacetCallFailed {
            step: Step::StartRecordingPlayout,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Active);

    // Microphone recording had started and is stopped on the way out
    session.teardown().unwrap();
    assert!(h.journal.contains("StopRecordingMicrophone"));
    assert!(!h.journal.contains("StopRecordingPlayout"));
    assert!(h.journal.contains("StopSend"));
}

#[test]
fn test_recording_disabled() {
    let h = Harness::new();
    let mut config = SessionConfig::default();
    config.recording.enabled = false;
    let mut session = h.session(config);

    session.bring_up(&MediaSelection::default()).unwrap();
    session.teardown().unwrap();
    assert!(!h.journal.contains("StartRecordingMicrophone"));
    assert!(!h.journal.contains("StopRecordingMicrophone"));
}

#[test]
fn test_observer_classifies_notifications() {
    let h = Harness::new();
    let mut session = h.session(SessionConfig::default());
    session.init().unwrap();
    session.create_channel().unwrap();

    assert!(h.engine.raise(0, 8035));
    assert!(h.engine.raise(0, 10019));
    assert!(h.engine.raise(0, 9999));

    let observer = session.observer().clone();
    assert_eq!(observer.count(EngineEvent::ReceivePacketTimeout), 1);
    assert_eq!(observer.count(EngineEvent::RuntimePlayError), 1);
    let stats = observer.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.unrecognized, 1);
    assert_eq!(stats.last_code, Some(9999));

    session.teardown().unwrap();
    assert!(!h.engine.raise(0, 8035));
    assert_eq!(observer.stats().total, 3);
}

#[test]
fn test_version_failure_is_not_fatal() {
    let h = Harness::new();
    h.engine.fail("GetVersion", -1);
    let mut session = h.session(SessionConfig::default());

    session.init().unwrap();
    assert_eq!(session.create_channel().unwrap(), 0);
    assert_eq!(session.version(), None);
    session.teardown().unwrap();
}

#[test]
fn test_mic_volume_out_of_range_is_reported_not_rejected() {
    let h = Harness::new();
    h.engine.set_mic_volume(0);
    let mut session = h.session(SessionConfig::default());
    session.init().unwrap();

    assert_eq!(session.mic_volume().unwrap(), 0);
    session.teardown().unwrap();
}

#[test]
fn test_codec_and_device_listing() {
    let h = Harness::new();
    let mut session = h.session(SessionConfig::default());
    session.init().unwrap();

    let codecs = session.codecs().unwrap();
    assert_eq!(codecs.len(), 2);
    assert_eq!(codecs[1].plname, "PCMA");

    let devices = session.devices().unwrap();
    assert_eq!(devices.playout[0].name, "Speaker 0");
    assert_eq!(devices.recording[0].guid, "mic-0");
    session.teardown().unwrap();
}

#[test]
fn test_outbound_packets_go_through_sockets() {
    let h = Harness::new();
    let mut session = h.session(SessionConfig::default());
    session.bring_up(&MediaSelection::default()).unwrap();

    let transport = h.engine.transport(0).unwrap();
    transport.send_rtp(0, &[0x80, 0, 0, 1]).unwrap();
    transport.send_rtcp(0, &[0x80, 200, 0, 6]).unwrap();
    assert_eq!(h.sockets.sent_rtp(), vec![vec![0x80, 0, 0, 1]]);
    assert_eq!(h.sockets.sent_rtcp().len(), 1);
    assert_eq!(session.relay_stats().unwrap().sent, 2);

    session.teardown().unwrap();
}

#[test]
fn test_run_waits_for_stop_signal() {
    let h = Harness::new();
    let mut session = h.session(SessionConfig::default());
    let stop = StopSignal::new();

    let trigger = stop.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.trigger();
    });

    let report = session.run(&MediaSelection::default(), &stop).unwrap();
    handle.join().unwrap();
    assert_eq!(report.remaining_references, 0);
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(h.before("StopSend", "DeleteChannel"));
}

#[test]
fn test_run_reports_setup_error_after_teardown() {
    let h = Harness::new();
    h.engine.fail("Init", -1);
    let mut session = h.session(SessionConfig::default());

    let err = session
        .run(&MediaSelection::default(), &StopSignal::new())
        .unwrap_err();
    assert!(matches!(
        err,
        VoeError::FacetCallFailed {
            step: Step::Init,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(!h.journal.contains("Terminate"));
    assert_eq!(h.engine.references(Facet::Base), 0);
}

#[test]
fn test_dropping_active_session_tears_down() {
    let h = Harness::new();
    {
        let mut session = h.session(SessionConfig::default());
        session.bring_up(&MediaSelection::default()).unwrap();
    }
    assert!(h.journal.contains("StopSend"));
    assert!(h.journal.contains("DeleteChannel"));
    assert!(h.engine.is_deleted());
}
