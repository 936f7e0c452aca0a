use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beep_core::peer::mock::{MockBehavior, MockConnector, MockPeer};
use beep_core::{
    AudioChunk, DispatchOutcome, GenerationError, GenerationOutcome, IceCandidate, IceError,
    NegotiationEngine, NegotiationState, SdpKind, SessionDescription, SessionOptions,
    SignalMessage, SignalRouter, Signaler, Sink, SinkRegistry,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

struct ChannelSignaler {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Signaler for ChannelSignaler {
    async fn signal(&self, payload: String) {
        let _ = self.tx.send(payload);
    }
}

fn channel_signaler() -> (Arc<dyn Signaler>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSignaler { tx }), rx)
}

fn decode_description(payload: &str) -> SessionDescription {
    match SignalMessage::decode(payload.as_bytes()).expect("signalled payload decodes") {
        SignalMessage::Description(desc) => desc,
        other => panic!("expected a description, got {other:?}"),
    }
}

async fn start_instigator(
    peer: &Arc<MockPeer>,
) -> (NegotiationEngine, mpsc::UnboundedReceiver<String>) {
    let (signaler, rx) = channel_signaler();
    let engine = NegotiationEngine::start(
        &MockConnector::new(peer.clone()),
        SessionOptions::instigator(signaler, Arc::new(SinkRegistry::new())),
    )
    .await
    .expect("instigator starts");
    (engine, rx)
}

async fn start_responder(
    peer: &Arc<MockPeer>,
) -> (SignalRouter, mpsc::UnboundedReceiver<String>) {
    let (signaler, rx) = channel_signaler();
    let engine = NegotiationEngine::start(
        &MockConnector::new(peer.clone()),
        SessionOptions::responder(signaler, Box::new(|_track: Arc<SinkRegistry>| {})),
    )
    .await
    .expect("responder starts");
    (SignalRouter::new(engine), rx)
}

#[test_timeout::tokio_timeout_test(10)]
async fn instigator_signals_exactly_one_offer() {
    let peer = MockPeer::new();
    let (engine, mut rx) = start_instigator(&peer).await;

    let payload = rx.recv().await.expect("offer signalled");
    let offer = decode_description(&payload);
    assert_eq!(offer.kind, SdpKind::Offer);
    assert_eq!(Some(offer), peer.local());
    assert_eq!(engine.state(), NegotiationState::AwaitingAnswer);
    assert_eq!(peer.sources().len(), 1);

    // Late triggers do not start a second cycle or re-signal.
    peer.fire_negotiation_needed();
    peer.fire_ice_gathering_complete();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(peer.offers_created(), 1);
    assert_eq!(engine.signals_sent(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn responder_answers_a_dispatched_offer_once() {
    let peer = MockPeer::new();
    let (router, mut rx) = start_responder(&peer).await;

    let offer = SignalMessage::from(SessionDescription::offer("v=0\r\ns=remote\r\n"))
        .encode()
        .expect("encode offer");
    assert_eq!(
        router.dispatch(offer.as_bytes()).await,
        DispatchOutcome::DescriptionApplied(SdpKind::Offer)
    );

    let payload = rx.recv().await.expect("answer signalled");
    assert!(payload.contains(r#""type":"answer""#));
    assert_eq!(decode_description(&payload).kind, SdpKind::Answer);
    let state = router
        .engine()
        .wait_for_state(|state| state == NegotiationState::Stable)
        .await;
    assert_eq!(state, NegotiationState::Stable);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(peer.answers_created(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn alice_and_bob_reach_stable_over_a_loopback_channel() {
    let alice_peer = MockPeer::new();
    let bob_peer = MockPeer::new();
    let (alice, mut to_bob) = start_instigator(&alice_peer).await;
    let (bob, mut to_alice) = start_responder(&bob_peer).await;
    let alice_router = SignalRouter::new(alice.clone());

    let offer = to_bob.recv().await.expect("offer");
    assert!(bob.dispatch(offer.as_bytes()).await.is_applied());
    let answer = to_alice.recv().await.expect("answer");
    assert_eq!(
        alice_router.dispatch(answer.as_bytes()).await,
        DispatchOutcome::DescriptionApplied(SdpKind::Answer)
    );

    assert_eq!(alice.state(), NegotiationState::Stable);
    assert_eq!(
        bob.engine()
            .wait_for_state(|state| state == NegotiationState::Stable)
            .await,
        NegotiationState::Stable
    );

    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
        sdp_mid: "0".into(),
        sdp_mline_index: 0,
    };
    let raw = SignalMessage::from(candidate.clone())
        .encode()
        .expect("encode candidate");
    assert_eq!(
        alice_router.dispatch(raw.as_bytes()).await,
        DispatchOutcome::CandidateApplied
    );
    assert_eq!(alice_peer.candidates(), vec![candidate]);
}

#[test_timeout::tokio_timeout_test(10)]
async fn malformed_payload_changes_nothing() {
    let peer = MockPeer::new();
    let (router, mut rx) = start_responder(&peer).await;

    assert_eq!(
        router.dispatch(b"{not valid json").await,
        DispatchOutcome::Unrecognized
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(router.engine().state(), NegotiationState::Idle);
    assert!(rx.try_recv().is_err());
    assert_eq!(peer.answers_created(), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn stale_candidate_leaves_state_alone() {
    let peer = MockPeer::new();
    let (router, _rx) = start_responder(&peer).await;
    let before = router.engine().state();

    let err = router
        .engine()
        .add_remote_ice_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        })
        .await
        .expect_err("no remote description yet");
    assert_eq!(err, IceError::NoRemoteDescription);
    assert_eq!(router.engine().state(), before);
}

#[test_timeout::tokio_timeout_test(10)]
async fn concurrent_triggers_never_overlap_generation() {
    let peer = MockPeer::with_behavior(MockBehavior {
        create_delay: Duration::from_millis(25),
        negotiate_on_track: false,
        ..Default::default()
    });
    let (engine, mut rx) = start_instigator(&peer).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.generate_offer().await }));
    }
    for _ in 0..4 {
        peer.fire_negotiation_needed();
    }
    let mut generated = 0;
    for task in tasks {
        let outcome = task.await.expect("generation task");
        if outcome == Ok(GenerationOutcome::Completed) {
            generated += 1;
        }
    }
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(peer.max_concurrent_generations(), 1);
    assert_eq!(peer.offers_created(), 1);
    // Trigger-spawned requests may win the turn instead.
    assert!(generated <= 1);
    assert!(rx.recv().await.is_some());
    assert!(rx.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(10)]
async fn close_from_many_tasks_destroys_once() {
    let peer = MockPeer::new();
    let (engine, _rx) = start_instigator(&peer).await;

    let closers: Vec<_> = (0..6)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.expect("close task");
    }
    engine.close().await;

    assert_eq!(peer.close_count(), 1);
    assert!(engine.is_closed());
    assert_eq!(engine.state(), NegotiationState::Closed);
}

#[test_timeout::tokio_timeout_test(10)]
async fn remote_track_reaches_the_responder_handler() {
    #[derive(Default)]
    struct Counter(Mutex<usize>);
    impl Sink for Counter {
        fn deliver(&self, _chunk: &AudioChunk) {
            *self.0.lock() += 1;
        }
    }

    let peer = MockPeer::new();
    let counter = Arc::new(Counter::default());
    let sink: Arc<dyn Sink> = counter.clone();
    let (signaler, _rx) = channel_signaler();
    let engine = NegotiationEngine::start(
        &MockConnector::new(peer.clone()),
        SessionOptions::responder(
            signaler,
            Box::new(move |track: Arc<SinkRegistry>| {
                track.add(&sink);
            }),
        ),
    )
    .await
    .expect("responder starts");

    let track = peer.fire_track();
    track.broadcast(&AudioChunk::mono(vec![0.0; 480], 48_000));
    assert_eq!(*counter.0.lock(), 1);

    engine.close().await;
    peer.fire_track().broadcast(&AudioChunk::mono(vec![0.0; 480], 48_000));
    assert_eq!(*counter.0.lock(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn failed_answer_returns_responder_to_idle() {
    let peer = MockPeer::with_behavior(MockBehavior {
        fail_answer: true,
        ..Default::default()
    });
    let (router, mut rx) = start_responder(&peer).await;
    let engine = router.engine().clone();

    let outcome = router
        .dispatch(br#"{"sdp":{"type":"offer","sdp":"v=0\r\n"}}"#)
        .await;
    assert_eq!(outcome, DispatchOutcome::DescriptionApplied(SdpKind::Offer));

    let err = engine.generate_answer().await.expect_err("answer fails");
    assert!(matches!(
        err,
        GenerationError::Create {
            kind: SdpKind::Answer,
            ..
        }
    ));
    // The answer task spawned by the offer fails the same way.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.state(), NegotiationState::Idle);
    assert_eq!(peer.answers_created(), 0);
    assert!(peer.local().is_none());
    assert!(rx.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(10)]
async fn missing_local_description_does_not_advance_state() {
    let peer = MockPeer::with_behavior(MockBehavior {
        negotiate_on_track: false,
        withhold_local_description: true,
        ..Default::default()
    });
    let (engine, mut rx) = start_instigator(&peer).await;

    let err = engine.generate_offer().await.expect_err("nothing to signal");
    assert!(matches!(
        err,
        GenerationError::Unsignalled {
            kind: SdpKind::Offer,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.state(), NegotiationState::Idle);
    assert_eq!(engine.signals_sent(), 0);
    assert!(rx.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(10)]
async fn missing_local_description_after_early_gathering_does_not_advance_state() {
    let peer = MockPeer::with_behavior(MockBehavior {
        auto_gather: false,
        negotiate_on_track: false,
        withhold_local_description: true,
        create_delay: Duration::from_millis(20),
        ..Default::default()
    });
    let (engine, mut rx) = start_instigator(&peer).await;

    let generation = tokio::spawn({
        let engine = engine.clone();
        async move { engine.generate_offer().await }
    });
    engine
        .wait_for_state(|state| state == NegotiationState::GeneratingOffer)
        .await;
    engine.on_ice_gathering_complete().await;
    let result = generation.await.expect("generation task");
    assert!(matches!(
        result,
        Err(GenerationError::Unsignalled {
            kind: SdpKind::Offer,
            ..
        })
    ));
    assert_eq!(engine.state(), NegotiationState::Idle);
    assert!(rx.try_recv().is_err());
}
