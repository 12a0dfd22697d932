//! Outbound Call Integration Tests

mod common;

use common::{peer_request, peer_sdp, phone, ScriptedFactory};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use yakphone::infrastructure::media::MediaSession;
use yakphone::infrastructure::protocols::sip::{ResponseBuilder, SipMethod, SipRequest, SipResponse};
use yakphone::{
    DialEvents, DialOptions, DialogClientSession, DialogState, PhoneError, ReferState, SipUri,
};

const PEER_RTP_PORT: u16 = 40100;

/// Peer that rings, then answers every INVITE and accepts everything else
fn answering_peer(request: &SipRequest) -> Vec<SipResponse> {
    match request.method() {
        Some(SipMethod::Invite) => {
            let ringing = ResponseBuilder::new(180).to_tag("bobtag").build_for_request(request);
            let answer = ResponseBuilder::ok()
                .to_tag("bobtag")
                .header("Contact", "<sip:bob@127.0.0.1:5099>")
                .body("application/sdp", peer_sdp(PEER_RTP_PORT))
                .build_for_request(request);
            vec![ringing, answer]
        }
        _ => vec![ResponseBuilder::ok().build_for_request(request)],
    }
}

fn bob() -> SipUri {
    SipUri::parse("sip:bob@127.0.0.1:5099").unwrap()
}

/// Records what the call reports
#[derive(Default)]
struct Recorder {
    refer: bool,
    responses: std::sync::Mutex<Vec<u16>>,
    refers: Option<mpsc::UnboundedSender<ReferState>>,
}

impl DialEvents for Recorder {
    fn on_response(&self, response: &SipResponse) {
        self.responses.lock().unwrap().push(response.status_code());
    }

    fn handles_refer(&self) -> bool {
        self.refer
    }

    fn on_refer(&self, state: ReferState) {
        if let Some(refers) = &self.refers {
            let _ = refers.send(state);
        }
    }
}

#[tokio::test]
async fn test_dial_answered() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let events = Arc::new(Recorder::default());

    let session = phone
        .dial(
            &CancellationToken::new(),
            bob(),
            DialOptions {
                events: Some(events.clone()),
                ..Default::default()
            },
        )
        .await
        .expect("Call should be answered");

    assert_eq!(session.state(), DialogState::Confirmed);
    assert_eq!(session.id().remote_tag, "bobtag");
    assert_eq!(*events.responses.lock().unwrap(), vec![180]);

    let media = session.media().unwrap();
    assert_eq!(
        media.remote_addr(),
        Some(format!("127.0.0.1:{}", PEER_RTP_PORT).parse().unwrap())
    );

    let endpoint = factory.endpoint(0).await;
    let invite = &endpoint.sent_with(SipMethod::Invite)[0];
    assert_eq!(invite.content_type().as_deref(), Some("application/sdp"));
    assert_eq!(invite.header("user-agent").as_deref(), Some("alice"));

    let acks = endpoint.written();
    assert_eq!(acks.len(), 1);
    assert!(acks[0].is_method(SipMethod::Ack));
    assert_eq!(acks[0].cseq(), invite.cseq());
    assert_eq!(acks[0].to_tag().as_deref(), Some("bobtag"));
    assert_eq!(acks[0].uri().to_string(), "sip:bob@127.0.0.1:5099");
}

#[tokio::test]
async fn test_dial_rejected() {
    let responder = |request: &SipRequest| vec![ResponseBuilder::new(486).build_for_request(request)];
    let factory = ScriptedFactory::new(Arc::new(responder));
    let phone = phone(factory.clone());

    let err = phone
        .dial(&CancellationToken::new(), bob(), DialOptions::default())
        .await
        .unwrap_err();

    match &err {
        PhoneError::DialResponse(e) => {
            assert_eq!(e.status_code(), 486);
            assert!(e.request.is_method(SipMethod::Invite));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.to_string(), "Call not answered: SIP/2.0 486 Busy Here");

    let endpoint = factory.endpoint(0).await;
    assert_eq!(endpoint.close_count(), 1);
    assert!(endpoint.written().is_empty());
}

#[tokio::test]
async fn test_dial_digest_retry() {
    let responder = |request: &SipRequest| {
        if request.is_method(SipMethod::Invite) && request.header("proxy-authorization").is_none() {
            return vec![ResponseBuilder::new(407)
                .header("Proxy-Authenticate", r#"Digest realm="pbx", nonce="n0nce", qop="auth""#)
                .build_for_request(request)];
        }
        answering_peer(request)
    };
    let factory = ScriptedFactory::new(Arc::new(responder));
    let phone = phone(factory.clone());

    let session = phone
        .dial(
            &CancellationToken::new(),
            bob(),
            DialOptions {
                username: "1001".into(),
                password: "secret".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let endpoint = factory.endpoint(0).await;
    let invites = endpoint.sent_with(SipMethod::Invite);
    assert_eq!(invites.len(), 2);
    let authorization = invites[1].header("proxy-authorization").unwrap();
    assert!(authorization.contains("qop=auth"));
    assert_eq!(invites[0].call_id(), invites[1].call_id());
    assert_eq!(invites[0].from_tag(), invites[1].from_tag());
    assert_ne!(invites[0].via_branch(), invites[1].via_branch());

    // ACK follows the INVITE that was answered
    assert_eq!(endpoint.written()[0].cseq(), invites[1].cseq());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_challenge_without_password_is_returned() {
    let responder = |request: &SipRequest| {
        vec![ResponseBuilder::new(401)
            .header("WWW-Authenticate", r#"Digest realm="pbx", nonce="n0nce""#)
            .build_for_request(request)]
    };
    let factory = ScriptedFactory::new(Arc::new(responder));
    let phone = phone(factory.clone());

    let err = phone
        .dial(&CancellationToken::new(), bob(), DialOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(401));
    assert_eq!(factory.endpoint(0).await.sent().len(), 1);
}

#[tokio::test]
async fn test_close_twice_sends_one_bye() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let session = phone
        .dial(&CancellationToken::new(), bob(), DialOptions::default())
        .await
        .unwrap();

    let other = session.clone();
    let (first, second) = tokio::join!(session.close(), other.close());
    first.unwrap();
    second.unwrap();

    let endpoint = factory.endpoint(0).await;
    let byes = endpoint.sent_with(SipMethod::Bye);
    assert_eq!(byes.len(), 1);
    assert_eq!(byes[0].uri().to_string(), "sip:bob@127.0.0.1:5099");
    assert_eq!(endpoint.close_count(), 1);
    assert_eq!(session.state(), DialogState::Terminated);
    assert!(session.lifetime().is_cancelled());
    assert!(session.media().is_none());
}

#[tokio::test]
async fn test_peer_hangup() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let session = phone
        .dial(&CancellationToken::new(), bob(), DialOptions::default())
        .await
        .unwrap();
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;

    let mut bye = endpoint.inject(peer_request(SipMethod::Bye, &id.call_id, &id.remote_tag, &id.local_tag, 2));
    let response = bye.next_response().await.unwrap();
    assert_eq!(response.status_code(), 200);

    session.lifetime().cancelled().await;
    assert_eq!(session.state(), DialogState::Terminated);

    // A repeated BYE no longer matches a live dialog
    let mut again = endpoint.inject(peer_request(SipMethod::Bye, &id.call_id, &id.remote_tag, &id.local_tag, 3));
    assert_eq!(again.next_response().await.unwrap().status_code(), 481);

    session.close().await.unwrap();
    assert!(endpoint.sent_with(SipMethod::Bye).is_empty());
    assert_eq!(endpoint.close_count(), 1);
}

#[tokio::test]
async fn test_options_on_dial_endpoint() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let session = phone
        .dial(&CancellationToken::new(), bob(), DialOptions::default())
        .await
        .unwrap();
    let endpoint = factory.endpoint(0).await;

    let mut options = endpoint.inject(peer_request(SipMethod::Options, "ping-1", "x", "y", 1));
    assert_eq!(options.next_response().await.unwrap().status_code(), 200);

    let mut info = endpoint.inject(peer_request(SipMethod::Info, "ping-2", "x", "y", 1));
    assert_eq!(info.next_response().await.unwrap().status_code(), 405);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_reinvite_without_handler_is_refused() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let session = phone
        .dial(&CancellationToken::new(), bob(), DialOptions::default())
        .await
        .unwrap();
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;

    let mut reinvite = peer_request(SipMethod::Invite, &id.call_id, &id.remote_tag, &id.local_tag, 5);
    reinvite.set_body("application/sdp", peer_sdp(PEER_RTP_PORT + 2));
    let mut tx = endpoint.inject(reinvite);
    assert_eq!(tx.next_response().await.unwrap().status_code(), 405);

    // Unknown dialog
    let mut stray = peer_request(SipMethod::Invite, "other-call", "x", "y", 1);
    stray.set_body("application/sdp", peer_sdp(PEER_RTP_PORT + 2));
    let mut tx = endpoint.inject(stray);
    assert_eq!(tx.next_response().await.unwrap().status_code(), 404);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_refer_without_handler_is_refused() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let session = phone
        .dial(&CancellationToken::new(), bob(), DialOptions::default())
        .await
        .unwrap();
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;

    let mut refer = peer_request(SipMethod::Refer, &id.call_id, &id.remote_tag, &id.local_tag, 2);
    refer.set_header("Refer-To", "<sip:carol@127.0.0.1:5098>");
    let mut tx = endpoint.inject(refer);
    assert_eq!(tx.next_response().await.unwrap().status_code(), 405);
    assert!(endpoint.sent_with(SipMethod::Notify).is_empty());

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_refer_transfers_call() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let (refers, mut states) = mpsc::unbounded_channel();
    let events = Arc::new(Recorder {
        refer: true,
        refers: Some(refers),
        ..Default::default()
    });

    let session = phone
        .dial(
            &CancellationToken::new(),
            bob(),
            DialOptions {
                events: Some(events),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;

    let mut refer = peer_request(SipMethod::Refer, &id.call_id, &id.remote_tag, &id.local_tag, 2);
    refer.set_header("Refer-To", "<sip:carol@127.0.0.1:5098>");
    let mut tx = endpoint.inject(refer);
    assert_eq!(tx.next_response().await.unwrap().status_code(), 202);

    assert!(matches!(states.recv().await, Some(ReferState::Initiated)));
    let transferred = match states.recv().await {
        Some(ReferState::Confirmed(session)) => session,
        other => panic!("unexpected refer state {:?}", other),
    };
    assert_ne!(transferred.id(), session.id());
    assert_eq!(transferred.state(), DialogState::Confirmed);

    // The transfer dials from its own endpoint
    let target = factory.endpoint(1).await;
    let invite = &target.sent_with(SipMethod::Invite)[0];
    assert_eq!(invite.uri().to_string(), "sip:carol@127.0.0.1:5098");

    assert!(common::eventually(|| endpoint.sent_with(SipMethod::Notify).len() == 2).await);
    let notifies = endpoint.sent_with(SipMethod::Notify);
    assert_eq!(notifies[0].body(), b"SIP/2.0 100 Trying");
    assert_eq!(notifies[0].header("subscription-state").as_deref(), Some("active"));
    assert_eq!(notifies[1].body(), b"SIP/2.0 200 OK");
    assert_eq!(
        notifies[1].header("subscription-state").as_deref(),
        Some("terminated;reason=noresource")
    );
    for notify in &notifies {
        assert_eq!(notify.header("event").as_deref(), Some("refer"));
        assert_eq!(notify.content_type().as_deref(), Some("message/sipfrag;version=2.0"));
        assert_eq!(notify.call_id().as_deref(), Some(id.call_id.as_str()));
    }

    transferred.close().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_refer_to_failing_target_ends_transfer() {
    let responder = |request: &SipRequest| {
        if request.is_method(SipMethod::Invite) && request.uri().to_string().contains("carol") {
            return vec![ResponseBuilder::new(480).build_for_request(request)];
        }
        answering_peer(request)
    };
    let factory = ScriptedFactory::new(Arc::new(responder));
    let phone = phone(factory.clone());
    let (refers, mut states) = mpsc::unbounded_channel();
    let events = Arc::new(Recorder {
        refer: true,
        refers: Some(refers),
        ..Default::default()
    });

    let session = phone
        .dial(
            &CancellationToken::new(),
            bob(),
            DialOptions {
                events: Some(events),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;

    let mut refer = peer_request(SipMethod::Refer, &id.call_id, &id.remote_tag, &id.local_tag, 2);
    refer.set_header("Refer-To", "<sip:carol@127.0.0.1:5098>");
    let _tx = endpoint.inject(refer);

    assert!(matches!(states.recv().await, Some(ReferState::Initiated)));
    assert!(matches!(states.recv().await, Some(ReferState::Ended)));

    // Only the trying NOTIFY went out
    let notifies = endpoint.sent_with(SipMethod::Notify);
    assert_eq!(notifies.len(), 1);
    assert_eq!(factory.endpoint(1).await.close_count(), 1);

    session.close().await.unwrap();
}

/// Peer that only rings, leaving the INVITE open
fn ringing_peer(request: &SipRequest) -> Vec<SipResponse> {
    match request.method() {
        Some(SipMethod::Invite) => vec![ResponseBuilder::new(180).to_tag("bobtag").build_for_request(request)],
        _ => vec![ResponseBuilder::ok().build_for_request(request)],
    }
}

#[tokio::test]
async fn test_cancel_while_ringing_sends_cancel() {
    let factory = ScriptedFactory::new(Arc::new(ringing_peer));
    let phone = Arc::new(phone(factory.clone()));
    let events = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();

    let dial = {
        let phone = phone.clone();
        let cancel = cancel.clone();
        let events = events.clone();
        tokio::spawn(async move {
            phone
                .dial(
                    &cancel,
                    bob(),
                    DialOptions {
                        events: Some(events),
                        ..Default::default()
                    },
                )
                .await
        })
    };

    assert!(common::eventually(|| *events.responses.lock().unwrap() == vec![180]).await);
    cancel.cancel();
    let err = dial.await.unwrap().unwrap_err();
    assert!(matches!(err, PhoneError::Cancelled), "unexpected error {:?}", err);

    let endpoint = factory.endpoint(0).await;
    assert!(common::eventually(|| endpoint.sent_with(SipMethod::Cancel).len() == 1).await);
    let invite = &endpoint.sent_with(SipMethod::Invite)[0];
    let cancel_request = &endpoint.sent_with(SipMethod::Cancel)[0];
    assert_eq!(cancel_request.via_branch(), invite.via_branch());
    assert_eq!(cancel_request.call_id(), invite.call_id());
    assert_eq!(cancel_request.cseq(), invite.cseq());
    assert_eq!(cancel_request.cseq_method(), Some(SipMethod::Cancel));
    assert_eq!(cancel_request.uri().to_string(), invite.uri().to_string());

    // 487 ends the INVITE quietly and the endpoint is released
    assert!(common::eventually(|| endpoint.close_count() == 1).await);
    assert!(endpoint.written().is_empty());
    assert!(endpoint.sent_with(SipMethod::Bye).is_empty());
}

#[tokio::test]
async fn test_answer_after_cancel_is_hung_up() {
    let factory = ScriptedFactory::new(Arc::new(ringing_peer));
    factory.on_cancel(Arc::new(|request: &SipRequest| {
        ResponseBuilder::ok()
            .to_tag("bobtag")
            .header("Contact", "<sip:bob@127.0.0.1:5099>")
            .body("application/sdp", peer_sdp(PEER_RTP_PORT))
            .build_for_request(request)
    }));
    let phone = Arc::new(phone(factory.clone()));
    let events = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();

    let dial = {
        let phone = phone.clone();
        let cancel = cancel.clone();
        let events = events.clone();
        tokio::spawn(async move {
            phone
                .dial(
                    &cancel,
                    bob(),
                    DialOptions {
                        events: Some(events),
                        ..Default::default()
                    },
                )
                .await
        })
    };

    assert!(common::eventually(|| *events.responses.lock().unwrap() == vec![180]).await);
    cancel.cancel();
    assert!(matches!(dial.await.unwrap(), Err(PhoneError::Cancelled)));

    let endpoint = factory.endpoint(0).await;
    assert!(common::eventually(|| endpoint.sent_with(SipMethod::Bye).len() == 1).await);
    let invite = &endpoint.sent_with(SipMethod::Invite)[0];
    let acks = endpoint.written();
    assert_eq!(acks.len(), 1);
    assert!(acks[0].is_method(SipMethod::Ack));
    assert_eq!(acks[0].cseq(), invite.cseq());
    assert_eq!(acks[0].to_tag().as_deref(), Some("bobtag"));

    let bye = &endpoint.sent_with(SipMethod::Bye)[0];
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(bye.uri().to_string(), "sip:bob@127.0.0.1:5099");
    assert!(common::eventually(|| endpoint.close_count() == 1).await);
}

/// Dial bob with a REFER handler and return the session plus the reported states
async fn call_with_refer_handler(
    factory: &Arc<ScriptedFactory>,
) -> (
    DialogClientSession,
    mpsc::UnboundedReceiver<ReferState>,
) {
    let phone = phone(factory.clone());
    let (refers, states) = mpsc::unbounded_channel();
    let events = Arc::new(Recorder {
        refer: true,
        refers: Some(refers),
        ..Default::default()
    });
    let session = phone
        .dial(
            &CancellationToken::new(),
            bob(),
            DialOptions {
                events: Some(events),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    (session, states)
}

#[tokio::test]
async fn test_refer_without_refer_to_is_bad_request() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let (session, mut states) = call_with_refer_handler(&factory).await;
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;

    let refer = peer_request(SipMethod::Refer, &id.call_id, &id.remote_tag, &id.local_tag, 2);
    let mut tx = endpoint.inject(refer);
    let response = tx.next_response().await.unwrap();
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.reason(), "Missing Refer-To");

    assert!(matches!(states.recv().await, Some(ReferState::Ended)));
    assert!(endpoint.sent_with(SipMethod::Notify).is_empty());
    assert_eq!(session.state(), DialogState::Confirmed);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_refer_with_garbage_target_is_bad_request() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let (session, mut states) = call_with_refer_handler(&factory).await;
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;

    let mut refer = peer_request(SipMethod::Refer, &id.call_id, &id.remote_tag, &id.local_tag, 2);
    refer.set_header("Refer-To", "<garbage>");
    let mut tx = endpoint.inject(refer);
    let response = tx.next_response().await.unwrap();
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.reason(), "Bad Refer-To");

    assert!(matches!(states.recv().await, Some(ReferState::Ended)));
    assert!(endpoint.sent_with(SipMethod::Notify).is_empty());
    // No transfer endpoint was bound
    assert_eq!(factory.endpoints().len(), 1);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_refer_outside_call_is_rejected() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let (session, mut states) = call_with_refer_handler(&factory).await;
    let endpoint = factory.endpoint(0).await;

    let mut refer = peer_request(SipMethod::Refer, "other-call", "x", "y", 2);
    refer.set_header("Refer-To", "<sip:carol@127.0.0.1:5098>");
    let mut tx = endpoint.inject(refer);
    assert_eq!(tx.next_response().await.unwrap().status_code(), 481);
    assert!(states.try_recv().is_err());

    session.close().await.unwrap();
}

/// Accepts media updates and keeps the last one
#[derive(Default)]
struct MediaWatcher {
    updates: std::sync::Mutex<Vec<MediaSession>>,
}

impl DialEvents for MediaWatcher {
    fn handles_media_update(&self) -> bool {
        true
    }

    fn on_media_update(&self, session: MediaSession) {
        self.updates.lock().unwrap().push(session);
    }
}

#[tokio::test]
async fn test_reinvite_updates_media() {
    let factory = ScriptedFactory::new(Arc::new(answering_peer));
    let phone = phone(factory.clone());
    let events = Arc::new(MediaWatcher::default());
    let session = phone
        .dial(
            &CancellationToken::new(),
            bob(),
            DialOptions {
                events: Some(events.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id = session.id().clone();
    let endpoint = factory.endpoint(0).await;
    let moved: std::net::SocketAddr = format!("127.0.0.1:{}", PEER_RTP_PORT + 2).parse().unwrap();

    let mut reinvite = peer_request(SipMethod::Invite, &id.call_id, &id.remote_tag, &id.local_tag, 5);
    reinvite.set_body("application/sdp", peer_sdp(PEER_RTP_PORT + 2));
    let mut tx = endpoint.inject(reinvite);
    let response = tx.next_response().await.unwrap();
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.content_type().as_deref(), Some("application/sdp"));
    assert!(!response.body().is_empty());

    let updates = events.updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].remote_addr(), Some(moved));
    assert_eq!(session.media().unwrap().remote_addr(), Some(moved));

    session.close().await.unwrap();
}
