//! End-to-end session tests against a scripted server.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::{Arc, Mutex};

use common::{ScriptedTransport, Step, expect, reply};
use mailsubmit_smtp::{
    Address, Config, Credentials, ErrorKind, RecipientPolicy, ReplyCode, Session, SessionState,
    SubmissionRequest, TlsPolicy,
};

fn addr(s: &str) -> Address {
    Address::new(s).unwrap()
}

fn base_config() -> mailsubmit_smtp::ConfigBuilder {
    Config::builder("mx.example.com").local_hostname("client.example.org")
}

fn greeting_and_ehlo(ehlo_reply: &str) -> Vec<Step> {
    vec![
        reply("220 ok\r\n"),
        expect("EHLO client.example.org\r\n"),
        reply(ehlo_reply),
    ]
}

#[tokio::test]
async fn test_end_to_end_with_auth_plain() {
    let mut script = greeting_and_ehlo("250-mx.example.com\r\n250-PIPELINING\r\n250 AUTH PLAIN\r\n");
    script.extend([
        expect("AUTH PLAIN AHVzZXIAcGFzcw==\r\n"),
        reply("235 ok\r\n"),
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("250 ok\r\n250 ok\r\n354 go ahead\r\n"),
        expect("Subject: test\r\n\r\nHello\r\n.\r\n"),
        reply("250 queued as 4711\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let config = base_config().credentials("user", "pass").build();
    let mut session = Session::new(transport, config);

    session.open().await.unwrap();
    let request = SubmissionRequest::new(addr("a@x"), &b"Subject: test\n\nHello\n"[..]).to(addr("b@y"));
    let receipt = session.submit(request).await.unwrap();

    assert_eq!(receipt.reply.code(), Some(ReplyCode::OK));
    assert_eq!(receipt.reply.message_text(), "queued as 4711");
    assert!(receipt.rejected_recipients.is_empty());
    assert_eq!(receipt.bytes_sent, 21);
    assert_eq!(
        session.history(),
        [
            SessionState::Initial,
            SessionState::EhloPreTls,
            SessionState::Authenticated,
            SessionState::Sending,
            SessionState::Done,
        ]
    );
    handle.assert_done();
}

#[tokio::test]
async fn test_rejected_recipient_is_reset_and_session_reused() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 PIPELINING\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<nobody@y>\r\nDATA\r\n"),
        reply("250 ok\r\n550 5.1.1 no such user\r\n503 no valid recipients\r\n"),
        expect("RSET\r\n"),
        reply("250 flushed\r\n"),
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("250 ok\r\n250 ok\r\n354 go ahead\r\n"),
        expect("hi\r\n.\r\n"),
        reply("250 queued\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let first = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("nobody@y"));
    let err = session.submit(first).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecipientRejected);
    assert!(!err.is_fatal());
    assert!(err.is_permanent());
    assert!(err.to_string().contains("nobody@y"));
    assert_eq!(session.state(), SessionState::Authenticated);

    let second = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("b@y"));
    session.submit(second).await.unwrap();
    assert_eq!(session.state(), SessionState::Done);
    assert!(session.history().contains(&SessionState::Reset));
    handle.assert_done();
}

#[tokio::test]
async fn test_rejected_sender_skips_recipients_without_pipelining() {
    let mut script = greeting_and_ehlo("250 mx\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\n"),
        reply("553 sender not allowed\r\n"),
        expect("RSET\r\n"),
        reply("250 ok\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n")
        .to(addr("b@y"))
        .to(addr("c@y"));
    let err = session.submit(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SenderRejected);
    assert!(err.to_string().contains("did not accept the sender address"));
    handle.assert_done();
}

#[tokio::test]
async fn test_starttls_replaces_capabilities() {
    let mut script = greeting_and_ehlo("250-mx\r\n250-STARTTLS\r\n250-8BITMIME\r\n250 SIZE 1000\r\n");
    script.extend([
        expect("STARTTLS\r\n"),
        reply("220 go ahead\r\n"),
        Step::StartTls,
        expect("EHLO client.example.org\r\n"),
        reply("250-mx\r\n250 PIPELINING\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    assert!(session.is_encrypted());
    assert!(session.capabilities().have("PIPELINING"));
    assert!(!session.capabilities().have("8BITMIME"));
    assert!(!session.capabilities().have("STARTTLS"));
    assert_eq!(session.capabilities().max_size(), None);
    assert_eq!(
        session.history(),
        [
            SessionState::Initial,
            SessionState::EhloPreTls,
            SessionState::StartTls,
            SessionState::EhloPostTls,
            SessionState::Authenticated,
        ]
    );

    // 8BITMIME is gone after the second EHLO.
    let request = SubmissionRequest::from_bytes(addr("a@x"), "caf\u{e9}\n")
        .to(addr("b@y"))
        .eight_bit(true);
    let err = session.submit(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    handle.assert_done();
}

#[tokio::test]
async fn test_failed_handshake_after_starttls_closes_session() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 STARTTLS\r\n");
    script.extend([
        expect("STARTTLS\r\n"),
        reply("220 go\r\n"),
        Step::StartTlsFails,
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());

    let err = session.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TlsNegotiationFailed);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        session.history(),
        [
            SessionState::Initial,
            SessionState::EhloPreTls,
            SessionState::StartTls,
            SessionState::Closed,
        ]
    );
    assert!(!session.is_encrypted());
    assert!(handle.was_shut_down());
    handle.assert_done();

    let err = session.noop().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn test_injected_ehlo_name_refused_before_io() {
    let (transport, handle) = ScriptedTransport::new(Vec::<Step>::new());
    let config = Config::builder("mx.example.com")
        .local_hostname("client\r\nRSET")
        .build();
    let mut session = Session::new(transport, config);

    let err = session.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(session.state(), SessionState::Initial);
    assert!(handle.batches().is_empty());
    assert!(!handle.was_shut_down());
}

#[tokio::test]
async fn test_null_recipient_refused_before_mail_from() {
    let (transport, handle) = ScriptedTransport::new(greeting_and_ehlo("250 mx\r\n"));
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n")
        .to(addr("b@y"))
        .cc(Address::null());
    let err = session.submit(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(session.is_ready());
    handle.assert_done();
}

#[tokio::test]
async fn test_tls_policy_force_none_skips_starttls() {
    let script = greeting_and_ehlo("250-mx\r\n250 STARTTLS\r\n");
    let (transport, handle) = ScriptedTransport::new(script);
    let config = base_config().tls_policy(TlsPolicy::ForceNone).build();
    let mut session = Session::new(transport, config);
    session.open().await.unwrap();
    assert!(!session.is_encrypted());
    handle.assert_done();
}

#[tokio::test]
async fn test_one_command_outstanding_without_pipelining() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 8BITMIME\r\n");
    script.extend([
        expect("MAIL FROM:<a@x> BODY=8BITMIME\r\n"),
        reply("250 ok\r\n"),
        expect("RCPT TO:<b@y>\r\n"),
        reply("250 ok\r\n"),
        expect("RCPT TO:<c@y>\r\n"),
        reply("251 will forward\r\n"),
        expect("DATA\r\n"),
        reply("354 go ahead\r\n"),
        expect("caf\u{e9}\r\n.\r\n"),
        reply("250 queued\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "caf\u{e9}\n")
        .to(addr("b@y"))
        .cc(addr("c@y"))
        .eight_bit(true);
    session.submit(request).await.unwrap();

    let batches = handle.batches();
    assert!(batches.iter().skip(1).all(|b| b.ends_with(b"\r\n")));
    handle.assert_done();
}

#[tokio::test]
async fn test_size_is_declared_when_advertised() {
    let mut script = greeting_and_ehlo("250-mx\r\n250-PIPELINING\r\n250 SIZE 10000\r\n");
    script.extend([
        expect("MAIL FROM:<a@x> SIZE=3\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("250 ok\r\n250 ok\r\n354 go ahead\r\n"),
        expect("hi\r\n.\r\n"),
        reply("250 queued\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("b@y"));
    session.submit(request).await.unwrap();
    handle.assert_done();
}

#[tokio::test]
async fn test_body_is_dot_stuffed() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 PIPELINING\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("250 ok\r\n250 ok\r\n354 go ahead\r\n"),
        expect("line one\r\n..\r\n...hidden\r\nlast line without break\r\n.\r\n"),
        reply("250 queued\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let body = "line one\n.\n..hidden\nlast line without break";
    let request = SubmissionRequest::new(addr("a@x"), body.as_bytes()).to(addr("b@y"));
    session.submit(request).await.unwrap();
    handle.assert_done();
}

#[tokio::test]
async fn test_helo_fallback() {
    let script = vec![
        reply("220 old server\r\n"),
        expect("EHLO client.example.org\r\n"),
        reply("500 unrecognized command\r\n"),
        expect("HELO client.example.org\r\n"),
        reply("250 hello\r\n"),
        expect("MAIL FROM:<a@x>\r\n"),
        reply("250 ok\r\n"),
        expect("RCPT TO:<b@y>\r\n"),
        reply("250 ok\r\n"),
        expect("DATA\r\n"),
        reply("354 go ahead\r\n"),
        expect("hi\r\n.\r\n"),
        reply("250 queued\r\n"),
    ];
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();
    assert!(session.capabilities().is_empty());

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("b@y"));
    session.submit(request).await.unwrap();
    handle.assert_done();
}

#[tokio::test]
async fn test_allow_partial_reports_rejected_recipients() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 PIPELINING\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nRCPT TO:<gone@y>\r\nDATA\r\n"),
        reply("250 ok\r\n250 ok\r\n550 mailbox unavailable\r\n354 go ahead\r\n"),
        expect("hi\r\n.\r\n"),
        reply("250 queued\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let config = base_config()
        .recipient_policy(RecipientPolicy::AllowPartial)
        .build();
    let mut session = Session::new(transport, config);
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n")
        .to(addr("b@y"))
        .bcc(addr("gone@y"));
    let receipt = session.submit(request).await.unwrap();
    assert_eq!(receipt.rejected_recipients.len(), 1);
    assert_eq!(receipt.rejected_recipients[0].recipient, addr("gone@y"));
    assert_eq!(
        receipt.rejected_recipients[0].code,
        ReplyCode::MAILBOX_UNAVAILABLE
    );
    handle.assert_done();
}

#[tokio::test]
async fn test_421_closes_session() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 PIPELINING\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("421 4.3.2 shutting down\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("b@y"));
    let err = session.submit(request).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(err.is_transient());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(handle.was_shut_down());

    let again = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("b@y"));
    let err = session.submit(again).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    handle.assert_done();
}

#[tokio::test]
async fn test_message_rejected_after_data() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 PIPELINING\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("250 ok\r\n250 ok\r\n354 go ahead\r\n"),
        expect("spam\r\n.\r\n"),
        reply("554 5.7.1 message refused\r\n"),
        expect("RSET\r\n"),
        reply("250 ok\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "spam\n").to(addr("b@y"));
    let err = session.submit(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MessageRejected);
    assert!(err.to_string().contains("The message content was not accepted"));
    assert_eq!(session.state(), SessionState::Authenticated);
    handle.assert_done();
}

#[tokio::test]
async fn test_failed_rset_closes_session() {
    let mut script = greeting_and_ehlo("250 mx\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\n"),
        reply("451 try later\r\n"),
        expect("RSET\r\n"),
        reply("500 what\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("b@y"));
    let err = session.submit(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SenderRejected);
    assert!(err.is_transient());
    assert_eq!(session.state(), SessionState::Closed);
    handle.assert_done();
}

#[tokio::test]
async fn test_wrong_password() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 AUTH LOGIN\r\n");
    script.extend([
        expect("AUTH LOGIN\r\n"),
        reply("334 VXNlcm5hbWU6\r\n"),
        expect("dXNlcg==\r\n"),
        reply("334 UGFzc3dvcmQ6\r\n"),
        expect("d3Jvbmc=\r\n"),
        reply("535 5.7.8 authentication credentials invalid\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let config = base_config().credentials("user", "wrong").build();
    let mut session = Session::new(transport, config);

    let err = session.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    assert!(err.to_string().contains("Most likely the password is wrong"));
    assert_eq!(session.state(), SessionState::Closed);
    handle.assert_done();
}

#[tokio::test]
async fn test_credential_provider_asked_once() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 AUTH LOGIN PLAIN\r\n");
    script.extend([
        expect("AUTH PLAIN AGFsaWNlAHMzY3JldA==\r\n"),
        reply("235 2.7.0 accepted\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let asked = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&asked);
    let provider = move |hint: Option<&str>| {
        log.lock().unwrap().push(hint.map(str::to_string));
        Some(Credentials::new("alice", "s3cret"))
    };
    let mut session =
        Session::new(transport, base_config().build()).with_credential_provider(Box::new(provider));

    session.open().await.unwrap();
    assert_eq!(*asked.lock().unwrap(), [None]);
    handle.assert_done();
}

#[tokio::test]
async fn test_no_credentials_no_auth() {
    let script = greeting_and_ehlo("250-mx\r\n250 AUTH PLAIN\r\n");
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    handle.assert_done();
}

#[tokio::test]
async fn test_progress_is_reported() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 PIPELINING\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("250 ok\r\n250 ok\r\n354 go ahead\r\n"),
        expect("hello\r\n.\r\n"),
        reply("250 queued\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let request = SubmissionRequest::from_bytes(addr("a@x"), "hello\n")
        .to(addr("b@y"))
        .on_progress(move |n| sink.lock().unwrap().push(n));
    let receipt = session.submit(request).await.unwrap();

    assert_eq!(receipt.bytes_sent, 6);
    assert_eq!(*seen.lock().unwrap(), [6]);
    handle.assert_done();
}

#[tokio::test]
async fn test_fragmented_server_replies() {
    let script = vec![
        reply("22"),
        reply("0 ok\r"),
        reply("\n"),
        expect("EHLO client.example.org\r\n"),
        reply("250-mx\r\n250-PIPE"),
        reply("LINING\r\n250 8BITMIME\r\n"),
    ];
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();
    assert!(session.capabilities().have("pipelining"));
    assert!(session.capabilities().have("8BITMIME"));
    handle.assert_done();
}

#[tokio::test]
async fn test_connection_lost_mid_transaction() {
    let mut script = greeting_and_ehlo("250-mx\r\n250 PIPELINING\r\n");
    script.extend([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\n"),
        reply("250 ok\r\n"),
    ]);
    let (transport, handle) = ScriptedTransport::new(script);
    let mut session = Session::new(transport, base_config().build());
    session.open().await.unwrap();

    let request = SubmissionRequest::from_bytes(addr("a@x"), "hi\n").to(addr("b@y"));
    let err = session.submit(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionBroken);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(handle.was_shut_down());
}
