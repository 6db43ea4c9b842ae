//! Pipeline scheduling against a scripted server.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{ScriptedTransport, expect, reply};
use mailsubmit_smtp::command::{Command, CommandContext, CredentialSlot};
use mailsubmit_smtp::pipeline::{Pipeline, PipelineConfig};
use mailsubmit_smtp::{Address, Capabilities, RecipientPolicy, Reply, TransactionState};

const TIMEOUT: Duration = Duration::from_secs(5);

fn capabilities(ehlo: &str) -> Capabilities {
    let mut reply = Reply::new();
    for line in ehlo.split_inclusive('\n') {
        reply.parse_line(line.as_bytes());
    }
    Capabilities::from_ehlo(&reply)
}

fn addr(s: &str) -> Address {
    Address::new(s).unwrap()
}

#[tokio::test]
async fn test_batch_is_fifo_with_split_replies() {
    let (mut transport, handle) = ScriptedTransport::new([
        expect("MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nRCPT TO:<c@y>\r\n"),
        reply("250 sender ok\r\n25"),
        reply("0 first ok\r\n550 second"),
        reply(" refused\r\n"),
    ]);
    let mut caps = capabilities("250-mx\r\n250 PIPELINING\r\n");
    let mut credentials = CredentialSlot::default();
    let mut ctx = CommandContext {
        capabilities: &mut caps,
        credentials: &mut credentials,
    };
    let mut tx = TransactionState::new(RecipientPolicy::AllowPartial);

    let mut pipeline = Pipeline::new(PipelineConfig::new());
    pipeline.queue(Command::mail_from(addr("a@x"), None, false));
    pipeline.queue(Command::rcpt_to(addr("b@y")));
    pipeline.queue(Command::rcpt_to(addr("c@y")));
    pipeline
        .execute_queued(&mut transport, &mut ctx, &mut tx, TIMEOUT)
        .await
        .unwrap();

    assert!(tx.recipient_accepted());
    let rejected = tx.rejected_recipients();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].recipient, addr("c@y"));
    assert_eq!(rejected[0].message, "The server responded: \"second refused\"");
    assert_eq!(handle.batches().len(), 1);
    handle.assert_done();
}

#[tokio::test]
async fn test_without_pipelining_each_command_waits() {
    let (mut transport, handle) = ScriptedTransport::new([
        expect("MAIL FROM:<a@x>\r\n"),
        reply("250 ok\r\n"),
        expect("RCPT TO:<b@y>\r\n"),
        reply("250 ok\r\n"),
        expect("RCPT TO:<c@y>\r\n"),
        reply("250 ok\r\n"),
    ]);
    let mut caps = capabilities("250-mx\r\n250 SIZE 100\r\n");
    let mut credentials = CredentialSlot::default();
    let mut ctx = CommandContext {
        capabilities: &mut caps,
        credentials: &mut credentials,
    };
    let mut tx = TransactionState::default();

    let mut pipeline = Pipeline::new(PipelineConfig::new());
    pipeline.queue(Command::mail_from(addr("a@x"), None, false));
    pipeline.queue(Command::rcpt_to(addr("b@y")));
    pipeline.queue(Command::rcpt_to(addr("c@y")));
    pipeline
        .execute_queued(&mut transport, &mut ctx, &mut tx, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(handle.batches().len(), 3);
    handle.assert_done();
}

#[tokio::test]
async fn test_skipped_commands_cause_no_io() {
    let (mut transport, handle) = ScriptedTransport::new(Vec::<common::Step>::new());
    let mut caps = Capabilities::default();
    let mut credentials = CredentialSlot::default();
    let mut ctx = CommandContext {
        capabilities: &mut caps,
        credentials: &mut credentials,
    };
    let mut tx = TransactionState::default();
    tx.set_mail_from_failed(&addr("a@x"), &Reply::single(mailsubmit_smtp::ReplyCode::new(550), "no"));

    let mut pipeline = Pipeline::new(PipelineConfig::new());
    pipeline.queue(Command::rcpt_to(addr("b@y")));
    pipeline.queue(Command::data());
    pipeline
        .execute_queued(&mut transport, &mut ctx, &mut tx, TIMEOUT)
        .await
        .unwrap();

    assert!(handle.batches().is_empty());
    assert!(pipeline.is_empty());
}
