//! Scripted in-memory transport.
//!
//! A script is the exact conversation: every client batch is compared
//! byte-for-byte with the next `Expect`, and server bytes are released only
//! when the client gets to them.

#![allow(dead_code, clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use mailsubmit_smtp::{Error, Result, Transport};

/// One step of a conversation.
#[derive(Debug, Clone)]
pub enum Step {
    /// Server bytes, possibly several lines or a partial line.
    Reply(Vec<u8>),
    /// The next client write, exactly.
    Expect(Vec<u8>),
    /// The client upgrades to TLS.
    StartTls,
    /// The client tries to upgrade and the handshake fails.
    StartTlsFails,
}

/// Server bytes.
pub fn reply(bytes: &str) -> Step {
    Step::Reply(bytes.as_bytes().to_vec())
}

/// Expected client batch.
pub fn expect(bytes: &str) -> Step {
    Step::Expect(bytes.as_bytes().to_vec())
}

#[derive(Debug, Default)]
struct State {
    script: VecDeque<Step>,
    batches: Vec<Vec<u8>>,
    shutdown: bool,
}

/// Inspects a [`ScriptedTransport`] after the session has taken it.
#[derive(Debug, Clone)]
pub struct Handle(Arc<Mutex<State>>);

impl Handle {
    /// Every batch written, in order.
    pub fn batches(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().batches.clone()
    }

    /// True once the transport was shut down.
    pub fn was_shut_down(&self) -> bool {
        self.0.lock().unwrap().shutdown
    }

    /// Panics unless the whole script was played.
    pub fn assert_done(&self) {
        let state = self.0.lock().unwrap();
        assert!(
            state.script.is_empty(),
            "script not finished, next step: {:?}",
            state.script.front().map(describe)
        );
    }
}

/// Transport that plays a script.
#[derive(Debug)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
    inbound: VecDeque<u8>,
    encrypted: bool,
}

impl ScriptedTransport {
    /// Creates a transport and a handle onto it.
    pub fn new(script: impl IntoIterator<Item = Step>) -> (Self, Handle) {
        let state = Arc::new(Mutex::new(State {
            script: script.into_iter().collect(),
            ..State::default()
        }));
        let transport = Self {
            state: Arc::clone(&state),
            inbound: VecDeque::new(),
            encrypted: false,
        };
        (transport, Handle(state))
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.inbound.iter().position(|&b| b == b'\n')?;
        Some(self.inbound.drain(..=end).collect())
    }
}

impl Transport for ScriptedTransport {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.script.pop_front() {
            Some(Step::Expect(expected)) => {
                assert_eq!(
                    String::from_utf8_lossy(data),
                    String::from_utf8_lossy(&expected),
                    "unexpected client batch"
                );
                state.batches.push(data.to_vec());
                Ok(())
            }
            other => panic!(
                "client wrote {:?} but the script has {:?}",
                String::from_utf8_lossy(data),
                other.as_ref().map(describe)
            ),
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            let mut state = self.state.lock().unwrap();
            match state.script.front() {
                Some(Step::Reply(_)) => {
                    if let Some(Step::Reply(bytes)) = state.script.pop_front() {
                        self.inbound.extend(bytes);
                    }
                }
                Some(step) => panic!("client is reading but the script has {}", describe(step)),
                None => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "script exhausted",
                    )));
                }
            }
        }
    }

    async fn start_tls(&mut self, _server_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.script.pop_front() {
            Some(Step::StartTls) => {
                assert!(self.inbound.is_empty(), "plaintext left over at STARTTLS");
                self.encrypted = true;
                Ok(())
            }
            Some(Step::StartTlsFails) => Err(Error::TlsNegotiation(
                "handshake failure: unknown certificate authority".to_string(),
            )),
            other => panic!(
                "client started TLS but the script has {:?}",
                other.as_ref().map(describe)
            ),
        }
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.lock().unwrap().shutdown = true;
        Ok(())
    }
}

fn describe(step: &Step) -> String {
    match step {
        Step::Reply(bytes) => format!("Reply({:?})", String::from_utf8_lossy(bytes)),
        Step::Expect(bytes) => format!("Expect({:?})", String::from_utf8_lossy(bytes)),
        Step::StartTls => "StartTls".to_string(),
        Step::StartTlsFails => "StartTlsFails".to_string(),
    }
}
