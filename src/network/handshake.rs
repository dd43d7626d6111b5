//! Connection handshake: version exchange plus SCRAM-SHA-256 authentication.
//!
//! The client opens with a 4-byte magic number and a JSON document carrying
//! the SCRAM client-first message. The server answers with a version
//! document, then the SCRAM challenge; the client proves knowledge of the
//! password without sending it, and finally verifies the server's signature
//! so a fake server cannot pass itself off as authenticated.
//!
//! All handshake messages are null-terminated JSON, per
//! [`super::protocol::read_handshake_message`]. Framing starts only after
//! the handshake completes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

use super::protocol::read_handshake_message;
use crate::error::{Error, Result};

/// Protocol version magic, sent little-endian as the first 4 bytes.
pub const VERSION_V1_0: u32 = 0x34c2_bdc3;

/// Sub-protocol version negotiated inside the handshake documents.
const PROTOCOL_VERSION: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    VersionSent,
    AwaitingChallenge,
    ProofSent,
    Done,
}

/// What the driver should do after feeding a server message into the state
/// machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this message, then read the next server message.
    Reply(Vec<u8>),
    /// Read the next server message without sending anything.
    Continue,
    /// The handshake finished and the server's signature checked out.
    Done,
}

/// SCRAM-SHA-256 handshake state machine.
///
/// Pure protocol logic with no I/O, so every transition is unit-testable
/// against fixed nonces. [`perform`] drives it over a real stream.
pub struct Handshake {
    state: State,
    user: String,
    password: String,
    nonce: String,
    client_first_bare: String,
    expected_server_signature: Option<[u8; 32]>,
}

impl Handshake {
    pub fn new(user: &str, password: &str) -> Self {
        Self::with_nonce(user, password, &BASE64.encode(Uuid::new_v4().as_bytes()))
    }

    /// Construct with a fixed client nonce. Test hook.
    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            state: State::Init,
            user: user.to_string(),
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first_bare: String::new(),
            expected_server_signature: None,
        }
    }

    /// The opening bytes: version magic plus the null-terminated client-first
    /// document.
    pub fn initial_message(&mut self) -> Vec<u8> {
        self.client_first_bare = format!("n={},r={}", escape_username(&self.user), self.nonce);

        let doc = json!({
            "protocol_version": PROTOCOL_VERSION,
            "authentication_method": "SCRAM-SHA-256",
            "authentication": format!("n,,{}", self.client_first_bare),
        });

        let mut message = VERSION_V1_0.to_le_bytes().to_vec();
        message.extend_from_slice(doc.to_string().as_bytes());
        message.push(0);
        self.state = State::VersionSent;
        message
    }

    /// Feed one server message into the state machine.
    pub fn next_message(&mut self, server: &[u8]) -> Result<Step> {
        let doc = check_success(server)?;
        match self.state {
            State::VersionSent => {
                let min = doc
                    .get("min_protocol_version")
                    .and_then(Value::as_u64)
                    .unwrap_or(PROTOCOL_VERSION);
                let max = doc
                    .get("max_protocol_version")
                    .and_then(Value::as_u64)
                    .unwrap_or(PROTOCOL_VERSION);
                if !(min..=max).contains(&PROTOCOL_VERSION) {
                    return Err(Error::Handshake(format!(
                        "unsupported protocol version range {min}..{max}"
                    )));
                }
                self.state = State::AwaitingChallenge;
                Ok(Step::Continue)
            }
            State::AwaitingChallenge => {
                let server_first = authentication_field(&doc)?;
                let reply = self.answer_challenge(&server_first)?;
                self.state = State::ProofSent;
                Ok(Step::Reply(reply))
            }
            State::ProofSent => {
                let server_final = authentication_field(&doc)?;
                self.verify_server_signature(&server_final)?;
                self.state = State::Done;
                Ok(Step::Done)
            }
            State::Init | State::Done => {
                Err(Error::Handshake("unexpected handshake message".into()))
            }
        }
    }

    fn answer_challenge(&mut self, server_first: &str) -> Result<Vec<u8>> {
        let fields = parse_scram_fields(server_first);

        let combined_nonce = fields
            .iter()
            .find(|(k, _)| *k == "r")
            .map(|(_, v)| v.to_string())
            .ok_or_else(|| Error::Handshake("challenge missing nonce".into()))?;
        if !combined_nonce.starts_with(&self.nonce) {
            return Err(Error::Handshake(
                "server nonce does not extend client nonce".into(),
            ));
        }

        let salt = fields
            .iter()
            .find(|(k, _)| *k == "s")
            .map(|(_, v)| BASE64.decode(v))
            .ok_or_else(|| Error::Handshake("challenge missing salt".into()))?
            .map_err(|e| Error::Handshake(format!("invalid salt encoding: {e}")))?;

        let iterations: u32 = fields
            .iter()
            .find(|(k, _)| *k == "i")
            .and_then(|(_, v)| v.parse().ok())
            .ok_or_else(|| Error::Handshake("challenge missing iteration count".into()))?;
        if iterations == 0 {
            return Err(Error::Handshake("zero iteration count".into()));
        }

        let client_final_bare = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_bare
        );

        let salted = pbkdf2_sha256(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let mut proof = client_key;
        for (byte, sig) in proof.iter_mut().zip(client_signature.iter()) {
            *byte ^= sig;
        }

        let server_key = hmac_sha256(&salted, b"Server Key");
        self.expected_server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));

        let doc = json!({
            "authentication": format!("{},p={}", client_final_bare, BASE64.encode(proof)),
        });
        let mut reply = doc.to_string().into_bytes();
        reply.push(0);
        Ok(reply)
    }

    fn verify_server_signature(&self, server_final: &str) -> Result<()> {
        let fields = parse_scram_fields(server_final);
        let signature = fields
            .iter()
            .find(|(k, _)| *k == "v")
            .map(|(_, v)| BASE64.decode(v))
            .ok_or_else(|| Error::Handshake("server signature missing".into()))?
            .map_err(|e| Error::Handshake(format!("invalid server signature: {e}")))?;

        let expected = self
            .expected_server_signature
            .as_ref()
            .ok_or_else(|| Error::Handshake("signature verified out of order".into()))?;
        if signature.as_slice() != expected.as_slice() {
            return Err(Error::Auth("server signature mismatch".into()));
        }
        Ok(())
    }
}

/// Run the handshake over a stream.
pub(crate) async fn perform<S>(stream: &mut S, user: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut handshake = Handshake::new(user, password);
    debug!(user, "starting handshake");

    let opening = handshake.initial_message();
    stream.write_all(&opening).await?;
    stream.flush().await?;

    loop {
        let server = read_handshake_message(stream).await?;
        match handshake.next_message(&server)? {
            Step::Reply(message) => {
                // next_message already null-terminates its replies
                stream.write_all(&message).await?;
                stream.flush().await?;
            }
            Step::Continue => {}
            Step::Done => {
                debug!(user, "handshake complete");
                return Ok(());
            }
        }
    }
}

/// SCRAM requires '=' and ',' in usernames to be escaped.
fn escape_username(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

/// Split `k1=v1,k2=v2` into pairs. Values may themselves contain '='.
fn parse_scram_fields(message: &str) -> Vec<(&str, &str)> {
    message
        .split(',')
        .filter_map(|part| part.split_once('='))
        .collect()
}

/// Parse a handshake document and map server-reported failure to an error.
/// Error codes 10 through 20 are authentication failures; everything else is
/// a protocol-level handshake failure.
fn check_success(message: &[u8]) -> Result<serde_json::Map<String, Value>> {
    let value: Value = serde_json::from_slice(message)
        .map_err(|e| Error::Handshake(format!("invalid handshake document: {e}")))?;
    let Value::Object(doc) = value else {
        return Err(Error::Handshake("handshake document is not an object".into()));
    };

    if doc.get("success").and_then(Value::as_bool) == Some(false) {
        let message = doc
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown handshake error")
            .to_string();
        let code = doc.get("error_code").and_then(Value::as_u64);
        return match code {
            Some(10..=20) => Err(Error::Auth(message)),
            _ => Err(Error::Handshake(message)),
        };
    }
    Ok(doc)
}

fn authentication_field(doc: &serde_json::Map<String, Value>) -> Result<String> {
    doc.get("authentication")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Handshake("missing authentication payload".into()))
}

/// HMAC-SHA-256 with the standard 64-byte block.
fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;

    let mut block_key = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        block_key[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block_key[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = block_key.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(data);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = block_key.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

/// PBKDF2-HMAC-SHA-256 for a single 32-byte output block, which is all SCRAM
/// needs.
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block_input = salt.to_vec();
    block_input.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password, &block_input);
    let mut output = u;
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (out, byte) in output.iter_mut().zip(u.iter()) {
            *out ^= byte;
        }
    }
    output
}
