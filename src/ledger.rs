// src/ledger.rs
//
// Ledger "Polkadot generic" application session.
//
// Talks APDUs to the device through an `ApduTransport`. The bundled transport
// speaks the length-framed TCP protocol of the Speculos emulator and of
// HID-to-TCP proxies; a native HID transport can be plugged in through the
// same trait.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};

use crate::{
    derivation::DerivationPath,
    error::SigningError,
    extrinsic::Signature,
    metadata::MetadataProofSource,
    signer::{DerivedAddress, ExternalSigner},
};

pub const CLA: u8 = 0xf9;
pub const INS_GET_VERSION: u8 = 0x00;
pub const INS_GET_ADDR: u8 = 0x01;
pub const INS_SIGN: u8 = 0x02;

const P1_ONLY_RETRIEVE: u8 = 0x00;
const P1_SHOW_ADDRESS: u8 = 0x01;
const P1_INIT: u8 = 0x00;
const P1_ADD: u8 = 0x01;
const P1_LAST: u8 = 0x02;
const SCHEME_ED25519: u8 = 0x00;

pub const CHUNK_SIZE: usize = 250;

pub const SW_OK: u16 = 0x9000;
pub const SW_USER_REJECTED: u16 = 0x6986;
pub const SW_DATA_INVALID: u16 = 0x6984;
pub const SW_BAD_KEY_HANDLE: u16 = 0x6a80;
pub const SW_APP_NOT_OPEN: u16 = 0x6e01;
pub const SW_CLA_NOT_SUPPORTED: u16 = 0x6e00;
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6d00;
pub const SW_DEVICE_LOCKED: u16 = 0x5515;

const PUBLIC_KEY_LEN: usize = 32;
/// Upper bound on the data length a framed answer may announce.
pub const MAX_ANSWER_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ApduError {
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no answer from device within {0:?}")]
    Timeout(Duration),
    #[error("apdu data of {0} bytes exceeds 255")]
    TooLong(usize),
    #[error("answer of {0} bytes is too short")]
    ShortAnswer(usize),
    #[error("answer announces {0} bytes, more than any apdu answer")]
    AnswerTooLong(usize),
    #[error("transport is out of sync after an earlier failure, reconnect to the device")]
    Desynchronized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduAnswer {
    pub data: Vec<u8>,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn serialize(&self) -> Result<Vec<u8>, ApduError> {
        let lc = u8::try_from(self.data.len()).map_err(|_| ApduError::TooLong(self.data.len()))?;
        let mut raw = vec![CLA, self.ins, self.p1, self.p2, lc];
        raw.extend_from_slice(&self.data);
        Ok(raw)
    }
}

#[async_trait]
pub trait ApduTransport: Send {
    async fn exchange(&mut self, apdu: &[u8]) -> Result<ApduAnswer, ApduError>;
}

/// APDU exchange over TCP: `u32 BE length ++ apdu` out,
/// `u32 BE length ++ data ++ u16 status` back.
///
/// A timed out or broken exchange leaves an unknown number of answer bytes
/// in the socket. The transport is then desynchronized and refuses every
/// further exchange; the caller has to connect again.
pub struct TcpApduTransport {
    stream: TcpStream,
    answer_timeout: Duration,
    desynchronized: bool,
}

impl TcpApduTransport {
    /// Connects to an APDU proxy or to the Speculos emulator.
    ///
    /// # Arguments
    /// * `addr` - `host:port` of the APDU TCP endpoint
    /// * `answer_timeout` - How long to wait for each answer. Waiting for the
    ///   user to confirm on the device counts against it, so keep it generous.
    ///
    /// # Returns
    /// * `Ok(TcpApduTransport)` - A connected transport
    /// * `Err(ApduError::Io)` - If the endpoint cannot be reached
    pub async fn connect(addr: &str, answer_timeout: Duration) -> Result<Self, ApduError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        log::info!("🔌 Connected to Ledger transport at {}", addr);
        Ok(Self {
            stream,
            answer_timeout,
            desynchronized: false,
        })
    }

    async fn round_trip(&mut self, apdu: &[u8]) -> Result<ApduAnswer, ApduError> {
        self.stream.write_u32(apdu.len() as u32).await?;
        self.stream.write_all(apdu).await?;
        self.stream.flush().await?;

        // waiting for the user to confirm on the device counts against this limit
        tokio::time::timeout(self.answer_timeout, self.read_answer())
            .await
            .map_err(|_| ApduError::Timeout(self.answer_timeout))?
    }

    async fn read_answer(&mut self) -> Result<ApduAnswer, ApduError> {
        let len = self.stream.read_u32().await? as usize;
        if len > MAX_ANSWER_LEN {
            return Err(ApduError::AnswerTooLong(len));
        }
        let mut raw = vec![0u8; len + 2];
        self.stream.read_exact(&mut raw).await?;
        let status = u16::from_be_bytes([raw[len], raw[len + 1]]);
        raw.truncate(len);
        Ok(ApduAnswer { data: raw, status })
    }
}

#[async_trait]
impl ApduTransport for TcpApduTransport {
    async fn exchange(&mut self, apdu: &[u8]) -> Result<ApduAnswer, ApduError> {
        if self.desynchronized {
            return Err(ApduError::Desynchronized);
        }
        let answer = self.round_trip(apdu).await;
        if answer.is_err() {
            log::warn!("⚠️ Ledger transport desynchronized, reconnect before the next request");
            self.desynchronized = true;
        }
        answer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppVersion {
    pub test_mode: bool,
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub locked: bool,
}

impl AppVersion {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 {
            return None;
        }
        let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        Some(Self {
            test_mode: data[0] != 0,
            major: word(1),
            minor: word(3),
            patch: word(5),
            locked: data.get(7).is_some_and(|b| *b == 1),
        })
    }
}

/// One open session with the Polkadot generic app. Requests are serialized:
/// at most one derive/sign exchange is in flight at a time.
pub struct LedgerSigner<T, P> {
    transport: Mutex<T>,
    proofs: P,
    chain_id: String,
    show_address: bool,
    version: AppVersion,
}

impl<T: ApduTransport, P: MetadataProofSource> LedgerSigner<T, P> {
    /// Opens the session by querying the app version.
    ///
    /// # Arguments
    /// * `transport` - Connected APDU transport, owned by the session from now on
    /// * `proofs` - Source of the metadata proof sent along with each payload
    /// * `chain_id` - Metadata service chain identifier (e.g. `dot`)
    ///
    /// # Returns
    /// * `Ok(LedgerSigner)` - The Polkadot app answered and the device is unlocked
    /// * `Err(SigningError::SignerUnavailable)` - App closed, device locked or no answer
    /// * `Err(SigningError::SignerTimeout)` - If the transport timed out
    pub async fn open(
        mut transport: T,
        proofs: P,
        chain_id: impl Into<String>,
    ) -> Result<Self, SigningError> {
        let command = ApduCommand {
            ins: INS_GET_VERSION,
            p1: 0,
            p2: 0,
            data: Vec::new(),
        };
        let answer = exchange(&mut transport, &command).await?;
        check_status(answer.status, None)?;

        let version = AppVersion::parse(&answer.data).ok_or_else(|| {
            SigningError::SignerUnavailable(format!(
                "unexpected version answer 0x{}",
                hex::encode(&answer.data)
            ))
        })?;
        if version.locked {
            return Err(SigningError::SignerUnavailable("device is locked".to_string()));
        }
        log::info!(
            "🔐 Ledger Polkadot app v{}.{}.{}{}",
            version.major,
            version.minor,
            version.patch,
            if version.test_mode { " (test mode)" } else { "" }
        );

        Ok(Self {
            transport: Mutex::new(transport),
            proofs,
            chain_id: chain_id.into(),
            show_address: false,
            version,
        })
    }

    /// Ask the device to display the address for confirmation.
    pub fn with_show_address(mut self, show: bool) -> Self {
        self.show_address = show;
        self
    }

    pub fn version(&self) -> AppVersion {
        self.version
    }
}

#[async_trait]
impl<T: ApduTransport, P: MetadataProofSource> ExternalSigner for LedgerSigner<T, P> {
    async fn get_address(
        &self,
        path: &DerivationPath,
        address_prefix: u16,
    ) -> Result<DerivedAddress, SigningError> {
        let mut data = path.to_bytes().to_vec();
        data.extend_from_slice(&address_prefix.to_le_bytes());
        let command = ApduCommand {
            ins: INS_GET_ADDR,
            p1: if self.show_address {
                P1_SHOW_ADDRESS
            } else {
                P1_ONLY_RETRIEVE
            },
            p2: SCHEME_ED25519,
            data,
        };

        let answer = {
            let mut transport = self.transport.lock().await;
            exchange(&mut *transport, &command).await?
        };
        check_status(answer.status, Some(path))?;

        if answer.data.len() <= PUBLIC_KEY_LEN {
            return Err(SigningError::DerivationFailed {
                path: path.to_string(),
                reason: format!("address answer has only {} bytes", answer.data.len()),
            });
        }
        let (public_key, address) = answer.data.split_at(PUBLIC_KEY_LEN);
        let address = String::from_utf8(address.to_vec()).map_err(|_| {
            SigningError::DerivationFailed {
                path: path.to_string(),
                reason: "address is not valid utf-8".to_string(),
            }
        })?;

        Ok(DerivedAddress {
            address,
            public_key: public_key.to_vec(),
        })
    }

    async fn sign(&self, path: &DerivationPath, payload: &[u8]) -> Result<Signature, SigningError> {
        let blob_len = u16::try_from(payload.len()).map_err(|_| {
            SigningError::malformed(format!(
                "payload of {} bytes exceeds the device limit",
                payload.len()
            ))
        })?;

        let proof = self.proofs.fetch_proof(&self.chain_id, payload).await?;
        let commands = sign_commands(path, payload, blob_len, &proof);
        log::debug!(
            "Signing {} payload bytes + {} proof bytes in {} chunks",
            payload.len(),
            proof.len(),
            commands.len()
        );

        let mut transport = self.transport.lock().await;
        let mut last = None;
        for command in &commands {
            let answer = exchange(&mut *transport, command).await?;
            check_status(answer.status, None)?;
            last = Some(answer);
        }

        match last {
            Some(answer) if !answer.data.is_empty() => Ok(Signature::new(answer.data)),
            _ => Err(SigningError::SignerUnavailable(
                "device returned no signature".to_string(),
            )),
        }
    }
}

/// Splits a sign request: path and blob length first, then payload ++ proof.
fn sign_commands(
    path: &DerivationPath,
    payload: &[u8],
    blob_len: u16,
    proof: &[u8],
) -> Vec<ApduCommand> {
    let mut first = path.to_bytes().to_vec();
    first.extend_from_slice(&blob_len.to_le_bytes());

    let body: Vec<u8> = payload.iter().chain(proof).copied().collect();
    let chunks: Vec<&[u8]> = body.chunks(CHUNK_SIZE).collect();

    let mut commands = vec![ApduCommand {
        ins: INS_SIGN,
        p1: P1_INIT,
        p2: SCHEME_ED25519,
        data: first,
    }];
    for (i, chunk) in chunks.iter().enumerate() {
        commands.push(ApduCommand {
            ins: INS_SIGN,
            p1: if i + 1 == chunks.len() { P1_LAST } else { P1_ADD },
            p2: SCHEME_ED25519,
            data: chunk.to_vec(),
        });
    }
    commands
}

async fn exchange<T: ApduTransport + ?Sized>(
    transport: &mut T,
    command: &ApduCommand,
) -> Result<ApduAnswer, SigningError> {
    let raw = command
        .serialize()
        .map_err(|e| SigningError::malformed(e.to_string()))?;
    transport.exchange(&raw).await.map_err(|e| match e {
        ApduError::Timeout(_) => SigningError::SignerTimeout,
        other => SigningError::SignerUnavailable(other.to_string()),
    })
}

/// Maps a status word to the error taxonomy. `path` is given for address
/// requests, where key errors mean the path was refused.
fn check_status(status: u16, path: Option<&DerivationPath>) -> Result<(), SigningError> {
    match (status, path) {
        (SW_OK, _) => Ok(()),
        (SW_USER_REJECTED, _) => Err(SigningError::UserRejectedOnDevice),
        (SW_BAD_KEY_HANDLE | SW_DATA_INVALID, Some(path)) => Err(SigningError::DerivationFailed {
            path: path.to_string(),
            reason: format!("device refused the path (0x{status:04x})"),
        }),
        (SW_APP_NOT_OPEN | SW_CLA_NOT_SUPPORTED | SW_INS_NOT_SUPPORTED, _) => Err(
            SigningError::SignerUnavailable(format!("Polkadot app is not open (0x{status:04x})")),
        ),
        (SW_DEVICE_LOCKED, _) => Err(SigningError::SignerUnavailable("device is locked".to_string())),
        (SW_DATA_INVALID, None) => Err(SigningError::malformed(
            "device could not parse the payload (0x6984)",
        )),
        (other, _) => Err(SigningError::SignerUnavailable(format!(
            "device returned status 0x{other:04x}"
        ))),
    }
}
