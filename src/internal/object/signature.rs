//! Author, committer and tagger lines: `<role> <name> <<email>> <unix-seconds> <+hhmm>`.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SignatureType {
    Author,
    Committer,
    Tagger,
}

impl Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureType::Author => write!(f, "author"),
            SignatureType::Committer => write!(f, "committer"),
            SignatureType::Tagger => write!(f, "tagger"),
        }
    }
}

impl SignatureType {
    pub fn from_data(data: &[u8]) -> Result<Self, GitError> {
        match data {
            b"author" => Ok(SignatureType::Author),
            b"committer" => Ok(SignatureType::Committer),
            b"tagger" => Ok(SignatureType::Tagger),
            _ => Err(GitError::InvalidSignature(
                String::from_utf8_lossy(data).to_string(),
            )),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub signature_type: SignatureType,
    pub name: String,
    pub email: String,
    pub timestamp: i64,
    pub timezone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} <{}> {} {}",
            self.signature_type, self.name, self.email, self.timestamp, self.timezone
        )
    }
}

impl Signature {
    pub fn new(signature_type: SignatureType, name: &str, email: &str) -> Signature {
        Signature {
            signature_type,
            name: name.to_string(),
            email: email.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            timezone: "+0000".to_string(),
        }
    }

    /// Parses a full signature line, role keyword included.
    pub fn from_data(data: &[u8]) -> Result<Signature, GitError> {
        let invalid = || GitError::InvalidSignature(data.to_str_lossy().to_string());

        let (role, rest) = data.split_once_str(" ").ok_or_else(invalid)?;
        let signature_type = SignatureType::from_data(role)?;

        let email_start = rest.find_byte(b'<').ok_or_else(invalid)?;
        let email_end = rest.rfind_byte(b'>').ok_or_else(invalid)?;
        if email_end < email_start {
            return Err(invalid());
        }
        let name = rest[..email_start].trim().to_str_lossy().to_string();
        let email = rest[email_start + 1..email_end].to_str_lossy().to_string();

        let mut tail = rest[email_end + 1..].trim().split_str(" ");
        let timestamp = tail
            .next()
            .and_then(|t| t.to_str().ok())
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let timezone = tail
            .next()
            .map(|t| t.to_str_lossy().to_string())
            .unwrap_or_else(|| "+0000".to_string());

        Ok(Signature {
            signature_type,
            name,
            email,
            timestamp,
            timezone,
        })
    }

    pub fn to_data(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}
