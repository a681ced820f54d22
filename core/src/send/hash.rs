//! Content hash of outgoing messages

use base64::{engine::general_purpose::STANDARD, Engine as _};
use mailparse::{MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};

use crate::error::BridgeResult;

/// Headers that identify a message independently of its transport metadata
const HASHED_HEADERS: &[&str] = &["Subject", "From", "To", "Cc", "Bcc", "Reply-To", "In-Reply-To"];

/// Hash an RFC 822 message.
///
/// Covers the addressing headers, the subject and every leaf part's content
/// type, disposition and decoded body. Date and Message-ID are left out so a
/// client resubmitting the same message gets the same hash.
pub fn message_hash(literal: &[u8]) -> BridgeResult<String> {
    let parsed = mailparse::parse_mail(literal)?;
    let mut hasher = Sha256::new();

    for name in HASHED_HEADERS {
        if let Some(value) = parsed.headers.get_first_value(name) {
            hasher.update(value.trim().as_bytes());
        }
        hasher.update([0u8]);
    }

    hash_part(&parsed, &mut hasher)?;

    Ok(STANDARD.encode(hasher.finalize()))
}

fn hash_part(part: &ParsedMail<'_>, hasher: &mut Sha256) -> BridgeResult<()> {
    if !part.subparts.is_empty() {
        for subpart in &part.subparts {
            hash_part(subpart, hasher)?;
        }
        return Ok(());
    }

    let content_type = part.headers.get_first_value("Content-Type").unwrap_or_default();
    let disposition = part.headers.get_first_value("Content-Disposition").unwrap_or_default();
    let body = part.get_body_raw()?;

    hasher.update(content_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(disposition.as_bytes());
    hasher.update([0u8]);
    hasher.update(trim_whitespace(&body));
    hasher.update([0u8]);

    Ok(())
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
