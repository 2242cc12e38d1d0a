// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential redaction for connection strings that end up in logs.

use url::Url;

const MASK: &str = "***";

/// Replace the password component of a connection URL with `***`.
///
/// Strings that do not parse as URLs fall back to masking everything between
/// the scheme separator and the last `@`.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() && url.set_password(Some(MASK)).is_ok() {
                return url.to_string();
            }
            raw.to_string()
        }
        Err(_) => redact_fallback(raw),
    }
}

fn redact_fallback(raw: &str) -> String {
    let Some(scheme_end) = raw.find("://") else {
        return raw.to_string();
    };
    let userinfo_start = scheme_end + 3;
    match raw[userinfo_start..].rfind('@') {
        Some(at) => format!(
            "{}{}{}",
            &raw[..userinfo_start],
            MASK,
            &raw[userinfo_start + at..]
        ),
        None => raw.to_string(),
    }
}
