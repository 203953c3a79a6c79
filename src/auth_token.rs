// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Hardware authentication token passed by the framework to `enroll`.

use bitflags::bitflags;
use subtle::ConstantTimeEq;

use crate::error::Error;

/// Size of a serialized token.
pub const AUTH_TOKEN_LEN: usize = 69;
/// The only token layout version understood by this adapter.
pub const AUTH_TOKEN_VERSION: u8 = 0;

const HMAC_LEN: usize = 32;

bitflags! {
    /// Authenticators that may have issued a token.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AuthenticatorType: u32 {
        /// Password / PIN / pattern, issued by gatekeeper.
        const PASSWORD = 1;
        /// Fingerprint, issued by a fingerprint HAL.
        const FINGERPRINT = 1 << 1;
    }
}

/// Parsed hardware authentication token.
///
/// Layout (packed): version, challenge, user id, authenticator id (host order),
/// authenticator type and timestamp (big endian), HMAC.  The HMAC is not checked here; it is
/// verified by the trustlet together with the raw bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthToken {
    /// Layout version.
    pub version: u8,
    /// Challenge the token was issued for.
    pub challenge: u64,
    /// Secure user id.
    pub user_id: u64,
    /// Authenticator id of the issuer.
    pub authenticator_id: u64,
    /// Issuer type.
    pub authenticator_type: AuthenticatorType,
    /// Milliseconds since boot at issuance.
    pub timestamp: u64,
    /// Issuer MAC over the preceding fields.
    pub hmac: [u8; HMAC_LEN],
}

fn u64_at(data: &[u8; AUTH_TOKEN_LEN], offset: usize) -> [u8; 8] {
    let mut buf = [0; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    buf
}

impl AuthToken {
    /// Parses and sanity-checks a token.
    ///
    /// An all-zero buffer, a foreign layout version or a zero challenge are rejected: the
    /// framework passes such tokens when no credential confirmation happened.
    pub fn parse(data: &[u8; AUTH_TOKEN_LEN]) -> Result<Self, Error> {
        if data.iter().all(|b| *b == 0) {
            warn!("Authentication token is unset");
            return Err(Error::InvalidToken);
        }
        let version = data[0];
        if version != AUTH_TOKEN_VERSION {
            warn!("Unsupported authentication token version {version}");
            return Err(Error::InvalidToken);
        }
        let challenge = u64::from_ne_bytes(u64_at(data, 1));
        if challenge == 0 {
            warn!("Authentication token without challenge");
            return Err(Error::InvalidToken);
        }
        let mut ty = [0; 4];
        ty.copy_from_slice(&data[25..29]);
        let mut hmac = [0; HMAC_LEN];
        hmac.copy_from_slice(&data[37..]);
        Ok(Self {
            version,
            challenge,
            user_id: u64::from_ne_bytes(u64_at(data, 9)),
            authenticator_id: u64::from_ne_bytes(u64_at(data, 17)),
            authenticator_type: AuthenticatorType::from_bits_retain(u32::from_be_bytes(ty)),
            timestamp: u64::from_be_bytes(u64_at(data, 29)),
            hmac,
        })
    }

    /// Serializes the token back into its wire layout.
    pub fn to_bytes(&self) -> [u8; AUTH_TOKEN_LEN] {
        let mut data = [0; AUTH_TOKEN_LEN];
        data[0] = self.version;
        data[1..9].copy_from_slice(&self.challenge.to_ne_bytes());
        data[9..17].copy_from_slice(&self.user_id.to_ne_bytes());
        data[17..25].copy_from_slice(&self.authenticator_id.to_ne_bytes());
        data[25..29].copy_from_slice(&self.authenticator_type.bits().to_be_bytes());
        data[29..37].copy_from_slice(&self.timestamp.to_be_bytes());
        data[37..].copy_from_slice(&self.hmac);
        data
    }

    /// Checks that the token was issued by a password confirmation for `challenge`.
    pub fn check_enroll(&self, challenge: u64) -> Result<(), Error> {
        if !self.authenticator_type.contains(AuthenticatorType::PASSWORD) {
            warn!(
                "Enroll token issued by {:?}, not a password",
                self.authenticator_type
            );
            return Err(Error::InvalidToken);
        }
        let matches: bool = self
            .challenge
            .to_ne_bytes()
            .ct_eq(&challenge.to_ne_bytes())
            .into();
        if !matches {
            return Err(Error::ChallengeMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use hex_literal::hex;

    fn token(challenge: u64, ty: AuthenticatorType) -> AuthToken {
        AuthToken {
            version: 0,
            challenge,
            user_id: 0x1122,
            authenticator_id: 0x3344,
            authenticator_type: ty,
            timestamp: 1000,
            hmac: [0xAB; 32],
        }
    }

    #[test]
    fn parse_layout() {
        let mut data = [0; AUTH_TOKEN_LEN];
        data[1..9].copy_from_slice(&42u64.to_ne_bytes());
        data[25..29].copy_from_slice(&hex!("00 00 00 01"));
        data[29..37].copy_from_slice(&hex!("00 00 00 00 00 00 01 00"));
        data[37..].copy_from_slice(&[7; 32]);
        let token = AuthToken::parse(&data).unwrap();
        assert_eq!(token.challenge, 42);
        assert_eq!(token.authenticator_type, AuthenticatorType::PASSWORD);
        assert_eq!(token.timestamp, 256);
        assert_eq!(token.hmac, [7; 32]);
        assert_eq!(token.to_bytes(), data);
    }

    #[test]
    fn reject_malformed() {
        assert_eq!(
            AuthToken::parse(&[0; AUTH_TOKEN_LEN]),
            Err(Error::InvalidToken)
        );

        let mut data = token(42, AuthenticatorType::PASSWORD).to_bytes();
        data[0] = 2;
        assert_eq!(AuthToken::parse(&data), Err(Error::InvalidToken));

        let data = token(0, AuthenticatorType::PASSWORD).to_bytes();
        assert_eq!(AuthToken::parse(&data), Err(Error::InvalidToken));
    }

    #[test]
    fn enroll_binding() {
        let password = token(42, AuthenticatorType::PASSWORD);
        assert_eq!(password.check_enroll(42), Ok(()));
        assert_eq!(password.check_enroll(43), Err(Error::ChallengeMismatch));

        let fingerprint = token(42, AuthenticatorType::FINGERPRINT);
        assert_eq!(fingerprint.check_enroll(42), Err(Error::InvalidToken));
    }
}
