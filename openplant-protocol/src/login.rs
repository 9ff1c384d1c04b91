//! Login handshake packets.
//!
//! ```text
//! server -> client: info[60] session[4] scramble[20] reserved[12] version[4]
//! client -> server: zeros[44] user[16] passlen[2] reply[20] reserved[18]
//! server -> client: magic[4] peer_ip[4] err[4] magic[4]
//! ```
//!
//! The greeting and reply travel as raw socket bytes; the client message is
//! sent as a single eof frame.

use crate::error::ProtocolError;
use crate::v3::MAGIC;
use sha1::{Digest, Sha1};
use std::net::Ipv4Addr;

pub use crate::hash::make_uuid;

pub const HELLO_LEN: usize = 100;
pub const LOGIN_LEN: usize = 100;
pub const REPLY_LEN: usize = 16;

const USER_OFFSET: usize = 44;
const USER_MAX: usize = 16;
const PASSLEN_OFFSET: usize = 60;
const REPLY_OFFSET: usize = 62;
const SCRAMBLE_LEN: usize = 20;

/// The server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub info: String,
    pub session: u32,
    pub scramble: [u8; SCRAMBLE_LEN],
    pub version: u32,
}

impl ServerHello {
    pub fn decode(buf: &[u8; HELLO_LEN]) -> Self {
        let info = &buf[..60];
        let end = info.iter().position(|b| *b == 0).unwrap_or(info.len());
        let mut scramble = [0u8; SCRAMBLE_LEN];
        scramble.copy_from_slice(&buf[64..84]);
        Self {
            info: String::from_utf8_lossy(&info[..end]).into_owned(),
            session: u32::from_be_bytes([buf[60], buf[61], buf[62], buf[63]]),
            scramble,
            version: u32::from_be_bytes([buf[96], buf[97], buf[98], buf[99]]),
        }
    }

    /// Greeting bytes as a server sends them; `info` is truncated to 59 bytes.
    pub fn encode(&self) -> [u8; HELLO_LEN] {
        let mut buf = [0u8; HELLO_LEN];
        let info = self.info.as_bytes();
        let n = info.len().min(59);
        buf[..n].copy_from_slice(&info[..n]);
        buf[60..64].copy_from_slice(&self.session.to_be_bytes());
        buf[64..84].copy_from_slice(&self.scramble);
        buf[96..100].copy_from_slice(&self.version.to_be_bytes());
        buf
    }
}

/// `sha1(scramble ‖ sha1(sha1(pass))) xor sha1(pass)`.
pub fn scramble_password(password: &[u8], scramble: &[u8]) -> [u8; SCRAMBLE_LEN] {
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let mask = hasher.finalize();

    let mut reply = [0u8; SCRAMBLE_LEN];
    for (i, out) in reply.iter_mut().enumerate() {
        *out = mask[i] ^ stage1[i];
    }
    reply
}

/// Builds the 100-byte client login message.
///
/// User names longer than 16 bytes are truncated. The password reply is
/// present only when `password` is non-empty.
pub fn build_login_message(user: &str, password: &str, scramble: &[u8]) -> [u8; LOGIN_LEN] {
    let mut msg = [0u8; LOGIN_LEN];
    let user = user.as_bytes();
    let n = user.len().min(USER_MAX);
    msg[USER_OFFSET..USER_OFFSET + n].copy_from_slice(&user[..n]);
    if !password.is_empty() {
        let reply = scramble_password(password.as_bytes(), scramble);
        msg[PASSLEN_OFFSET..PASSLEN_OFFSET + 2].copy_from_slice(&(SCRAMBLE_LEN as u16).to_be_bytes());
        msg[REPLY_OFFSET..REPLY_OFFSET + SCRAMBLE_LEN].copy_from_slice(&reply);
    }
    msg
}

/// Credentials a server reads back out of a login message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginMessage {
    pub user: String,
    pub reply: Option<[u8; SCRAMBLE_LEN]>,
}

impl LoginMessage {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < LOGIN_LEN {
            return Err(ProtocolError::Incomplete {
                needed: LOGIN_LEN - buf.len(),
            });
        }
        let user = &buf[USER_OFFSET..USER_OFFSET + USER_MAX];
        let end = user.iter().position(|b| *b == 0).unwrap_or(USER_MAX);
        let passlen = u16::from_be_bytes([buf[PASSLEN_OFFSET], buf[PASSLEN_OFFSET + 1]]) as usize;
        let reply = match passlen {
            0 => None,
            SCRAMBLE_LEN => {
                let mut r = [0u8; SCRAMBLE_LEN];
                r.copy_from_slice(&buf[REPLY_OFFSET..REPLY_OFFSET + SCRAMBLE_LEN]);
                Some(r)
            }
            other => {
                return Err(ProtocolError::malformed("login", format!("password reply length {other}")))
            }
        };
        Ok(Self {
            user: String::from_utf8_lossy(&user[..end]).into_owned(),
            reply,
        })
    }

    /// Checks the reply against the expected password.
    pub fn verify(&self, password: &str, scramble: &[u8]) -> bool {
        match &self.reply {
            None => password.is_empty(),
            Some(reply) => *reply == scramble_password(password.as_bytes(), scramble),
        }
    }
}

/// The final 16-byte handshake reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginReply {
    pub peer: Ipv4Addr,
    /// Non-zero means the login was refused.
    pub err: i32,
}

impl LoginReply {
    pub fn decode(buf: &[u8; REPLY_LEN]) -> Result<Self, ProtocolError> {
        for at in [0, 12] {
            let actual = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            if actual != MAGIC {
                return Err(ProtocolError::InvalidMagic {
                    expected: MAGIC,
                    actual,
                });
            }
        }
        Ok(Self {
            peer: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
            err: i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let mut buf = [0u8; REPLY_LEN];
        buf[..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.peer.octets());
        buf[8..12].copy_from_slice(&self.err.to_be_bytes());
        buf[12..].copy_from_slice(&MAGIC.to_be_bytes());
        buf
    }

    pub fn is_ok(&self) -> bool {
        self.err == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> ServerHello {
        ServerHello {
            info: "OpenPlant 5.0".into(),
            session: 42,
            scramble: *b"0123456789abcdefghij",
            version: 0x0005_0000,
        }
    }

    #[test]
    fn test_hello_round_trip() {
        let h = hello();
        let bytes = h.encode();
        assert_eq!(bytes[13], 0);
        assert_eq!(ServerHello::decode(&bytes), h);
    }

    #[test]
    fn test_login_layout() {
        let msg = build_login_message("sis", "openplant", &hello().scramble);
        assert!(msg[..44].iter().all(|b| *b == 0));
        assert_eq!(&msg[44..47], b"sis");
        assert_eq!(&msg[60..62], &[0, 20]);
        assert!(msg[82..].iter().all(|b| *b == 0));

        let parsed = LoginMessage::decode(&msg).unwrap();
        assert_eq!(parsed.user, "sis");
        assert!(parsed.verify("openplant", &hello().scramble));
        assert!(!parsed.verify("wrong", &hello().scramble));
    }

    #[test]
    fn test_empty_password_has_no_reply() {
        let msg = build_login_message("guest", "", &hello().scramble);
        assert_eq!(&msg[60..82], &[0u8; 22]);
        let parsed = LoginMessage::decode(&msg).unwrap();
        assert_eq!(parsed.reply, None);
        assert!(parsed.verify("", &hello().scramble));
    }

    #[test]
    fn test_long_user_truncated() {
        let msg = build_login_message("a-very-long-user-name", "", &[]);
        assert_eq!(&msg[44..60], b"a-very-long-user");
        assert_eq!(&msg[60..62], &[0, 0]);
    }

    #[test]
    fn test_scramble_unmasks_to_stage1() {
        let scramble = hello().scramble;
        let reply = scramble_password(b"secret", &scramble);
        let stage1 = Sha1::digest(b"secret");
        let stage2 = Sha1::digest(stage1);
        let mut h = Sha1::new();
        h.update(scramble);
        h.update(stage2);
        let mask = h.finalize();
        let unmasked: Vec<u8> = reply.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(&unmasked[..], &stage1[..]);
    }

    #[test]
    fn test_reply_decode() {
        let reply = LoginReply {
            peer: Ipv4Addr::new(10, 0, 0, 7),
            err: 0,
        };
        assert_eq!(LoginReply::decode(&reply.encode()).unwrap(), reply);

        let refused = LoginReply { err: -1, ..reply };
        assert!(!LoginReply::decode(&refused.encode()).unwrap().is_ok());
    }

    #[test]
    fn test_reply_bad_magic() {
        let mut bytes = LoginReply {
            peer: Ipv4Addr::LOCALHOST,
            err: 0,
        }
        .encode();
        bytes[15] = 0;
        assert!(matches!(
            LoginReply::decode(&bytes),
            Err(ProtocolError::InvalidMagic { expected: MAGIC, .. })
        ));
    }
}
