//! NTLM messages used by SIP NTLM authentication.
//!
//! Only the client side of the exchange is needed: the server's type-2
//! challenge is decoded from `gssapi-data` and answered with a type-3
//! message carrying NTLMv1 LM and NT responses.

use crate::{SipError, SipResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use md4::{Digest, Md4};

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const TYPE2: u32 = 2;
const TYPE3: u32 = 3;
const TYPE2_MIN_LEN: usize = 32;
const TYPE3_HEADER_LEN: usize = 64;
const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;

/// Decoded type-2 (challenge) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Type2Challenge {
    pub nonce: [u8; 8],
    pub flags: u32,
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub fn parse_type2(gssapi_data: &str) -> SipResult<Type2Challenge> {
    let raw = STANDARD
        .decode(gssapi_data.trim())
        .map_err(|e| SipError::AuthenticationFailed(format!("Invalid NTLM challenge: {}", e)))?;

    if raw.len() < TYPE2_MIN_LEN || &raw[..8] != SIGNATURE || read_u32(&raw, 8) != TYPE2 {
        return Err(SipError::AuthenticationFailed(
            "Invalid NTLM challenge message".to_string(),
        ));
    }

    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&raw[24..32]);
    Ok(Type2Challenge {
        nonce,
        flags: read_u32(&raw, 20),
    })
}

/// Spreads 56 key bits over the 8 bytes DES expects.
fn des_key(key7: &[u8]) -> [u8; 8] {
    [
        key7[0],
        (key7[0] << 7) | (key7[1] >> 1),
        (key7[1] << 6) | (key7[2] >> 2),
        (key7[2] << 5) | (key7[3] >> 3),
        (key7[3] << 4) | (key7[4] >> 4),
        (key7[4] << 3) | (key7[5] >> 5),
        (key7[5] << 2) | (key7[6] >> 6),
        key7[6] << 1,
    ]
}

fn des_encrypt(key7: &[u8], data: &[u8; 8]) -> [u8; 8] {
    let key = des_key(key7);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(data);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    out
}

pub fn lm_hash(password: &str) -> [u8; 16] {
    let mut key = [0u8; 14];
    for (slot, byte) in key.iter_mut().zip(password.to_uppercase().bytes()) {
        *slot = byte;
    }

    let mut hash = [0u8; 16];
    hash[..8].copy_from_slice(&des_encrypt(&key[..7], LM_MAGIC));
    hash[8..].copy_from_slice(&des_encrypt(&key[7..], LM_MAGIC));
    hash
}

pub fn nt_hash(password: &str) -> [u8; 16] {
    let digest = Md4::digest(utf16le(password));
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest);
    hash
}

/// NTLMv1 response: the hash padded to 21 bytes keys three DES operations.
pub fn challenge_response(hash: &[u8; 16], nonce: &[u8; 8]) -> [u8; 24] {
    let mut keys = [0u8; 21];
    keys[..16].copy_from_slice(hash);

    let mut response = [0u8; 24];
    for (i, chunk) in keys.chunks(7).enumerate() {
        response[i * 8..(i + 1) * 8].copy_from_slice(&des_encrypt(chunk, nonce));
    }
    response
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

fn put_secbuf(header: &mut Vec<u8>, len: usize, offset: usize) {
    header.extend_from_slice(&(len as u16).to_le_bytes());
    header.extend_from_slice(&(len as u16).to_le_bytes());
    header.extend_from_slice(&(offset as u32).to_le_bytes());
}

/// Builds the base64 encoded type-3 (authenticate) message.
pub fn gen_type3(
    user: &str,
    password: &str,
    hostname: &str,
    domain: &str,
    challenge: &Type2Challenge,
) -> String {
    let lm = challenge_response(&lm_hash(password), &challenge.nonce);
    let nt = challenge_response(&nt_hash(password), &challenge.nonce);

    let domain = utf16le(domain);
    let user = utf16le(user);
    let host = utf16le(hostname);

    // payload order: domain, user, host, LM, NT
    let domain_off = TYPE3_HEADER_LEN;
    let user_off = domain_off + domain.len();
    let host_off = user_off + user.len();
    let lm_off = host_off + host.len();
    let nt_off = lm_off + lm.len();
    let end = nt_off + nt.len();

    let mut message = Vec::with_capacity(end);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&TYPE3.to_le_bytes());
    put_secbuf(&mut message, lm.len(), lm_off);
    put_secbuf(&mut message, nt.len(), nt_off);
    put_secbuf(&mut message, domain.len(), domain_off);
    put_secbuf(&mut message, user.len(), user_off);
    put_secbuf(&mut message, host.len(), host_off);
    put_secbuf(&mut message, 0, end); // no session key

    let flags = NEGOTIATE_UNICODE | NEGOTIATE_NTLM | (challenge.flags & NEGOTIATE_ALWAYS_SIGN);
    message.extend_from_slice(&flags.to_le_bytes());

    message.extend_from_slice(&domain);
    message.extend_from_slice(&user);
    message.extend_from_slice(&host);
    message.extend_from_slice(&lm);
    message.extend_from_slice(&nt);
    STANDARD.encode(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn type2(nonce: [u8; 8], flags: u32) -> String {
        let mut raw = Vec::new();
        raw.extend_from_slice(SIGNATURE);
        raw.extend_from_slice(&TYPE2.to_le_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        raw.extend_from_slice(&flags.to_le_bytes());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&[0u8; 8]);
        STANDARD.encode(raw)
    }

    fn secbuf(raw: &[u8], at: usize) -> (usize, usize) {
        let len = u16::from_le_bytes([raw[at], raw[at + 1]]) as usize;
        (len, read_u32(raw, at + 4) as usize)
    }

    #[test]
    fn test_password_hashes() {
        assert_eq!(hex(&lm_hash("password")), "e52cac67419a9a224a3b108f3fa6cb6d");
        assert_eq!(hex(&nt_hash("password")), "8846f7eaee8fb117ad06bdd830b7586c");
    }

    #[test]
    fn test_parse_type2() {
        let nonce = [1, 35, 69, 103, 137, 171, 205, 239];
        let challenge = parse_type2(&type2(nonce, 0x8201)).unwrap();
        assert_eq!(challenge.nonce, nonce);
        assert_eq!(challenge.flags, 0x8201);
    }

    #[test]
    fn test_parse_type2_rejects_other_messages() {
        assert!(parse_type2("not base64 at all!").is_err());
        let mut raw = STANDARD.decode(type2([0; 8], 0)).unwrap();
        raw[8] = 1;
        assert!(parse_type2(&STANDARD.encode(raw)).is_err());
    }

    #[test]
    fn test_type3_layout() {
        let challenge = Type2Challenge {
            nonce: [1, 35, 69, 103, 137, 171, 205, 239],
            flags: NEGOTIATE_ALWAYS_SIGN,
        };
        let encoded = gen_type3("alice", "password", "host", "CORP", &challenge);
        let raw = STANDARD.decode(encoded).unwrap();

        assert_eq!(&raw[..8], SIGNATURE);
        assert_eq!(read_u32(&raw, 8), TYPE3);

        let (lm_len, lm_off) = secbuf(&raw, 12);
        let (nt_len, nt_off) = secbuf(&raw, 20);
        let (dom_len, dom_off) = secbuf(&raw, 28);
        let (user_len, user_off) = secbuf(&raw, 36);
        assert_eq!((lm_len, nt_len), (24, 24));
        assert_eq!(dom_off, TYPE3_HEADER_LEN);
        assert_eq!(&raw[dom_off..dom_off + dom_len], utf16le("CORP").as_slice());
        assert_eq!(&raw[user_off..user_off + user_len], utf16le("alice").as_slice());
        assert_eq!(
            &raw[nt_off..nt_off + nt_len],
            &challenge_response(&nt_hash("password"), &challenge.nonce)[..]
        );
        assert_eq!(
            &raw[lm_off..lm_off + lm_len],
            &challenge_response(&lm_hash("password"), &challenge.nonce)[..]
        );
        assert_eq!(nt_off + nt_len, raw.len());
        assert_eq!(
            read_u32(&raw, 60),
            NEGOTIATE_UNICODE | NEGOTIATE_NTLM | NEGOTIATE_ALWAYS_SIGN
        );
    }
}
