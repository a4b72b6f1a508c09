//! NTLMSSP message construction for NTLMv2 password authentication.
//! Only what the SMB session setup needs: NEGOTIATE, CHALLENGE parsing and
//! the AUTHENTICATE response.

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};

use crate::ConnectorError;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SECURITY: u32 = 0x0008_0000;

const FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SECURITY;

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    // HMAC-MD5 accepts any key length
    let Ok(mut mac) = Hmac::<md5::Md5>::new_from_slice(key) else {
        return [0u8; 16];
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// NTOWFv2: HMAC-MD5 over UPPER(user) + domain, keyed with MD4(UTF-16LE(pass)).
fn ntlmv2_hash(user: &str, domain: &str, password: &str) -> [u8; 16] {
    let mut md4 = Md4::new();
    md4.update(utf16le(password));
    let key: [u8; 16] = md4.finalize().into();
    let identity = format!("{}{}", user.to_uppercase(), domain);
    hmac_md5(&key, &utf16le(&identity))
}

/// Windows FILETIME: 100ns ticks since 1601-01-01.
fn filetime_now() -> u64 {
    let unix = chrono::Utc::now().timestamp() as u64;
    (unix + 11_644_473_600) * 10_000_000
}

pub fn negotiate_message() -> Vec<u8> {
    let mut m = SIGNATURE.to_vec();
    m.extend_from_slice(&1u32.to_le_bytes());
    m.extend_from_slice(&FLAGS.to_le_bytes());
    // empty domain and workstation security buffers
    m.extend_from_slice(&[0u8; 16]);
    m
}

pub struct Challenge {
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
    pub target_name: String,
}

/// Pull the server challenge and the AV-pair target info out of a
/// CHALLENGE (type 2) token.
pub fn parse_challenge(token: &[u8]) -> Result<Challenge, ConnectorError> {
    if token.len() < 48 || &token[..8] != SIGNATURE {
        return Err(ConnectorError::Protocol("not an NTLMSSP challenge".into()));
    }
    let msg_type = u32::from_le_bytes([token[8], token[9], token[10], token[11]]);
    if msg_type != 2 {
        return Err(ConnectorError::Protocol(format!(
            "expected NTLMSSP type 2, got {msg_type}"
        )));
    }

    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&token[24..32]);

    let buffer = |at: usize| -> Vec<u8> {
        let len = u16::from_le_bytes([token[at], token[at + 1]]) as usize;
        let off = u32::from_le_bytes([
            token[at + 4],
            token[at + 5],
            token[at + 6],
            token[at + 7],
        ]) as usize;
        token.get(off..off + len).map(<[u8]>::to_vec).unwrap_or_default()
    };

    let target_name_raw = buffer(12);
    let target_name = String::from_utf16_lossy(
        &target_name_raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect::<Vec<_>>(),
    );
    Ok(Challenge {
        server_challenge,
        target_info: buffer(40),
        target_name,
    })
}

fn push_buffer(header: &mut Vec<u8>, payload: &mut Vec<u8>, base: usize, data: &[u8]) {
    header.extend_from_slice(&(data.len() as u16).to_le_bytes());
    header.extend_from_slice(&(data.len() as u16).to_le_bytes());
    header.extend_from_slice(&((base + payload.len()) as u32).to_le_bytes());
    payload.extend_from_slice(data);
}

/// Build the AUTHENTICATE (type 3) token carrying an NTLMv2 response.
pub fn authenticate_message(
    user: &str,
    domain: &str,
    password: &str,
    challenge: &Challenge,
) -> Vec<u8> {
    let hash = ntlmv2_hash(user, domain, password);

    let client_challenge: [u8; 8] = {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;
        nanos.to_le_bytes()
    };

    // temp blob: version, timestamp, client nonce, av pairs
    let mut blob = vec![0x01, 0x01, 0, 0, 0, 0, 0, 0];
    blob.extend_from_slice(&filetime_now().to_le_bytes());
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(&challenge.target_info);
    blob.extend_from_slice(&[0u8; 4]);

    let mut proved = challenge.server_challenge.to_vec();
    proved.extend_from_slice(&blob);
    let nt_proof = hmac_md5(&hash, &proved);

    let mut nt_response = nt_proof.to_vec();
    nt_response.extend_from_slice(&blob);
    let lm_response = [0u8; 24];

    // header: signature, type, six security buffers, flags
    let base = 8 + 4 + 8 * 6 + 4;
    let mut header = SIGNATURE.to_vec();
    header.extend_from_slice(&3u32.to_le_bytes());
    let mut payload = Vec::new();
    push_buffer(&mut header, &mut payload, base, &lm_response);
    push_buffer(&mut header, &mut payload, base, &nt_response);
    push_buffer(&mut header, &mut payload, base, &utf16le(domain));
    push_buffer(&mut header, &mut payload, base, &utf16le(user));
    push_buffer(&mut header, &mut payload, base, &utf16le("CREDPROBE"));
    push_buffer(&mut header, &mut payload, base, &[]); // session key
    header.extend_from_slice(&FLAGS.to_le_bytes());
    header.extend_from_slice(&payload);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_is_well_formed() {
        let m = negotiate_message();
        assert_eq!(&m[..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes([m[8], m[9], m[10], m[11]]), 1);
        assert_eq!(m.len(), 32);
    }

    #[test]
    fn ntowf_v2_matches_known_vector() {
        // MS-NLMP 4.2.4.1.1: User/Domain/Password
        let hash = ntlmv2_hash("User", "Domain", "Password");
        assert_eq!(
            hash,
            [
                0x0c, 0x86, 0x8a, 0x40, 0x3b, 0xfd, 0x7a, 0x93, 0xa3, 0x00, 0x1e, 0xf2, 0x2e,
                0xf0, 0x2e, 0x3f
            ]
        );
    }

    #[test]
    fn challenge_round_trips_through_authenticate() {
        let mut token = SIGNATURE.to_vec();
        token.extend_from_slice(&2u32.to_le_bytes());
        // target name buffer: empty at offset 56
        token.extend_from_slice(&[0, 0, 0, 0, 56, 0, 0, 0]);
        token.extend_from_slice(&FLAGS.to_le_bytes());
        token.extend_from_slice(&[0x11; 8]); // server challenge
        token.extend_from_slice(&[0u8; 8]); // reserved
        let av = [0x02u8, 0x00, 0x04, 0x00, b'L', 0x00, b'B', 0x00];
        token.extend_from_slice(&[av.len() as u8, 0, av.len() as u8, 0, 56, 0, 0, 0]);
        token.extend_from_slice(&[0u8; 8]); // version
        token.extend_from_slice(&av);

        let parsed = parse_challenge(&token).unwrap();
        assert_eq!(parsed.server_challenge, [0x11; 8]);
        assert_eq!(parsed.target_info, av);

        let auth = authenticate_message("guest", "WORKGROUP", "", &parsed);
        assert_eq!(&auth[..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes([auth[8], auth[9], auth[10], auth[11]]), 3);
        // NT response buffer is proof(16) + blob
        let nt_len = u16::from_le_bytes([auth[20], auth[21]]) as usize;
        assert!(nt_len > 16 + 28);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_challenge(b"HTTP/1.1 200 OK").is_err());
    }
}
