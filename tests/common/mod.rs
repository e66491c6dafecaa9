//! Shared fixtures for the integration tests: wire-format builders for
//! framed messages and serialized-object payloads carrying an action key.
#![allow(dead_code)]

/// Frame a payload with its 4-byte big-endian length prefix.
pub fn framed(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// A pickle protocol-4 blob for a dict of string keys and values, laid
/// out the way the observed peers serialize them.
pub fn dict_blob(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut body = vec![b'}', 0x94, b'('];
    for (k, v) in pairs {
        for s in [k, v] {
            body.push(0x8c);
            body.push(s.len() as u8);
            body.extend_from_slice(s.as_bytes());
            body.push(0x94);
        }
    }
    body.push(b'u');
    body.push(b'.');

    let mut blob = vec![0x80, 0x04, 0x95];
    blob.extend_from_slice(&(body.len() as u64).to_le_bytes());
    blob.extend_from_slice(&body);
    blob
}

/// A complete framed message whose decoded mapping carries `action`.
pub fn action_message(action: &str) -> Vec<u8> {
    framed(&dict_blob(&[("action", action)]))
}
