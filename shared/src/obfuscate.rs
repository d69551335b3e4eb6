//! Reversible byte-wise obfuscation for tunnel frames.
//!
//! Every byte is XORed with a single fixed key. This only keeps frames from
//! being readable at a glance; it provides no confidentiality or integrity.
//! Deployments that need either must run the tunnel over TLS (`wss://`).

/// Key used by the browser-side tunnel client and by default everywhere else.
pub const DEFAULT_KEY: u8 = 0x5A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obfuscator {
    key: u8,
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY)
    }
}

impl Obfuscator {
    pub const fn new(key: u8) -> Self {
        Self { key }
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    /// Transform in place. The transform is its own inverse.
    pub fn apply_in_place(&self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.key;
        }
    }

    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.key).collect()
    }

    pub fn decode(&self, data: &[u8]) -> Vec<u8> {
        self.encode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_inverts_encode() {
        let all_bytes: Vec<u8> = (0..=255u8).collect();
        let inputs: [&[u8]; 4] = [
            b"",
            b"{\"id\":7,\"url\":\"http://example.test/ok\"}",
            &all_bytes,
            &[0x5A, 0x5A, 0x00, 0xFF],
        ];

        for key in [0x00, DEFAULT_KEY, 0xFF] {
            let obf = Obfuscator::new(key);
            for input in inputs {
                assert_eq!(obf.decode(&obf.encode(input)), input);
            }
        }
    }

    #[test]
    fn test_encode_hides_plain_text() {
        let obf = Obfuscator::default();
        let encoded = obf.encode(b"GET http://example.test/");
        assert!(!encoded.windows(4).any(|w| w == b"http"));
    }

    #[test]
    fn test_in_place_matches_encode() {
        let obf = Obfuscator::new(0x33);
        let mut data = b"tunnel frame".to_vec();
        obf.apply_in_place(&mut data);
        assert_eq!(data, obf.encode(b"tunnel frame"));
    }
}
