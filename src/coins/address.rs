// Coin address validation
//
// Receive and refund addresses are validated at the API boundary; an
// address that fails validation is never persisted. Legacy base58check
// addresses only (version-byte whitelist per coin plus checksum).

use sha2::{Digest, Sha256};

use crate::escrow::models::Coin;

pub struct AddressValidator;

impl AddressValidator {
    /// Check an address against the coin's base58check rules
    pub fn is_valid(coin: Coin, address: &str) -> bool {
        if address.len() < 26 || address.len() > 36 {
            return false;
        }

        let payload = match bs58::decode(address).into_vec() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        // 1 version byte + 20 byte hash + 4 byte checksum
        if payload.len() != 25 {
            return false;
        }

        let (body, checksum) = payload.split_at(21);
        if Self::checksum(body) != checksum {
            return false;
        }

        Self::version_bytes(coin).contains(&body[0])
    }

    /// Valid p2pkh / p2sh version bytes per coin
    fn version_bytes(coin: Coin) -> &'static [u8] {
        match coin {
            Coin::Bitcoin => &[0x00, 0x05],
            Coin::Litecoin => &[0x30, 0x32, 0x05],
            Coin::Dogecoin => &[0x1e, 0x16],
        }
    }

    fn checksum(body: &[u8]) -> [u8; 4] {
        let first = Sha256::digest(body);
        let second = Sha256::digest(first);
        let mut out = [0u8; 4];
        out.copy_from_slice(&second[..4]);
        out
    }
}
