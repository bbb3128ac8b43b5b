use rand::rngs::OsRng;
use rand::RngCore;

pub const ID_LENGTH: usize = 6;

pub const ALPHABET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// Largest multiple of 62 below 256. Bytes at or above it are discarded so every symbol is equally likely.
const ACCEPT_BELOW: u8 = 248;

/// Source of candidate file ids. Candidates may collide; callers check.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String, rand::Error>;
}

/// Draws ids from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsIdGenerator;

impl IdGenerator for OsIdGenerator {
    fn generate(&self) -> Result<String, rand::Error> {
        let mut id = String::with_capacity(ID_LENGTH);
        let mut buf = [0u8; 16];
        while id.len() < ID_LENGTH {
            OsRng.try_fill_bytes(&mut buf)?;
            for b in buf.iter().copied().filter(|b| *b < ACCEPT_BELOW) {
                id.push(ALPHABET[(b % 62) as usize] as char);
                if id.len() == ID_LENGTH {
                    break;
                }
            }
        }
        Ok(id)
    }
}

/// Cheap shape check so obviously bogus ids never reach the store.
pub fn is_well_formed(id: &str) -> bool {
    id.len() == ID_LENGTH && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
pub use scripted::ScriptedIds;


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_have_fixed_length_and_alphabet() {
        for _ in 0..200 {
            let id = OsIdGenerator.generate().unwrap();
            assert_eq!(id.len(), ID_LENGTH);
            assert!(id.bytes().all(|b| ALPHABET.contains(&b)), "unexpected symbol in {id}");
            assert!(is_well_formed(&id));
        }
    }

    #[test]
    fn generated_ids_do_not_repeat_in_practice() {
        let ids: HashSet<String> = (0..1000).map(|_| OsIdGenerator.generate().unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn scripted_ids_replay_then_fall_back() {
        let ids = ScriptedIds::new(["aaaaaa", "aaaaaa"]);
        assert_eq!(ids.generate().unwrap(), "aaaaaa");
        assert_eq!(ids.generate().unwrap(), "aaaaaa");
        let fallback = ids.generate().unwrap();
        assert!(is_well_formed(&fallback));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("abc"));
        assert!(!is_well_formed("abcdefg"));
        assert!(!is_well_formed("../etc"));
        assert!(!is_well_formed("ab-c_d"));
    }
}
