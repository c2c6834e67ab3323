use sha1::{Digest, Sha1};
use std::fmt;

/// 20-byte SHA-1 content signature.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sig(pub [u8; 20]);

impl Sig {
    pub fn hash(data: &[u8]) -> Sig {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Sig(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_of_empty() {
        // well-known SHA-1 of the empty input
        assert_eq!(
            Sig::hash(b"").to_string(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn sig_is_stable() {
        assert_eq!(Sig::hash(b"abc"), Sig::hash(b"abc"));
        assert_ne!(Sig::hash(b"abc"), Sig::hash(b"abd"));
    }
}
