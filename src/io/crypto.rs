use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the given parts, each terminated by a `|` separator
/// so that ("ab", "c") and ("a", "bc") digest differently.
pub fn sha256_hex_parts<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}
