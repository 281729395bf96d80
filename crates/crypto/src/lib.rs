use anyhow::{Context, Result};
use secrecy::SecretVec;
use std::io::Read;
use std::path::Path;
use zeroize::Zeroizing;

/// Parse an AGE identity file: one bech32 secret key per line, `#` comments
/// and blank lines ignored.
pub fn load_identities(path: &Path) -> Result<Vec<age::x25519::Identity>> {
    let text = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("open identity {}", path.display()))?,
    );
    let mut ids = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let id = line
            .parse::<age::x25519::Identity>()
            .map_err(|e| anyhow::anyhow!("bad identity in {}: {e}", path.display()))?;
        ids.push(id);
    }
    if ids.is_empty() {
        anyhow::bail!("no identities found in {}", path.display());
    }
    Ok(ids)
}

/// Decrypt an AGE stream into guarded memory.
pub fn decrypt_age_bytes(rdr: impl Read, ids: &[age::x25519::Identity]) -> Result<SecretVec<u8>> {
    let decryptor = age::Decryptor::new(rdr).context("read age header")?;
    let mut reader = decryptor
        .decrypt(ids.iter().map(|i| i as &dyn age::Identity))
        .context("no supplied identity matches this file")?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out).context("decrypt age payload")?;
    Ok(SecretVec::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("batchforge-crypto-{name}"));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn rejects_an_empty_identity_file() {
        let path = temp_file("empty", "# only a comment\n\n");
        assert!(load_identities(&path).is_err());
    }

    #[test]
    fn rejects_a_malformed_identity() {
        let path = temp_file("malformed", "AGE-SECRET-KEY-NOT-A-REAL-KEY\n");
        let err = match load_identities(&path) {
            Ok(_) => panic!("expected an error"),
            Err(e) => e.to_string(),
        };
        assert!(err.contains("bad identity"));
    }

    #[test]
    fn rejects_non_age_input() {
        let ids = Vec::new();
        assert!(decrypt_age_bytes(&b"name_prefix: nf-dev"[..], &ids).is_err());
    }
}
