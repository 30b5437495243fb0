//! PBKDF2 credential hashing.
//!
//! Stored form: `$pbkdf2-sha256$<iterations>$<b64 salt>$<b64 key>`.
//! `verify_password` never accepts a plaintext stored value; a users file
//! containing plaintext entries is rewritten once at startup by
//! [`migrate_users_file`].

use std::{collections::BTreeMap, path::Path};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use postern_common::config::{ConfigError, UsersFile};

const ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot rewrite users file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot serialize users file: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Derives a fresh salted hash for `plaintext`.
#[must_use]
pub fn hash_password(plaintext: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);

    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), &salt, ITERATIONS, &mut key);

    format!(
        "$pbkdf2-sha256${ITERATIONS}${}${}",
        BASE64.encode(salt),
        BASE64.encode(key)
    )
}

/// Checks `plaintext` against a stored `$pbkdf2-sha256$` hash.
///
/// Anything that is not in the hashed format fails closed: plaintext stored
/// passwords are a migration artifact and never validate.
#[must_use]
pub fn verify_password(plaintext: &str, stored: &str) -> bool {
    let Some(rest) = stored.strip_prefix("$pbkdf2-sha256$") else {
        return false;
    };

    let mut parts = rest.splitn(3, '$');
    let (Some(iter_str), Some(salt_b64), Some(key_b64)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let Ok(iterations) = iter_str.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt_b64), BASE64.decode(key_b64)) else {
        return false;
    };
    if expected.len() != KEY_LEN || iterations == 0 {
        return false;
    }

    let mut derived = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), &salt, iterations, &mut derived);

    constant_time_eq(&derived, &expected)
}

/// True when `value` is already in a recognized hashed form.
#[must_use]
pub fn is_hashed(value: &str) -> bool {
    value.starts_with("$pbkdf2-sha256$") || value.starts_with("$pbkdf2$")
}

/// Length-gated constant-time comparison, shared with the admin-token check.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Loads the users file, hashing any plaintext entries in place.
///
/// When a migration happened the file is rewritten through a temp file and
/// atomic rename, so a crash mid-migration leaves the original intact.
/// Returns the user → stored-hash map the authenticator will serve from.
///
/// # Errors
///
/// See [`MigrateError`].
pub fn migrate_users_file(path: &Path) -> Result<BTreeMap<String, String>, MigrateError> {
    let mut file = UsersFile::load(path)?;
    let mut migrated = 0usize;

    for entry in file.users.values_mut() {
        if !is_hashed(&entry.password) {
            entry.password = hash_password(&entry.password);
            migrated += 1;
        }
    }

    if migrated > 0 {
        let serialized = serde_yaml::to_string(&file)?;
        let tmp = path.with_extension("yml.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, path)?;
        tracing::warn!(migrated, path = %path.display(), "hashed plaintext passwords in users file");
    }

    Ok(file
        .users
        .into_iter()
        .map(|(name, entry)| (name, entry.password))
        .collect())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::{hash_password, is_hashed, migrate_users_file, verify_password};

    #[test]
    fn hash_verify_round_trip() {
        let hash = hash_password("s3cret");
        assert!(is_hashed(&hash));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn salts_differ_between_hashes() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn plaintext_stored_value_never_validates() {
        assert!(!verify_password("letmein", "letmein"));
        assert!(!is_hashed("letmein"));
    }

    #[test]
    fn tampered_hash_fails() {
        let mut hash = hash_password("s3cret");
        hash.pop();
        hash.push('A');
        assert!(!verify_password("s3cret", &hash));
    }

    #[test]
    fn rejects_malformed_formats() {
        assert!(!verify_password("x", "$pbkdf2-sha256$"));
        assert!(!verify_password("x", "$pbkdf2-sha256$abc$zz$zz"));
        assert!(!verify_password("x", "$pbkdf2-sha256$0$c2FsdA==$c2FsdA=="));
    }

    #[test]
    fn migration_hashes_plaintext_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "users:\n  alice:\n    password: plaintext").unwrap();

        let users = migrate_users_file(&path).unwrap();
        assert!(is_hashed(&users["alice"]));
        assert!(verify_password("plaintext", &users["alice"]));

        // Second load sees hashes only and does not rewrite again.
        let again = migrate_users_file(&path).unwrap();
        assert_eq!(again["alice"], users["alice"]);
    }
}
