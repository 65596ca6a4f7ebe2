//! Local fallback storage for a passphrase sealed into the machine's own
//! hardware module.

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of generated passphrases, in characters.
pub const PASSPHRASE_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("nothing sealed at {0}")]
    Empty(String),
    #[error("sealed data is not a valid passphrase")]
    Encoding,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "tpm")]
    #[error(transparent)]
    Tpm(#[from] crate::tpm::TpmError),
}

pub type Result<T, E = SealError> = core::result::Result<T, E>;

pub trait SealStore {
    fn unseal(&mut self) -> Result<Zeroizing<Vec<u8>>>;

    /// Replaces whatever is sealed with `data`.
    fn seal(&mut self, data: &[u8]) -> Result<()>;
}

pub fn random_passphrase() -> Zeroizing<String> {
    Zeroizing::new(
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSPHRASE_LEN)
            .map(char::from)
            .collect(),
    )
}

/// Returns the sealed passphrase, sealing a freshly generated one if nothing
/// usable can be read.
pub fn local_pass(store: &mut dyn SealStore) -> Result<Zeroizing<String>> {
    let existing = store.unseal().and_then(|bytes| {
        String::from_utf8(bytes.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| SealError::Encoding)
    });
    match existing {
        Ok(passphrase) if !passphrase.is_empty() => Ok(passphrase),
        Ok(_) => generate(store),
        Err(e) => {
            tracing::warn!(error = %e, "no sealed passphrase, generating a new one");
            generate(store)
        }
    }
}

fn generate(store: &mut dyn SealStore) -> Result<Zeroizing<String>> {
    let passphrase = random_passphrase();
    store.seal(passphrase.as_bytes())?;
    Ok(passphrase)
}
