use connector_errors::LinkError;
use zeroize::Zeroizing;

/// Decrypts link shared-secrets before a link is constructed.
///
/// The actual key management (KMS, local keyring, ...) lives outside the
/// core; the core only ever sees this one operation. Plaintext is returned
/// in a [`Zeroizing`] buffer so it is wiped as soon as it goes out of scope.
pub trait Decryptor: Clone + Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, LinkError>;

    /// Runs `f` over the decrypted secret, wiping the plaintext afterwards.
    fn with_decrypted<T>(
        &self,
        ciphertext: &[u8],
        f: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, LinkError> {
        let plaintext = self.decrypt(ciphertext)?;
        Ok(f(&plaintext))
        // plaintext is zeroized on drop
    }
}

/// Pass-through decryptor for development and tests, where secrets are
/// stored unencrypted.
#[derive(Clone, Debug, Default)]
pub struct NoopDecryptor;

impl Decryptor for NoopDecryptor {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, LinkError> {
        Ok(Zeroizing::new(ciphertext.to_vec()))
    }
}
