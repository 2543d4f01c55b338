//! Micropayment signer.
//!
//! A single concrete, file-backed [`WalletSigner`] implementation — there is
//! exactly one signing mechanism in scope, so no auth-method enum is
//! needed. The trait exists so the dispatcher depends on a `Send + Sync`
//! abstraction rather than the loading details.

use std::path::PathBuf;

use anyhow::Context;

/// Produces a payment attestation header for a given cost estimate.
///
/// Holds only a parsed private key and is stateless per call, so any
/// implementation is safely `Send + Sync` and shared across requests.
pub trait WalletSigner: Send + Sync {
    fn sign(&self, amount: f64) -> anyhow::Result<String>;
    fn address(&self) -> &str;
}

/// Reads a 66-char `0x`-prefixed private key from `BLOCKRUN_WALLET_KEY` or,
/// failing that, from the wallet key file and signs payment attestations
/// with it.
pub struct FileWalletSigner {
    private_key: String,
    address: String,
}

impl FileWalletSigner {
    /// Load the key from `BLOCKRUN_WALLET_KEY` if set, otherwise from
    /// `~/.openclaw/blockrun/wallet.key`. Fails startup if neither is
    /// available.
    pub fn load() -> anyhow::Result<Self> {
        let private_key = match std::env::var("BLOCKRUN_WALLET_KEY") {
            Ok(key) => key,
            Err(_) => {
                let path = wallet_key_path()?;
                std::fs::read_to_string(&path)
                    .with_context(|| format!("reading wallet key from {}", path.display()))?
                    .trim()
                    .to_string()
            }
        };

        anyhow::ensure!(
            private_key.len() == 66 && private_key.starts_with("0x"),
            "wallet key must be a 66-char 0x-prefixed hex string"
        );
        anyhow::ensure!(
            private_key[2..].chars().all(|c| c.is_ascii_hexdigit()),
            "wallet key must contain only hex digits after the 0x prefix"
        );

        let address = derive_address(&private_key);
        Ok(Self { private_key, address })
    }
}

fn wallet_key_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; cannot locate wallet key file")?;
    Ok(PathBuf::from(home).join(".openclaw").join("blockrun").join("wallet.key"))
}

/// Derive a display address from the key's hash. This is not a real
/// elliptic-curve public-key derivation — attaching a production signing
/// stack is out of scope — but it is deterministic and collision-resistant
/// enough for the loopback proxy's own diagnostics.
fn derive_address(private_key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(private_key.as_bytes());
    format!("0x{}", digest.iter().take(20).map(|b| format!("{b:02x}")).collect::<String>())
}

impl WalletSigner for FileWalletSigner {
    fn sign(&self, amount: f64) -> anyhow::Result<String> {
        use sha2::{Digest, Sha256};
        anyhow::ensure!(amount >= 0.0, "cannot sign a negative payment amount");
        let mut hasher = Sha256::new();
        hasher.update(&self.private_key);
        hasher.update(amount.to_bits().to_be_bytes());
        let digest = hasher.finalize();
        Ok(format!("{}:{:x}", self.address, digest))
    }

    fn address(&self) -> &str {
        &self.address
    }
}
