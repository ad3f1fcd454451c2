//! Sector encryption: XTS-AES-256 with HKDF-SHA256 account keys.
//!
//! One key+salt pair per account, persisted in the account metadata object and
//! copied into the crypt marker of every encrypted folder. Every
//! file gets its own random IV; sector `n` of a file is encrypted with tweak
//! `le128(iv) + n`. Sizes are length-preserving per sector, so the on-wire size
//! of a file is its plaintext size rounded up to whole sectors.

use aes::Aes256;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use xts_mode::Xts128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::CIPHER_BLOCK_SIZE;
use crate::error::{TransferError, TransferResult};
use crate::file::is_within;

/// Length of the XTS key (two AES-256 keys).
pub const KEY_LEN: usize = 64;
/// Length of the account salt.
pub const SALT_LEN: usize = 32;
/// Length of a per-file IV.
pub const IV_LEN: usize = 16;
/// Current marker format version.
pub const MARKER_VERSION: u32 = 1;

const KEY_INFO: &[u8] = b"clouddav-xts-key";
const KEY_CHECK_INFO: &[u8] = b"clouddav-key-check";

/// Bytes transmitted for a plaintext of `plain_size` bytes.
pub fn on_wire_size(plain_size: u64, sector_size: u64) -> u64 {
    plain_size.div_ceil(sector_size) * sector_size
}

/// Zero bytes appended to the last sector.
pub fn padding_bytes(plain_size: u64, sector_size: u64) -> u64 {
    (sector_size - plain_size % sector_size) % sector_size
}

/// Account encryption key derived from the crypt password and account salt.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptKey {
    key: [u8; KEY_LEN],
    salt: [u8; SALT_LEN],
}

impl std::fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CryptKey([REDACTED])")
    }
}

impl CryptKey {
    /// Derive the account key with HKDF-SHA256.
    pub fn derive(password: &str, salt: [u8; SALT_LEN]) -> TransferResult<Self> {
        if password.is_empty() {
            return Err(TransferError::Crypto("empty crypt password".to_string()));
        }
        let hk = Hkdf::<Sha256>::new(Some(&salt[..]), password.as_bytes());
        let mut key = [0u8; KEY_LEN];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| TransferError::Crypto(format!("HKDF expand: {}", e)))?;
        Ok(Self { key, salt })
    }

    /// Derive a key with a fresh random salt (first encrypted folder of an account).
    pub fn generate(password: &str) -> TransferResult<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::derive(password, salt)
    }

    /// The account salt.
    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    fn key_check_mac(&self) -> TransferResult<Hmac<Sha256>> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .map_err(|e| TransferError::Crypto(e.to_string()))?;
        mac.update(KEY_CHECK_INFO);
        Ok(mac)
    }

    /// HMAC-SHA256 verifier stored alongside the salt.
    pub fn key_check(&self) -> TransferResult<[u8; 32]> {
        Ok(self.key_check_mac()?.finalize().into_bytes().into())
    }

    /// Constant-time comparison against a stored verifier.
    pub fn verify(&self, key_check: &[u8]) -> TransferResult<()> {
        self.key_check_mac()?
            .verify_slice(key_check)
            .map_err(|_| TransferError::Crypto("crypt password does not match account key".to_string()))
    }

    fn xts(&self) -> TransferResult<Xts128<Aes256>> {
        use aes::cipher::KeyInit;
        let data_cipher = Aes256::new_from_slice(&self.key[..32])
            .map_err(|e| TransferError::Crypto(e.to_string()))?;
        let tweak_cipher = Aes256::new_from_slice(&self.key[32..])
            .map_err(|e| TransferError::Crypto(e.to_string()))?;
        Ok(Xts128::new(data_cipher, tweak_cipher))
    }
}

/// Account crypto metadata stored in the marker object of an encrypted folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptMarker {
    /// Format version.
    pub version: u32,
    /// Account salt (hex).
    pub salt: String,
    /// Key verifier (hex).
    pub key_check: String,
}

impl CryptMarker {
    /// Marker describing `key`.
    pub fn new(key: &CryptKey) -> TransferResult<Self> {
        Ok(Self {
            version: MARKER_VERSION,
            salt: hex::encode(key.salt()),
            key_check: hex::encode(key.key_check()?),
        })
    }

    /// Parse marker content.
    pub fn from_bytes(data: &[u8]) -> TransferResult<Self> {
        let marker: CryptMarker = serde_json::from_slice(data)?;
        if marker.version != MARKER_VERSION {
            return Err(TransferError::Crypto(format!(
                "unsupported crypt marker version {}",
                marker.version
            )));
        }
        Ok(marker)
    }

    /// Serialized marker content.
    pub fn to_bytes(&self) -> TransferResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decoded account salt.
    pub fn salt_bytes(&self) -> TransferResult<[u8; SALT_LEN]> {
        decode_fixed(&self.salt, "salt")
    }

    /// Derive the key from `password` and check it against this marker.
    pub fn unlock(&self, password: &str) -> TransferResult<CryptKey> {
        let key = CryptKey::derive(password, self.salt_bytes()?)?;
        let check = hex::decode(&self.key_check)
            .map_err(|e| TransferError::Crypto(format!("key_check: {}", e)))?;
        key.verify(&check)?;
        Ok(key)
    }

    /// True if `key` belongs to the account this marker describes.
    pub fn matches(&self, key: &CryptKey) -> bool {
        self.salt_bytes().map(|s| &s == key.salt()).unwrap_or(false)
            && hex::decode(&self.key_check)
                .ok()
                .map(|check| key.verify(&check).is_ok())
                .unwrap_or(false)
    }
}

/// Account-level crypto metadata: the single key descriptor of a credential
/// plus every folder encrypted under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCryptMeta {
    /// Salt and key verifier shared by every encrypted folder.
    #[serde(flatten)]
    pub marker: CryptMarker,
    /// Encrypted folders, normalized.
    #[serde(default)]
    pub folders: Vec<String>,
}

impl AccountCryptMeta {
    /// Metadata for a freshly generated account key with no folders yet.
    pub fn new(key: &CryptKey) -> TransferResult<Self> {
        Ok(Self {
            marker: CryptMarker::new(key)?,
            folders: Vec::new(),
        })
    }

    /// Parse stored account metadata.
    pub fn from_bytes(data: &[u8]) -> TransferResult<Self> {
        let meta: AccountCryptMeta = serde_json::from_slice(data)?;
        if meta.marker.version != MARKER_VERSION {
            return Err(TransferError::Crypto(format!(
                "unsupported account crypt metadata version {}",
                meta.marker.version
            )));
        }
        Ok(meta)
    }

    /// Serialized metadata.
    pub fn to_bytes(&self) -> TransferResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// A registered folder equal to, inside, or above `folder`.
    pub fn overlapping(&self, folder: &str) -> Option<&str> {
        self.folders
            .iter()
            .find(|existing| is_within(folder, existing) || is_within(existing, folder))
            .map(String::as_str)
    }

    /// Record `folder` as encrypted.
    pub fn register(&mut self, folder: &str) {
        if !self.folders.iter().any(|f| f == folder) {
            self.folders.push(folder.to_string());
        }
    }
}

/// Per-file crypto metadata the backend must round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCryptMeta {
    /// Account salt (hex).
    pub salt: String,
    /// Per-file IV (hex).
    pub iv: String,
    /// Zero bytes appended to reach a sector boundary.
    pub alignment_bytes: u64,
    /// Plaintext size.
    pub plain_size: u64,
    /// Sector size used when the file was written.
    pub sector_size: u64,
}

impl FileCryptMeta {
    /// Fresh metadata with a random IV for a plaintext of `plain_size` bytes.
    pub fn new(key: &CryptKey, plain_size: u64, sector_size: usize) -> Self {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let sector = sector_size as u64;
        Self {
            salt: hex::encode(key.salt()),
            iv: hex::encode(iv),
            alignment_bytes: padding_bytes(plain_size, sector),
            plain_size,
            sector_size: sector,
        }
    }

    /// Decoded IV.
    pub fn iv_bytes(&self) -> TransferResult<[u8; IV_LEN]> {
        decode_fixed(&self.iv, "iv")
    }

    /// On-wire size of the file.
    pub fn wire_size(&self) -> u64 {
        self.plain_size + self.alignment_bytes
    }

    /// Check that this metadata belongs to `key` and is self-consistent.
    pub fn check(&self, key: &CryptKey) -> TransferResult<()> {
        if self.salt != hex::encode(key.salt()) {
            return Err(TransferError::Crypto(
                "file was encrypted under a different account salt".to_string(),
            ));
        }
        if self.sector_size == 0 || self.sector_size % CIPHER_BLOCK_SIZE as u64 != 0 {
            return Err(TransferError::Crypto(format!(
                "invalid sector size {}",
                self.sector_size
            )));
        }
        if self.alignment_bytes != padding_bytes(self.plain_size, self.sector_size) {
            return Err(TransferError::Crypto(format!(
                "alignment {} inconsistent with plain size {}",
                self.alignment_bytes, self.plain_size
            )));
        }
        Ok(())
    }
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> TransferResult<[u8; N]> {
    let bytes = hex::decode(value).map_err(|e| TransferError::Crypto(format!("{}: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| TransferError::Crypto(format!("{}: expected {} bytes", what, N)))
}

/// Encrypts and decrypts whole sectors of one file.
pub struct SectorCipher {
    xts: Xts128<Aes256>,
    iv: u128,
    sector_size: usize,
}

impl std::fmt::Debug for SectorCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorCipher")
            .field("sector_size", &self.sector_size)
            .finish_non_exhaustive()
    }
}

impl SectorCipher {
    /// Cipher for the file described by `meta`.
    pub fn new(key: &CryptKey, meta: &FileCryptMeta) -> TransferResult<Self> {
        meta.check(key)?;
        Ok(Self {
            xts: key.xts()?,
            iv: u128::from_le_bytes(meta.iv_bytes()?),
            sector_size: meta.sector_size as usize,
        })
    }

    /// Sector size in bytes.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn tweak(&self, index: u64) -> [u8; 16] {
        self.iv.wrapping_add(index as u128).to_le_bytes()
    }

    /// Encrypt one full sector in place.
    pub fn encrypt_sector(&self, sector: &mut [u8], index: u64) {
        debug_assert_eq!(sector.len(), self.sector_size);
        self.xts.encrypt_sector(sector, self.tweak(index));
    }

    /// Decrypt one full sector in place.
    pub fn decrypt_sector(&self, sector: &mut [u8], index: u64) {
        debug_assert_eq!(sector.len(), self.sector_size);
        self.xts.decrypt_sector(sector, self.tweak(index));
    }

    /// Decrypt consecutive sectors in place, the first having index `first_index`.
    pub fn decrypt_sectors(&self, data: &mut [u8], first_index: u64) -> TransferResult<()> {
        if data.len() % self.sector_size != 0 {
            return Err(TransferError::LengthMismatch {
                declared: on_wire_size(data.len() as u64, self.sector_size as u64),
                actual: data.len() as u64,
            });
        }
        for (i, sector) in data.chunks_exact_mut(self.sector_size).enumerate() {
            self.decrypt_sector(sector, first_index + i as u64);
        }
        Ok(())
    }
}

/// Encrypt a whole plaintext in memory (used for small objects and tests).
pub fn encrypt_all(plain: &[u8], key: &CryptKey, meta: &FileCryptMeta) -> TransferResult<Vec<u8>> {
    let cipher = SectorCipher::new(key, meta)?;
    let mut out = plain.to_vec();
    out.resize(on_wire_size(plain.len() as u64, meta.sector_size) as usize, 0);
    for (i, sector) in out.chunks_exact_mut(cipher.sector_size()).enumerate() {
        cipher.encrypt_sector(sector, i as u64);
    }
    Ok(out)
}

/// Decrypt a whole ciphertext and drop the alignment padding.
pub fn decrypt_all(wire: &[u8], key: &CryptKey, meta: &FileCryptMeta) -> TransferResult<Vec<u8>> {
    if wire.len() as u64 != meta.wire_size() {
        return Err(TransferError::LengthMismatch {
            declared: meta.wire_size(),
            actual: wire.len() as u64,
        });
    }
    let cipher = SectorCipher::new(key, meta)?;
    let mut out = wire.to_vec();
    cipher.decrypt_sectors(&mut out, 0)?;
    out.truncate(meta.plain_size as usize);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> CryptKey {
        CryptKey::derive("correct horse", [7u8; SALT_LEN]).unwrap()
    }

    #[test]
    fn test_sector_math_examples() {
        assert_eq!(on_wire_size(0, 512), 0);
        assert_eq!(on_wire_size(1, 512), 512);
        assert_eq!(on_wire_size(512, 512), 512);
        assert_eq!(on_wire_size(513, 512), 1024);
        assert_eq!(padding_bytes(0, 512), 0);
        assert_eq!(padding_bytes(1, 512), 511);
        assert_eq!(padding_bytes(512, 512), 0);
        assert_eq!(padding_bytes(513, 512), 511);
    }

    #[test]
    fn test_derive_is_deterministic_and_salted() {
        let a = CryptKey::derive("pw", [1u8; SALT_LEN]).unwrap();
        let b = CryptKey::derive("pw", [1u8; SALT_LEN]).unwrap();
        let c = CryptKey::derive("pw", [2u8; SALT_LEN]).unwrap();
        assert_eq!(a.key_check().unwrap(), b.key_check().unwrap());
        assert_ne!(a.key_check().unwrap(), c.key_check().unwrap());
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(
            CryptKey::derive("", [0u8; SALT_LEN]),
            Err(TransferError::Crypto(_))
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        assert_eq!(format!("{:?}", test_key()), "CryptKey([REDACTED])");
    }

    #[test]
    fn test_marker_unlock() {
        let key = CryptKey::generate("secret").unwrap();
        let marker = CryptMarker::new(&key).unwrap();
        let parsed = CryptMarker::from_bytes(&marker.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, marker);

        let unlocked = parsed.unlock("secret").unwrap();
        assert_eq!(unlocked.salt(), key.salt());
        assert!(parsed.matches(&unlocked));

        assert!(matches!(parsed.unlock("wrong"), Err(TransferError::Crypto(_))));
        assert!(!parsed.matches(&test_key()));
    }

    #[test]
    fn test_marker_rejects_unknown_version() {
        let data = br#"{"version":9,"salt":"00","key_check":"00"}"#;
        assert!(matches!(
            CryptMarker::from_bytes(data),
            Err(TransferError::Crypto(_))
        ));
    }

    #[test]
    fn test_account_meta_keeps_marker_fields() {
        let key = CryptKey::generate("secret").unwrap();
        let mut account = AccountCryptMeta::new(&key).unwrap();
        account.register("/vault1");
        account.register("/vault1");
        account.register("/vault2");
        assert_eq!(account.folders, vec!["/vault1", "/vault2"]);

        let bytes = account.to_bytes().unwrap();
        let parsed = AccountCryptMeta::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, account);
        // The flattened marker fields sit at the top level.
        assert_eq!(CryptMarker::from_bytes(&bytes).unwrap(), account.marker);
        assert!(parsed.marker.matches(&parsed.marker.unlock("secret").unwrap()));
    }

    #[test]
    fn test_account_meta_overlap() {
        let mut account = AccountCryptMeta::new(&test_key()).unwrap();
        account.register("/a/b");
        assert_eq!(account.overlapping("/a/b"), Some("/a/b"));
        assert_eq!(account.overlapping("/a/b/c"), Some("/a/b"));
        assert_eq!(account.overlapping("/a"), Some("/a/b"));
        assert_eq!(account.overlapping("/"), Some("/a/b"));
        assert_eq!(account.overlapping("/a/bc"), None);
        assert_eq!(account.overlapping("/x"), None);
    }

    #[test]
    fn test_account_meta_rejects_unknown_version() {
        let data = br#"{"version":2,"salt":"00","key_check":"00","folders":[]}"#;
        assert!(matches!(
            AccountCryptMeta::from_bytes(data),
            Err(TransferError::Crypto(_))
        ));
    }

    #[test]
    fn test_file_meta_alignment() {
        let key = test_key();
        let meta = FileCryptMeta::new(&key, 1000, 512);
        assert_eq!(meta.alignment_bytes, 24);
        assert_eq!(meta.wire_size(), 1024);
        assert!(meta.check(&key).is_ok());

        let other = CryptKey::derive("correct horse", [8u8; SALT_LEN]).unwrap();
        assert!(meta.check(&other).is_err());
    }

    #[test]
    fn test_each_file_gets_own_iv() {
        let key = test_key();
        let a = FileCryptMeta::new(&key, 512, 512);
        let b = FileCryptMeta::new(&key, 512, 512);
        assert_ne!(a.iv, b.iv);
        let plain = vec![0x41u8; 512];
        assert_ne!(
            encrypt_all(&plain, &key, &a).unwrap(),
            encrypt_all(&plain, &key, &b).unwrap()
        );
    }

    #[test]
    fn test_identical_sectors_encrypt_differently() {
        let key = test_key();
        let meta = FileCryptMeta::new(&key, 1024, 512);
        let wire = encrypt_all(&[0u8; 1024], &key, &meta).unwrap();
        assert_ne!(wire[..512], wire[512..]);
    }

    #[test]
    fn test_decrypt_rejects_wrong_length() {
        let key = test_key();
        let meta = FileCryptMeta::new(&key, 100, 512);
        assert!(matches!(
            decrypt_all(&[0u8; 100], &key, &meta),
            Err(TransferError::LengthMismatch { declared: 512, actual: 100 })
        ));
    }

    proptest! {
        #[test]
        fn prop_wire_size_and_padding(size in 0u64..10_000_000, shift in 4u32..13) {
            let sector = 1u64 << shift;
            let wire = on_wire_size(size, sector);
            prop_assert_eq!(wire % sector, 0);
            prop_assert!(wire >= size && wire - size < sector);
            prop_assert_eq!(wire - size, padding_bytes(size, sector));
            prop_assert_eq!(padding_bytes(size, sector), (sector - size % sector) % sector);
        }

        #[test]
        fn prop_encrypt_decrypt_roundtrip(data in prop::collection::vec(any::<u8>(), 0..8192)) {
            let key = test_key();
            let meta = FileCryptMeta::new(&key, data.len() as u64, 512);
            let wire = encrypt_all(&data, &key, &meta).unwrap();
            prop_assert_eq!(wire.len() as u64, meta.wire_size());
            let plain = decrypt_all(&wire, &key, &meta).unwrap();
            prop_assert_eq!(plain, data);
        }
    }
}
