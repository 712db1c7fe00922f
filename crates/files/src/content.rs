use sha2::{Digest, Sha256};
use vault_uuid::Sha256Hash;

/// SHA-256 of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    Sha256Hash::from_bytes(&digest)
}

/// Best-effort media type detection from magic bytes.
///
/// Returns `None` for content without a recognisable signature (plain text, for example).
/// The result is advisory and must not be treated as authoritative.
pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    infer::get(bytes).map(|kind| kind.mime_type())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_digest(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sniff_png_and_pdf() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(sniff_media_type(&png), Some("image/png"));
        assert_eq!(sniff_media_type(b"%PDF-1.7\n"), Some("application/pdf"));
        assert_eq!(sniff_media_type(b"plain words"), None);
    }
}
