use crate::{
    base64::Base64,
    key_pair::{KeyAlgorithm, KeyPair},
};
use openssl::{ecdsa::EcdsaSig, hash::MessageDigest, sign::Signer};
use std::error::Error;

/// 定義簽名操作可能遇到的錯誤類型。
#[derive(Debug)]
pub enum SignatureError {
    /// 簽名過程中發生錯誤，附帶錯誤訊息。
    SigningError(String),
    /// 序列化過程中發生錯誤，附帶 `serde_json` 的錯誤。
    SerializationError(serde_json::Error),
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignatureError::SigningError(msg) => write!(f, "Signing error: {}", msg),
            SignatureError::SerializationError(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl From<serde_json::Error> for SignatureError {
    fn from(e: serde_json::Error) -> Self {
        SignatureError::SerializationError(e)
    }
}

impl From<openssl::error::ErrorStack> for SignatureError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SignatureError::SigningError(e.to_string())
    }
}

impl Error for SignatureError {}

/// 定義簽名演算法的介面。
trait SignatureAlgorithmT {
    /// 使用指定的金鑰對資料進行簽名，回傳 JWS 所需的原始簽章位元組。
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>, SignatureError>;
}

/// RSA PKCS#1 v1.5 + SHA-256。
struct RSASignature;

impl SignatureAlgorithmT for RSASignature {
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>, SignatureError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &key_pair.pri_key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }
}

/// ECDSA；OpenSSL 產生 DER 編碼，JWS 需要固定長度的 `r || s`。
struct ECDSASignature {
    digest: MessageDigest,
    size: usize,
}

impl SignatureAlgorithmT for ECDSASignature {
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>, SignatureError> {
        let mut signer = Signer::new(self.digest, &key_pair.pri_key)?;
        signer.update(data)?;
        let der = signer.sign_to_vec()?;

        let sig = EcdsaSig::from_der(&der)?;
        let size = self.size as i32;
        let mut raw = sig.r().to_vec_padded(size)?;
        raw.extend(sig.s().to_vec_padded(size)?);
        Ok(raw)
    }
}

/// 簽名演算法工廠，用於根據金鑰演算法取得對應的簽名演算法實作。
struct SignatureAlgorithmFactory;

impl SignatureAlgorithmFactory {
    fn get_algorithm(alg: KeyAlgorithm) -> Box<dyn SignatureAlgorithmT> {
        match alg {
            KeyAlgorithm::Rs256 => Box::new(RSASignature),
            KeyAlgorithm::Es256 => Box::new(ECDSASignature {
                digest: MessageDigest::sha256(),
                size: alg.coordinate_size(),
            }),
            KeyAlgorithm::Es384 => Box::new(ECDSASignature {
                digest: MessageDigest::sha384(),
                size: alg.coordinate_size(),
            }),
            KeyAlgorithm::Es512 => Box::new(ECDSASignature {
                digest: MessageDigest::sha512(),
                size: alg.coordinate_size(),
            }),
        }
    }
}

/// 根據提供的 header、payload 與金鑰對，生成對應的簽名。
///
/// 簽名輸入為 `BASE64URL(header) || '.' || BASE64URL(payload)`。
pub fn create_signature(
    header_b64: &Base64,
    payload_b64: &Base64,
    key_pair: &KeyPair,
) -> Result<Base64, SignatureError> {
    let signing_input = format!("{}.{}", header_b64.base64_url(), payload_b64.base64_url());
    let algorithm = SignatureAlgorithmFactory::get_algorithm(key_pair.alg);

    let signature = algorithm.sign(signing_input.as_bytes(), key_pair)?;

    Ok(Base64::new(&signature))
}
