use openssl::bn::{BigNum, BigNumContext};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    base64::Base64,
    key_pair::{KeyAlgorithm, KeyPair},
};

/// JWK相關操作的錯誤類型。
#[derive(Debug, Error)]
pub enum JwkError {
    /// 金鑰轉換失敗。
    #[error("Failed to convert key: {0}")]
    KeyConversionError(String),
    /// 序列化錯誤。
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<openssl::error::ErrorStack> for JwkError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        JwkError::KeyConversionError(e.to_string())
    }
}

/// JSON Web Key (JWK) 的封裝，支援 RSA 與 EC 公鑰。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// RSA 格式的 JWK。
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    /// EC 格式的 JWK。
    #[serde(rename = "EC")]
    Ec(EcJwk),
}

/// RSA 格式的 JWK 結構，包含必要的公開參數。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaJwk {
    n: String,
    e: String,
}

/// EC 格式的 JWK 結構，座標依曲線長度補零。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcJwk {
    crv: String,
    x: String,
    y: String,
}

impl Jwk {
    /// 根據給定的金鑰對建立對應的 JWK。
    pub fn new(key_pair: &KeyPair) -> Result<Self, JwkError> {
        match key_pair.alg {
            KeyAlgorithm::Rs256 => {
                let rsa = key_pair.pri_key.rsa()?;
                Ok(Jwk::Rsa(RsaJwk {
                    n: Base64::new(rsa.n().to_vec()).base64_url(),
                    e: Base64::new(rsa.e().to_vec()).base64_url(),
                }))
            }
            alg => {
                let ec = key_pair.pri_key.ec_key()?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates(ec.group(), &mut x, &mut y, &mut ctx)?;
                let size = alg.coordinate_size() as i32;
                let crv = alg
                    .curve_name()
                    .ok_or_else(|| JwkError::KeyConversionError(alg.to_string()))?;
                Ok(Jwk::Ec(EcJwk {
                    crv: crv.to_string(),
                    x: Base64::new(x.to_vec_padded(size)?).base64_url(),
                    y: Base64::new(y.to_vec_padded(size)?).base64_url(),
                }))
            }
        }
    }

    /// 僅含必要欄位、依字典序排列的 JSON 物件，供縮影計算與 JWS 標頭使用。
    pub fn to_acme_value(&self) -> Value {
        let mut map = Map::new();
        match self {
            Jwk::Rsa(jwk) => {
                map.insert("e".to_string(), Value::String(jwk.e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(jwk.n.clone()));
            }
            Jwk::Ec(jwk) => {
                map.insert("crv".to_string(), Value::String(jwk.crv.clone()));
                map.insert("kty".to_string(), Value::String("EC".to_string()));
                map.insert("x".to_string(), Value::String(jwk.x.clone()));
                map.insert("y".to_string(), Value::String(jwk.y.clone()));
            }
        }
        Value::Object(map)
    }

    /// 將 JWK 轉換為符合 ACME 協議要求的 JSON 字串。
    pub fn to_acme_json(&self) -> Result<String, JwkError> {
        serde_json::to_string(&self.to_acme_value()).map_err(JwkError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ec_jwk_members_are_ordered() -> Result<(), Box<dyn std::error::Error>> {
        let key = KeyPair::generate(KeyAlgorithm::Es256)?;
        let json = Jwk::new(&key)?.to_acme_json()?;
        let crv = json.find("\"crv\"").unwrap();
        let kty = json.find("\"kty\"").unwrap();
        let x = json.find("\"x\"").unwrap();
        assert!(crv < kty && kty < x);
        assert!(json.contains("\"P-256\""));
        Ok(())
    }

    #[test]
    fn test_p521_coordinates_are_padded() -> Result<(), Box<dyn std::error::Error>> {
        let key = KeyPair::generate(KeyAlgorithm::Es512)?;
        match Jwk::new(&key)? {
            Jwk::Ec(jwk) => {
                assert_eq!(Base64::from_url(&jwk.x)?.decode()?.len(), 66);
                assert_eq!(Base64::from_url(&jwk.y)?.decode()?.len(), 66);
            }
            Jwk::Rsa(_) => panic!("預期 EC JWK"),
        }
        Ok(())
    }
}
