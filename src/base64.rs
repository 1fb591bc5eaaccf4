use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use thiserror::Error;

/// 錯誤類型，用於描述 Base64 解碼過程中的錯誤情形。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// 當遇到無效字符時返回此錯誤，包含該無效字符的 ASCII 值。
    #[error("Invalid character: {0}")]
    InvalidCharacter(u8),

    /// 當 Base64 字符串的填充（`=`）不符合規範時返回此錯誤。
    #[error("Invalid padding")]
    InvalidPadding,

    /// 當 Base64 字符串的長度不符合要求時返回此錯誤。
    #[error("Invalid length")]
    InvalidLength,
}

impl From<base64::DecodeError> for DecodeError {
    fn from(e: base64::DecodeError) -> Self {
        match e {
            base64::DecodeError::InvalidByte(_, c) => DecodeError::InvalidCharacter(c),
            base64::DecodeError::InvalidLastSymbol(_, c) => DecodeError::InvalidCharacter(c),
            base64::DecodeError::InvalidPadding => DecodeError::InvalidPadding,
            base64::DecodeError::InvalidLength(_) => DecodeError::InvalidLength,
        }
    }
}

/// 已編碼的 Base64 資料，內部保存標準格式，需要時轉為 URL 安全格式。
///
/// ACME 的 JWS 各部分皆使用無填充的 URL 安全格式，見 [`Base64::base64_url`]。
///
/// # 示例
///
/// ```
/// use certfleet::base64::Base64;
///
/// let b64 = Base64::new("Hello, World!");
/// assert_eq!(b64.as_str(), "SGVsbG8sIFdvcmxkIQ==");
/// assert_eq!(b64.base64_url(), "SGVsbG8sIFdvcmxkIQ");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64 {
    encoded: String,
}

impl Base64 {
    /// 根據輸入數據生成 Base64 編碼。
    pub fn new<T: AsRef<[u8]>>(input: T) -> Self {
        Self {
            encoded: STANDARD.encode(input.as_ref()),
        }
    }

    /// 根據已編碼的標準 Base64 字符串生成實例，並驗證其格式。
    ///
    /// # 錯誤
    ///
    /// 長度不是 4 的倍數時返回 [`DecodeError::InvalidLength`]；內容無法解碼時返回
    /// [`DecodeError::InvalidCharacter`] 或 [`DecodeError::InvalidPadding`]。
    pub fn from_encoded(encoded: &str) -> Result<Self, DecodeError> {
        if encoded.len() % 4 != 0 {
            return Err(DecodeError::InvalidLength);
        }
        STANDARD.decode(encoded)?;
        Ok(Self {
            encoded: encoded.to_string(),
        })
    }

    /// 從 URL 安全格式（無填充）的字符串生成實例。
    ///
    /// 結尾多餘的 `=` 會被忽略。
    ///
    /// # 錯誤
    ///
    /// 含有 URL 安全字母表以外的字符時返回 [`DecodeError::InvalidCharacter`]。
    pub fn from_url(url_encoded: &str) -> Result<Self, DecodeError> {
        let bytes = URL_SAFE_NO_PAD.decode(url_encoded.trim_end_matches('='))?;
        Ok(Self::new(bytes))
    }

    /// 解碼為原始二進制數據。
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(STANDARD.decode(&self.encoded)?)
    }

    /// 轉換為 URL 安全、無填充的字符串。
    pub fn base64_url(&self) -> String {
        self.encoded
            .replace('+', "-")
            .replace('/', "_")
            .replace('=', "")
    }

    /// 返回內部存儲的標準 Base64 編碼字符串。
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}
