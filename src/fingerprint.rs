//! Device fingerprints derived from the `User-Agent` header.
//!
//! A fingerprint is `base64url(tag ++ divider ++ attributes_json)`, where `tag` is
//! an HMAC-SHA256 over the attribute JSON keyed with the server secret. The same
//! browser on the same device always produces the same id, and an id that was not
//! minted with the current secret decodes to `None`.
//!
//! Fingerprints are tamper evident, not confidential: anyone can base64-decode one
//! and read the parsed attributes.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use utoipa::ToSchema;
use woothee::parser::Parser;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_DIVIDER: &str = ".";

// base64url of a 32 byte HMAC-SHA256 tag
const TAG_LEN: usize = 43;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Other,
}

impl DeviceClass {
    fn from_category(category: &str) -> Self {
        match category {
            "smartphone" | "mobilephone" => Self::Mobile,
            "appliance" | "crawler" => Self::Other,
            // woothee reports "pc", "misc" or "UNKNOWN"; an unknown device counts as desktop
            _ => Self::Desktop,
        }
    }
}

/// Structured attributes parsed from a `User-Agent` header.
///
/// The browser version is left out on purpose so a browser update does not turn
/// a known device into a new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeviceAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub device: DeviceClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

impl DeviceAttributes {
    /// Parse a raw `User-Agent` value. Returns `None` for an empty header.
    #[must_use]
    pub fn parse(user_agent: &str) -> Option<Self> {
        let user_agent = user_agent.trim();
        if user_agent.is_empty() {
            return None;
        }

        let parser = Parser::new();
        let Some(result) = parser.parse(user_agent) else {
            return Some(Self {
                browser: None,
                engine: None,
                os: None,
                device: DeviceClass::Desktop,
                vendor: None,
            });
        };

        let browser = known(result.name);
        let os = match (known(result.os), known(&*result.os_version)) {
            (Some(name), Some(version)) => Some(format!("{name} v-{version}")),
            (name, _) => name,
        };

        Some(Self {
            engine: browser.as_deref().and_then(engine_for),
            browser,
            os,
            device: DeviceClass::from_category(result.category),
            vendor: known(result.vendor),
        })
    }

    #[must_use]
    pub fn is_mobile(&self) -> bool {
        self.device == DeviceClass::Mobile
    }
}

fn known(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("unknown") {
        None
    } else {
        Some(value.to_string())
    }
}

fn engine_for(browser: &str) -> Option<String> {
    let engine = match browser {
        "Chrome" | "Edge" | "Opera" | "Vivaldi" | "Yandex Browser" | "SamsungBrowser" => "Blink",
        "Firefox" => "Gecko",
        "Safari" | "Webview" => "WebKit",
        "Internet Explorer" => "Trident",
        _ => return None,
    };
    Some(engine.to_string())
}

/// Encodes and verifies device fingerprints with a server secret.
#[derive(Clone, Debug)]
pub struct FingerprintEncoder {
    secret: SecretString,
    divider: String,
}

impl FingerprintEncoder {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            divider: DEFAULT_DIVIDER.to_string(),
        }
    }

    #[must_use]
    pub fn with_divider(mut self, divider: String) -> Self {
        if !divider.is_empty() {
            self.divider = divider;
        }
        self
    }

    /// Derive the fingerprint for a `User-Agent` value.
    ///
    /// Returns `None` when the header is empty so headerless clients never share a
    /// fingerprint. Callers must reject the request in that case.
    #[must_use]
    pub fn encode(&self, user_agent: &str) -> Option<String> {
        let attributes = DeviceAttributes::parse(user_agent)?;
        self.encode_attributes(&attributes)
    }

    #[must_use]
    pub fn encode_attributes(&self, attributes: &DeviceAttributes) -> Option<String> {
        let json = serde_json::to_string(attributes).ok()?;
        let tag = self.tag(json.as_bytes())?;

        let mut payload = URL_SAFE_NO_PAD.encode(tag);
        payload.push_str(&self.divider);
        payload.push_str(&json);

        Some(URL_SAFE_NO_PAD.encode(payload))
    }

    /// Recover the attributes of a fingerprint, or `None` if it was not produced
    /// with this encoder's secret and divider. Never panics on hostile input.
    #[must_use]
    pub fn decode(&self, fingerprint: &str) -> Option<DeviceAttributes> {
        let bytes = URL_SAFE_NO_PAD.decode(fingerprint.trim()).ok()?;
        let payload = String::from_utf8(bytes).ok()?;

        let tag = payload.get(..TAG_LEN)?;
        let json = payload.get(TAG_LEN..)?.strip_prefix(self.divider.as_str())?;

        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()).ok()?;
        mac.update(json.as_bytes());
        mac.verify_slice(&tag).ok()?;

        serde_json::from_str(json).ok()
    }

    fn tag(&self, message: &[u8]) -> Option<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()).ok()?;
        mac.update(message);
        Some(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
    const CHROME_WINDOWS_NEWER: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

    fn encoder() -> FingerprintEncoder {
        FingerprintEncoder::new(SecretString::from("fingerprint-secret"))
    }

    #[test]
    fn encode_is_deterministic() {
        let encoder = encoder();
        let first = encoder.encode(CHROME_WINDOWS);
        let second = encoder.encode(CHROME_WINDOWS);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn decode_returns_parsed_attributes() {
        let encoder = encoder();
        let id = encoder.encode(FIREFOX_LINUX);
        let decoded = id.as_deref().and_then(|id| encoder.decode(id));
        assert_eq!(decoded, DeviceAttributes::parse(FIREFOX_LINUX));
    }

    #[test]
    fn browser_update_keeps_fingerprint() {
        let encoder = encoder();
        assert_eq!(
            encoder.encode(CHROME_WINDOWS),
            encoder.encode(CHROME_WINDOWS_NEWER)
        );
    }

    #[test]
    fn different_browsers_get_different_fingerprints() {
        let encoder = encoder();
        assert_ne!(encoder.encode(CHROME_WINDOWS), encoder.encode(FIREFOX_LINUX));
    }

    #[test]
    fn empty_user_agent_has_no_identity() {
        let encoder = encoder();
        assert!(encoder.encode("").is_none());
        assert!(encoder.encode("   ").is_none());
    }

    #[test]
    fn iphone_is_mobile() {
        let attributes = DeviceAttributes::parse(SAFARI_IPHONE);
        assert!(attributes.is_some_and(|attributes| attributes.is_mobile()));
        let attributes = DeviceAttributes::parse(CHROME_WINDOWS);
        assert!(attributes.is_some_and(|attributes| !attributes.is_mobile()));
    }

    #[test]
    fn other_secret_rejects_fingerprint() {
        let id = encoder().encode(CHROME_WINDOWS).unwrap_or_default();
        let other = FingerprintEncoder::new(SecretString::from("rotated-secret"));
        assert!(other.decode(&id).is_none());
    }

    #[test]
    fn other_divider_rejects_fingerprint() {
        let id = encoder().encode(CHROME_WINDOWS).unwrap_or_default();
        let other = encoder().with_divider("|".to_string());
        assert!(other.decode(&id).is_none());
    }

    #[test]
    fn any_mutation_is_rejected() {
        let encoder = encoder();
        let id = encoder.encode(SAFARI_IPHONE).unwrap_or_default();
        assert!(encoder.decode(&id).is_some());

        for index in 0..id.len() {
            let original = id.as_bytes()[index];
            let replacement = if original == b'A' { b'B' } else { b'A' };
            let mut mutated = id.clone().into_bytes();
            mutated[index] = replacement;
            let mutated = String::from_utf8(mutated).unwrap_or_default();
            assert!(
                encoder.decode(&mutated).is_none(),
                "mutation at byte {index} was accepted"
            );
        }
    }

    #[test]
    fn garbage_is_rejected() {
        let encoder = encoder();
        assert!(encoder.decode("").is_none());
        assert!(encoder.decode("not base64 at all!").is_none());
        assert!(encoder.decode("c2hvcnQ").is_none());
    }
}
