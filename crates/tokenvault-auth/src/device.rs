//! Device descriptors parsed from client-supplied strings.
//!
//! A [`DeviceDescriptor`] is attached to a session at creation time and
//! compared against the descriptor presented on later validations to detect
//! session reuse from a different machine.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Coarse device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
    Bot,
    Unknown,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
            Self::Bot => "bot",
            Self::Unknown => "unknown",
        }
    }
}

/// Parsed device information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Raw client-supplied device string (usually the User-Agent).
    pub user_agent: String,
    pub device_class: DeviceClass,
    pub browser: String,
    pub os: String,
    /// Persistent device identifier supplied by the client app, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub device_family: String,
    pub is_bot: bool,
}

/// A single signal that differs between two descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChange {
    OsFamily,
    DeviceClass,
    BotFlag,
}

/// Result of comparing a session's device with a presented one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceComparison {
    /// Same fingerprint.
    Identical,
    /// Different details but the same persistent device id.
    TrustedDevice,
    /// Cosmetic differences only (browser or version labels).
    Changed,
    /// The platform itself changed.
    Suspicious(Vec<DeviceChange>),
}

impl DeviceComparison {
    /// Returns `true` if the change should end the session.
    pub fn is_suspicious(&self) -> bool {
        matches!(self, Self::Suspicious(_))
    }

    /// Returns `true` if anything at all differs and the device is not trusted.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Changed | Self::Suspicious(_))
    }
}

impl DeviceDescriptor {
    /// Parses a device descriptor from a User-Agent string.
    pub fn parse(user_agent: &str) -> Self {
        let is_bot = detect_bot(user_agent);
        let device_class = if is_bot {
            DeviceClass::Bot
        } else {
            detect_device_class(user_agent)
        };

        Self {
            user_agent: user_agent.to_string(),
            device_class,
            browser: detect_browser(user_agent),
            os: detect_os(user_agent),
            device_id: None,
            device_family: detect_device_family(user_agent, is_bot),
            is_bot,
        }
    }

    /// Attaches a persistent device id.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Operating system family, ignoring versions ("Windows 10" -> "windows").
    pub fn os_family(&self) -> &'static str {
        let os = self.os.to_lowercase();
        if os.starts_with("windows") {
            "windows"
        } else if os == "macos" {
            "macos"
        } else if os == "ios" || os == "ipados" {
            "ios"
        } else if os == "android" {
            "android"
        } else if os == "chrome os" {
            "chromeos"
        } else if os == "linux" {
            "linux"
        } else {
            "other"
        }
    }

    /// Human-readable name like "Chrome on macOS".
    pub fn display_name(&self) -> String {
        format!("{} on {}", self.browser, self.os)
    }

    /// Stable SHA-256 hash over every descriptor field.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.user_agent.as_str(),
            self.device_class.as_str(),
            self.browser.as_str(),
            self.os.as_str(),
            self.device_id.as_deref().unwrap_or(""),
            self.device_family.as_str(),
            if self.is_bot { "bot" } else { "human" },
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Compares this (the session's) descriptor against a presented one.
    ///
    /// A shared persistent device id always wins. Otherwise any change of OS
    /// family, device class or bot flag is suspicious.
    pub fn compare(&self, presented: &DeviceDescriptor) -> DeviceComparison {
        if let (Some(known), Some(seen)) = (&self.device_id, &presented.device_id)
            && known == seen
        {
            return DeviceComparison::TrustedDevice;
        }

        if self.fingerprint() == presented.fingerprint() {
            return DeviceComparison::Identical;
        }

        let mut changes = Vec::new();
        if self.os_family() != presented.os_family() {
            changes.push(DeviceChange::OsFamily);
        }
        if self.device_class != presented.device_class {
            changes.push(DeviceChange::DeviceClass);
        }
        if self.is_bot != presented.is_bot {
            changes.push(DeviceChange::BotFlag);
        }

        if changes.is_empty() {
            DeviceComparison::Changed
        } else {
            DeviceComparison::Suspicious(changes)
        }
    }
}

/// Extract User-Agent header value from HTTP headers
pub fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

/// Extract the client IP from proxy headers.
pub fn extract_ip_address(headers: &HeaderMap) -> Option<String> {
    // X-Forwarded-For: "client, proxy1, proxy2"
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(client_ip) = value.split(',').next()
        && !client_ip.trim().is_empty()
    {
        return Some(client_ip.trim().to_string());
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return Some(value.trim().to_string());
    }

    None
}

const BOT_MARKERS: [&str; 9] = [
    "bot",
    "crawler",
    "spider",
    "slurp",
    "curl/",
    "wget/",
    "python-requests",
    "headlesschrome",
    "httpclient",
];

fn detect_bot(ua: &str) -> bool {
    let ua_lower = ua.to_lowercase();
    BOT_MARKERS.iter().any(|marker| ua_lower.contains(marker))
}

/// Order matters: Edge contains Chrome, Chrome contains Safari.
fn detect_browser(ua: &str) -> String {
    let ua_lower = ua.to_lowercase();

    let browser = if ua_lower.contains("edg/") || ua_lower.contains("edge/") {
        "Edge"
    } else if ua_lower.contains("opr/") || ua_lower.contains("opera") {
        "Opera"
    } else if ua_lower.contains("firefox/") || ua_lower.contains("fxios/") {
        "Firefox"
    } else if ua_lower.contains("chrome/") || ua_lower.contains("crios/") {
        "Chrome"
    } else if ua_lower.contains("safari/") {
        "Safari"
    } else if ua_lower.contains("msie") || ua_lower.contains("trident/") {
        "Internet Explorer"
    } else {
        "Unknown Browser"
    };
    browser.to_string()
}

/// iOS user agents also say "like Mac OS X", so they are checked first.
fn detect_os(ua: &str) -> String {
    let ua_lower = ua.to_lowercase();

    let os = if ua_lower.contains("iphone") || ua_lower.contains("ipod") {
        "iOS"
    } else if ua_lower.contains("ipad") {
        "iPadOS"
    } else if ua_lower.contains("windows nt 10") {
        "Windows 10"
    } else if ua_lower.contains("windows") {
        "Windows"
    } else if ua_lower.contains("android") {
        "Android"
    } else if ua_lower.contains("cros") {
        "Chrome OS"
    } else if ua_lower.contains("mac os x") || ua_lower.contains("macintosh") {
        "macOS"
    } else if ua_lower.contains("linux") {
        "Linux"
    } else {
        "Unknown OS"
    };
    os.to_string()
}

fn detect_device_class(ua: &str) -> DeviceClass {
    let ua_lower = ua.to_lowercase();

    if ua_lower.contains("ipad") || ua_lower.contains("tablet") {
        DeviceClass::Tablet
    } else if ua_lower.contains("android") && !ua_lower.contains("mobile") {
        // Android tablets omit the "Mobile" token.
        DeviceClass::Tablet
    } else if ua_lower.contains("mobile") || ua_lower.contains("iphone") {
        DeviceClass::Mobile
    } else if ua_lower.contains("windows")
        || ua_lower.contains("macintosh")
        || ua_lower.contains("linux")
        || ua_lower.contains("cros")
    {
        DeviceClass::Desktop
    } else {
        DeviceClass::Unknown
    }
}

fn detect_device_family(ua: &str, is_bot: bool) -> String {
    if is_bot {
        return "Spider".to_string();
    }
    let ua_lower = ua.to_lowercase();

    let family = if ua_lower.contains("iphone") {
        "iPhone"
    } else if ua_lower.contains("ipad") {
        "iPad"
    } else if ua_lower.contains("android") {
        "Android"
    } else if ua_lower.contains("macintosh") {
        "Mac"
    } else if ua_lower.contains("windows") || ua_lower.contains("linux") || ua_lower.contains("cros") {
        "PC"
    } else {
        "Other"
    };
    family.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const FIREFOX_MAC: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const EDGE_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 13; SM-X700) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const GOOGLEBOT: &str =
        "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    #[test]
    fn test_parse_chrome_mac() {
        let device = DeviceDescriptor::parse(CHROME_MAC);
        assert_eq!(device.browser, "Chrome");
        assert_eq!(device.os, "macOS");
        assert_eq!(device.device_class, DeviceClass::Desktop);
        assert_eq!(device.device_family, "Mac");
        assert!(!device.is_bot);
        assert_eq!(device.display_name(), "Chrome on macOS");
    }

    #[test]
    fn test_parse_iphone_is_not_macos() {
        let device = DeviceDescriptor::parse(SAFARI_IPHONE);
        assert_eq!(device.browser, "Safari");
        assert_eq!(device.os, "iOS");
        assert_eq!(device.os_family(), "ios");
        assert_eq!(device.device_class, DeviceClass::Mobile);
        assert_eq!(device.device_family, "iPhone");
    }

    #[test]
    fn test_parse_edge_windows() {
        let device = DeviceDescriptor::parse(EDGE_WINDOWS);
        assert_eq!(device.browser, "Edge");
        assert_eq!(device.os, "Windows 10");
        assert_eq!(device.os_family(), "windows");
    }

    #[test]
    fn test_parse_android_tablet() {
        let device = DeviceDescriptor::parse(ANDROID_TABLET);
        assert_eq!(device.os, "Android");
        assert_eq!(device.device_class, DeviceClass::Tablet);
    }

    #[test]
    fn test_parse_bot() {
        let device = DeviceDescriptor::parse(GOOGLEBOT);
        assert!(device.is_bot);
        assert_eq!(device.device_class, DeviceClass::Bot);
        assert_eq!(device.device_family, "Spider");
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = DeviceDescriptor::parse(CHROME_MAC);
        let b = DeviceDescriptor::parse(CHROME_MAC);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let with_id = b.with_device_id("dev-1");
        assert_ne!(a.fingerprint(), with_id.fingerprint());
    }

    #[test]
    fn test_compare_identical() {
        let a = DeviceDescriptor::parse(CHROME_MAC);
        assert_eq!(a.compare(&a.clone()), DeviceComparison::Identical);
    }

    #[test]
    fn test_compare_same_device_id_is_trusted() {
        let session_device = DeviceDescriptor::parse(CHROME_MAC).with_device_id("A");
        let presented = DeviceDescriptor::parse(FIREFOX_MAC).with_device_id("A");

        let result = session_device.compare(&presented);
        assert_eq!(result, DeviceComparison::TrustedDevice);
        assert!(!result.is_suspicious());
        assert!(!result.is_mismatch());
    }

    #[test]
    fn test_compare_browser_change_is_not_suspicious() {
        let session_device = DeviceDescriptor::parse(CHROME_MAC);
        let presented = DeviceDescriptor::parse(FIREFOX_MAC);

        let result = session_device.compare(&presented);
        assert_eq!(result, DeviceComparison::Changed);
        assert!(result.is_mismatch());
        assert!(!result.is_suspicious());
    }

    #[test]
    fn test_compare_platform_change_is_suspicious() {
        let session_device = DeviceDescriptor::parse(CHROME_MAC).with_device_id("A");
        let presented = DeviceDescriptor::parse(SAFARI_IPHONE).with_device_id("B");

        match session_device.compare(&presented) {
            DeviceComparison::Suspicious(changes) => {
                assert!(changes.contains(&DeviceChange::OsFamily));
                assert!(changes.contains(&DeviceChange::DeviceClass));
                assert!(!changes.contains(&DeviceChange::BotFlag));
            }
            other => panic!("expected suspicious, got {other:?}"),
        }
    }

    #[test]
    fn test_compare_bot_flag_change_is_suspicious() {
        let session_device = DeviceDescriptor::parse(CHROME_MAC);
        let presented = DeviceDescriptor::parse(GOOGLEBOT);
        assert!(session_device.compare(&presented).is_suspicious());
    }

    #[test]
    fn test_json_roundtrip() {
        let device = DeviceDescriptor::parse(SAFARI_IPHONE).with_device_id("dev-9");
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["deviceClass"], "mobile");
        assert!(value.get("fingerprint").is_none());

        let back: DeviceDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, device);
    }

    #[test]
    fn test_extract_ip_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(extract_ip_address(&headers), Some("203.0.113.7".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(extract_ip_address(&headers), Some("198.51.100.2".to_string()));

        assert_eq!(extract_ip_address(&HeaderMap::new()), None);
    }

    #[test]
    fn test_extract_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", CHROME_MAC.parse().unwrap());
        assert_eq!(extract_user_agent(&headers).as_deref(), Some(CHROME_MAC));
    }
}
