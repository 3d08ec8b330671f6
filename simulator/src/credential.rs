//! IoT Hub device connection strings and SAS tokens.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, PartialEq, Eq)]
enum Auth {
    /// Base64 symmetric key; tokens are signed locally.
    SharedAccessKey(String),
    /// Pre-issued token, passed through unchanged.
    SharedAccessSignature(String),
}

/// Parsed `HostName=…;DeviceId=…;SharedAccessKey=…` device connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    auth: Auth,
}

impl FromStr for ConnectionString {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut auth = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or("malformed segment, expected KEY=VALUE")?;
            match key.trim() {
                "HostName" => host_name = Some(value.trim().to_string()),
                "DeviceId" => device_id = Some(value.trim().to_string()),
                "SharedAccessKey" => {
                    BASE64_STANDARD
                        .decode(value.trim())
                        .map_err(|e| format!("SharedAccessKey is not valid base64: {}", e))?;
                    auth = Some(Auth::SharedAccessKey(value.trim().to_string()));
                }
                "SharedAccessSignature" => {
                    auth = Some(Auth::SharedAccessSignature(value.trim().to_string()))
                }
                // GatewayHostName, ModuleId and friends are not used by device links
                _ => {}
            }
        }

        let host_name = host_name
            .filter(|h| !h.is_empty())
            .ok_or("missing HostName")?;
        let device_id = device_id
            .filter(|d| !d.is_empty())
            .ok_or("missing DeviceId")?;
        let auth = auth.ok_or("missing SharedAccessKey or SharedAccessSignature")?;

        Ok(Self {
            host_name,
            device_id,
            auth,
        })
    }
}

impl ConnectionString {
    /// Password for the MQTT CONNECT packet, valid for `ttl` from `now`.
    pub fn password(&self, now: DateTime<Utc>, ttl: Duration) -> Result<String, String> {
        match &self.auth {
            Auth::SharedAccessSignature(token) => Ok(token.clone()),
            Auth::SharedAccessKey(key) => {
                let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
                let expiry = now.timestamp().saturating_add(ttl);
                sas_token(&self.host_name, &self.device_id, key, expiry)
            }
        }
    }

    /// MQTT username IoT Hub expects for this device.
    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version=2021-04-12",
            self.host_name, self.device_id
        )
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = match self.auth {
            Auth::SharedAccessKey(_) => "SharedAccessKey",
            Auth::SharedAccessSignature(_) => "SharedAccessSignature",
        };
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("auth", &format_args!("{}(***)", auth))
            .finish()
    }
}

/// Signs `sr + "\n" + se` with the device key.
pub fn sas_token(host: &str, device_id: &str, key: &str, expiry: i64) -> Result<String, String> {
    let resource = url_encode(&format!("{}/devices/{}", host, device_id));
    let key = BASE64_STANDARD
        .decode(key)
        .map_err(|e| format!("SharedAccessKey is not valid base64: {}", e))?;

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| e.to_string())?;
    mac.update(format!("{}\n{}", resource, expiry).as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        resource,
        url_encode(&signature),
        expiry
    ))
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "c2VjcmV0LWRldmljZS1rZXk=";

    fn conn(device: &str) -> String {
        format!(
            "HostName=rideau.azure-devices.net;DeviceId={};SharedAccessKey={}",
            device, KEY
        )
    }

    #[test]
    fn test_parse_shared_access_key() {
        let parsed: ConnectionString = conn("device_A").parse().unwrap();
        assert_eq!(parsed.host_name, "rideau.azure-devices.net");
        assert_eq!(parsed.device_id, "device_A");
        assert_eq!(
            parsed.username(),
            "rideau.azure-devices.net/device_A/?api-version=2021-04-12"
        );
    }

    #[test]
    fn test_parse_missing_parts() {
        assert!("DeviceId=a;SharedAccessKey=c2VjcmV0".parse::<ConnectionString>().is_err());
        assert!("HostName=h;SharedAccessKey=c2VjcmV0".parse::<ConnectionString>().is_err());
        assert!("HostName=h;DeviceId=a".parse::<ConnectionString>().is_err());
        assert!("HostName=h;DeviceId=a;SharedAccessKey=%%%".parse::<ConnectionString>().is_err());
        assert!("garbage".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let parsed: ConnectionString = conn("device_A").parse().unwrap();
        let debug = format!("{:?}", parsed);
        assert!(!debug.contains(KEY));
        assert!(debug.contains("device_A"));
    }

    #[test]
    fn test_sas_token_shape() {
        let parsed: ConnectionString = conn("device_A").parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let token = parsed.password(now, Duration::from_secs(3600)).unwrap();

        assert!(token.starts_with(
            "SharedAccessSignature sr=rideau.azure-devices.net%2Fdevices%2Fdevice_A&sig="
        ));
        assert!(token.ends_with(&format!("&se={}", now.timestamp() + 3600)));

        // Deterministic for the same inputs
        let again = parsed.password(now, Duration::from_secs(3600)).unwrap();
        assert_eq!(token, again);
    }

    #[test]
    fn test_huge_ttl_saturates_expiry() {
        let parsed: ConnectionString = conn("device_A").parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let token = parsed.password(now, Duration::from_secs(u64::MAX)).unwrap();
        assert!(token.ends_with(&format!("&se={}", i64::MAX)));
    }

    #[test]
    fn test_pre_issued_signature_passes_through() {
        let s = "HostName=h;DeviceId=a;SharedAccessSignature=SharedAccessSignature sr=x&sig=y&se=1";
        let parsed: ConnectionString = s.parse().unwrap();
        let token = parsed.password(Utc::now(), Duration::from_secs(60)).unwrap();
        assert_eq!(token, "SharedAccessSignature sr=x&sig=y&se=1");
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("a/b+c=d"), "a%2Fb%2Bc%3Dd");
        assert_eq!(url_encode("Dow's Lake"), "Dow%27s%20Lake");
    }
}
