use actix_web::dev::ServiceRequest;
use actix_web::http::StatusCode;
use actix_web::ResponseError;
use std::fmt::{Display, Formatter};
use std::net::{AddrParseError, IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, KeyError>>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Rate limit key must not be empty")]
    Empty,
    #[error("Request has no {0} address")]
    MissingAddress(&'static str),
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIp(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Invalid rate limit key: {0}")]
    Invalid(String),
}

impl ResponseError for KeyError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

/// Identifies the origin of a request; each distinct key gets its own counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Utility to create a function that derives a [ClientKey] from a request.
///
/// Selected components are joined with `/` in the order: custom key, real IP, peer IP, path,
/// custom function. The path keeps its own leading `/` rather than adding a second one. A
/// request that yields no usable key is an error, never a shared bucket.
pub struct KeyFunctionBuilder {
    real_ip_key: bool,
    peer_ip_key: bool,
    path_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl Default for KeyFunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyFunctionBuilder {
    pub fn new() -> Self {
        Self {
            real_ip_key: false,
            peer_ip_key: false,
            path_key: false,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Adds the client's real IP to the key.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which trusts `Forwarded` / `X-Forwarded-For`, so it is only suitable behind a
    /// proxy that you control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the key.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
        self
    }

    /// Add the request path to the key
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add a static component, useful as a namespace
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a custom component to the key
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, KeyError> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> Result<ClientKey, KeyError> + 'static {
        move |req| {
            let mut components = Vec::new();
            if let Some(custom) = &self.custom_key {
                components.push(custom.clone());
            }
            if self.real_ip_key || self.peer_ip_key {
                let info = req.connection_info();
                if self.real_ip_key {
                    let addr = info
                        .realip_remote_addr()
                        .ok_or(KeyError::MissingAddress("real"))?;
                    components.push(ip_key(addr)?);
                }
                if self.peer_ip_key {
                    let addr = info.peer_addr().ok_or(KeyError::MissingAddress("peer"))?;
                    components.push(ip_key(addr)?);
                }
            }
            let mut key = components.join("/");
            if self.path_key {
                key.push_str(req.path());
            }
            if let Some(f) = &self.custom_fn {
                if !key.is_empty() {
                    key.push('/');
                }
                key.push_str(&f(req)?);
            }
            ClientKey::new(key)
        }
    }
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(addr: &str) -> Result<String, KeyError> {
    let ip = match addr.parse::<IpAddr>() {
        Ok(ip) => ip,
        // Forwarded headers may carry a port
        Err(e) => addr.parse::<SocketAddr>().map(|s| s.ip()).map_err(|_| e)?,
    };
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{subnet}/64")
        }
    })
}
