use crate::error::ConnectionError;

const CONNECT_METHOD: &[u8] = b"CONNECT";

/// Target of a CONNECT tunnel, taken from the request line only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub host: String,
    pub port: String,
}

impl TunnelRequest {
    /// Parses `CONNECT <host>:<port> <version>\r\n...`.
    ///
    /// Only the first line is looked at. The target is split on `:` and the
    /// first two pieces are taken as host and port, so bracketed IPv6
    /// literals are not supported.
    pub fn parse(buf: &[u8]) -> Result<Self, ConnectionError> {
        if !buf.starts_with(CONNECT_METHOD) {
            return Err(ConnectionError::NotATunnelRequest);
        }

        let line = match find_crlf(buf) {
            Some(pos) => &buf[..pos],
            None => buf,
        };

        let target = line
            .split(|b| *b == b' ')
            .nth(1)
            .ok_or(ConnectionError::MalformedTarget)?;

        let mut pieces = target.split(|b| *b == b':');
        let host = pieces.next().ok_or(ConnectionError::MalformedTarget)?;
        let port = pieces.next().ok_or(ConnectionError::MalformedTarget)?;

        Ok(Self {
            host: to_string(host)?,
            port: to_string(port)?,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn to_string(bytes: &[u8]) -> Result<String, ConnectionError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ConnectionError::MalformedTarget)
}
